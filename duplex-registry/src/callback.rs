//! Callback Registry (spec.md §4.1): a refcounted table giving Guest/Host
//! closures a stable, transferable identity.
use duplex_protocol::{Callable, FnId, Side, Value};
use fxhash::FxHashMap;
use log::{error, warn};
use parking_lot::RwLock;
use std::sync::{atomic::{AtomicU64, Ordering}, Arc};

struct Entry {
    callable: Arc<dyn Callable>,
    refcount: usize,
}

/// One side's table of live closures. Ids minted here carry this registry's
/// `Side` tag so a peer can tell, from the id alone, which side owns the
/// real function (spec.md §4.1).
pub struct CallbackRegistry {
    side: Side,
    next: AtomicU64,
    entries: RwLock<FxHashMap<FnId, Entry>>,
    /// In debug mode a synchronous throw inside `invoke` is propagated to
    /// the caller instead of being logged and swallowed (spec.md §4.1, §7).
    debug: bool,
}

impl CallbackRegistry {
    pub fn new(side: Side) -> Self {
        CallbackRegistry::with_debug(side, false)
    }

    pub fn with_debug(side: Side, debug: bool) -> Self {
        CallbackRegistry {
            side,
            next: AtomicU64::new(0),
            entries: RwLock::new(FxHashMap::default()),
            debug,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Insert `fn` with an initial refcount of 1, returning its new id.
    /// Duplicate registrations of the same closure value yield distinct ids
    /// deliberately (spec.md §4.1: "cheaper than dedup; the protocol is
    /// idempotent in practice").
    pub fn register(&self, callable: Arc<dyn Callable>) -> FnId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let id = FnId::new(self.side, n);
        self.entries.write().insert(id, Entry { callable, refcount: 1 });
        id
    }

    pub fn retain(&self, id: FnId) {
        if let Some(e) = self.entries.write().get_mut(&id) {
            e.refcount += 1;
        }
    }

    /// Decrement the refcount, dropping the entry once it reaches zero.
    pub fn release(&self, id: FnId) {
        let mut entries = self.entries.write();
        let drop_it = match entries.get_mut(&id) {
            None => false,
            Some(e) => {
                e.refcount = e.refcount.saturating_sub(1);
                e.refcount == 0
            }
        };
        if drop_it {
            entries.remove(&id);
        }
    }

    /// Look up `id` and invoke it. A missing id logs a warning and returns
    /// `Value::Undefined`. A synchronous error from the callable is logged
    /// and swallowed unless the registry is in debug mode, in which case it
    /// is re-raised (spec.md §4.1).
    pub fn invoke(&self, id: FnId, args: Vec<Value>) -> anyhow::Result<Value> {
        let callable = {
            let entries = self.entries.read();
            match entries.get(&id) {
                Some(e) => e.callable.clone(),
                None => {
                    warn!("invoke: unknown fnId {id}");
                    return Ok(Value::Undefined);
                }
            }
        };
        match callable.call(args) {
            Ok(()) => Ok(Value::Undefined),
            Err(e) if self.debug => Err(e),
            Err(e) => {
                error!("callback {id} threw: {e:?}");
                Ok(Value::Undefined)
            }
        }
    }

    pub fn has(&self, id: FnId) -> bool {
        self.entries.read().contains_key(&id)
    }

    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Every live entry's id and callable, for building the `__callbacks`
    /// runtime global (spec.md §6.2) — a read-only snapshot, not a live view.
    pub fn snapshot(&self) -> Vec<(FnId, Arc<dyn Callable>)> {
        self.entries.read().iter().map(|(id, e)| (*id, e.callable.clone())).collect()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("side", &self.side)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Counter(Arc<Mutex<u32>>);

    impl Callable for Counter {
        fn call(&self, _args: Vec<Value>) -> anyhow::Result<()> {
            *self.0.lock() += 1;
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Thrower;

    impl Callable for Thrower {
        fn call(&self, _args: Vec<Value>) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn register_invoke_release() {
        let reg = CallbackRegistry::new(Side::Guest);
        let count = Arc::new(Mutex::new(0));
        let id = reg.register(Arc::new(Counter(count.clone())));
        reg.invoke(id, vec![]).unwrap();
        reg.invoke(id, vec![]).unwrap();
        assert_eq!(*count.lock(), 2);
        assert!(reg.has(id));
        reg.release(id);
        assert!(!reg.has(id));
    }

    #[test]
    fn refcount_keeps_entry_alive_until_zero() {
        let reg = CallbackRegistry::new(Side::Host);
        let id = reg.register(Arc::new(Counter(Arc::new(Mutex::new(0)))));
        reg.retain(id);
        reg.release(id);
        assert!(reg.has(id), "still retained once");
        reg.release(id);
        assert!(!reg.has(id));
    }

    #[test]
    fn unknown_id_warns_and_returns_undefined() {
        let reg = CallbackRegistry::new(Side::Guest);
        let bogus = FnId::new(Side::Guest, 999);
        assert_eq!(reg.invoke(bogus, vec![]).unwrap(), Value::Undefined);
    }

    #[test]
    fn throw_is_swallowed_outside_debug_mode() {
        let reg = CallbackRegistry::new(Side::Guest);
        let id = reg.register(Arc::new(Thrower));
        assert_eq!(reg.invoke(id, vec![]).unwrap(), Value::Undefined);
    }

    #[test]
    fn throw_is_reraised_in_debug_mode() {
        let reg = CallbackRegistry::with_debug(Side::Guest, true);
        let id = reg.register(Arc::new(Thrower));
        assert!(reg.invoke(id, vec![]).is_err());
    }

    #[test]
    fn clear_drops_everything() {
        let reg = CallbackRegistry::new(Side::Guest);
        reg.register(Arc::new(Counter(Arc::new(Mutex::new(0)))));
        reg.register(Arc::new(Counter(Arc::new(Mutex::new(0)))));
        assert_eq!(reg.size(), 2);
        reg.clear();
        assert_eq!(reg.size(), 0);
    }
}
