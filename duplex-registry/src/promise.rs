//! Promise Manager (spec.md §4.2): lets a value still pending on one side
//! cross the boundary and settle later on the other.
use duplex_protocol::{PromiseFuture, PromiseId, Value, ValuePromise};
use fxhash::FxHashMap;
use log::debug;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

/// Default manager timeout; `Duration::ZERO` disables it (spec.md §4.2).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

struct Pending {
    tx: futures::channel::oneshot::Sender<Result<Value, Value>>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    pending: FxHashMap<PromiseId, Pending>,
    registered: FxHashMap<PromiseId, JoinHandle<()>>,
}

fn complete(inner: &Mutex<Inner>, id: PromiseId, result: Result<Value, Value>) {
    let entry = inner.lock().pending.remove(&id);
    match entry {
        None => debug!("settle: unknown promiseId {id}"),
        Some(Pending { tx, timer }) => {
            if let Some(t) = timer {
                t.abort();
            }
            let _ = tx.send(result);
        }
    }
}

fn timeout_error(id: PromiseId, timeout: Duration) -> Value {
    Value::Error {
        name: arcstr::literal!("Error"),
        message: arcstr::ArcStr::from(format!(
            "Promise {id} timed out after {}ms",
            timeout.as_millis()
        )),
        stack: None,
    }
}

/// Cheaply cloneable handle; the real state lives behind an `Arc` so the
/// timeout task spawned by `create_pending` can reach back into it without
/// borrowing `self`.
#[derive(Clone)]
pub struct PromiseManager {
    timeout: Duration,
    next: Arc<AtomicU64>,
    inner: Arc<Mutex<Inner>>,
}

impl PromiseManager {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        PromiseManager {
            timeout,
            next: Arc::new(AtomicU64::new(0)),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn next_id(&self) -> PromiseId {
        PromiseId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a live, not-yet-sent promise. Spawns a task that awaits it
    /// and invokes `on_settle(id, result)` once it resolves — the caller is
    /// expected to turn that into a `PROMISE_RESOLVE`/`PROMISE_REJECT`
    /// message to the peer. Returns `None` if `promise` has already been
    /// taken (e.g. double registration).
    pub fn register(
        &self,
        promise: &ValuePromise,
        on_settle: impl FnOnce(PromiseId, Result<Value, Value>) + Send + 'static,
    ) -> Option<PromiseId> {
        let fut: PromiseFuture = promise.take_live()?;
        let id = self.next_id();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            inner.lock().registered.remove(&id);
            on_settle(id, result);
        });
        self.inner.lock().registered.insert(id, handle);
        Some(id)
    }

    /// The decode-side counterpart: returns a `Value::Promise` that resolves
    /// once `settle` is called with this id, or rejects on timeout.
    pub fn create_pending(&self, id: PromiseId) -> Value {
        let (tx, rx) = futures::channel::oneshot::channel();
        let timer = if self.timeout.is_zero() {
            None
        } else {
            let inner = self.inner.clone();
            let timeout = self.timeout;
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                complete(&inner, id, Err(timeout_error(id, timeout)));
            }))
        };
        self.inner.lock().pending.insert(id, Pending { tx, timer });
        Value::Promise(ValuePromise::pending(id, rx))
    }

    /// Fulfill or reject the pending promise registered under `id`.
    /// Settling an unknown id is a no-op (spec.md §4.2).
    pub fn settle(&self, id: PromiseId, result: Result<Value, Value>) {
        complete(&self.inner, id, result);
    }

    /// Resolve every pending promise with `Value::Undefined` rather than
    /// letting them hang or reject, avoiding a destroy-time storm of
    /// unhandled rejections (spec.md §3.5, §4.2); clear all timers and
    /// reset the id counter.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, Pending { tx, timer }) in inner.pending.drain() {
            if let Some(t) = timer {
                t.abort();
            }
            let _ = tx.send(Ok(Value::Undefined));
        }
        for (_, handle) in inner.registered.drain() {
            handle.abort();
        }
        drop(inner);
        self.next.store(0, Ordering::Relaxed);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl Default for PromiseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PromiseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseManager")
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test(flavor = "current_thread")]
    async fn settle_fulfills_the_pending_value() {
        let mgr = PromiseManager::new();
        let id = mgr.next_id();
        let v = mgr.create_pending(id);
        mgr.settle(id, Ok(Value::Number(42.0)));
        match v {
            Value::Promise(p) => match p.as_ref() {
                ValuePromise::Pending(_, rx) => {
                    let rx = rx.lock().take().unwrap();
                    assert_eq!(rx.await.unwrap(), Ok(Value::Number(42.0)));
                }
                _ => panic!("expected pending"),
            },
            _ => panic!("expected promise"),
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn timeout_rejects_with_a_descriptive_message() {
        let mgr = PromiseManager::with_timeout(StdDuration::from_millis(50));
        let id = mgr.next_id();
        let v = mgr.create_pending(id);
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        match v {
            Value::Promise(p) => match p.as_ref() {
                ValuePromise::Pending(_, rx) => {
                    let rx = rx.lock().take().unwrap();
                    let result = rx.await.unwrap();
                    match result {
                        Err(Value::Error { message, .. }) => {
                            assert!(message.contains("timed out"))
                        }
                        _ => panic!("expected timeout error"),
                    }
                }
                _ => panic!("expected pending"),
            },
            _ => panic!("expected promise"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn settling_unknown_id_is_a_noop() {
        let mgr = PromiseManager::new();
        mgr.settle(PromiseId::new(999), Ok(Value::Null));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn clear_resolves_everything_with_undefined() {
        let mgr = PromiseManager::new();
        let id = mgr.next_id();
        let v = mgr.create_pending(id);
        mgr.clear();
        match v {
            Value::Promise(p) => match p.as_ref() {
                ValuePromise::Pending(_, rx) => {
                    let rx = rx.lock().take().unwrap();
                    assert_eq!(rx.await.unwrap(), Ok(Value::Undefined));
                }
                _ => panic!("expected pending"),
            },
            _ => panic!("expected promise"),
        }
    }
}
