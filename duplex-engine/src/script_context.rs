//! `ScriptContext` is the seam to the external sandbox provider (spec.md §1:
//! "the JS sandbox implementation... an opaque script context with
//! `eval(code) -> value` and `setGlobal/getGlobal`"). This crate ships no
//! sandbox; `NullScriptContext` is a non-bundled, in-memory stand-in used by
//! tests and as a reference implementation of the contract.
use async_trait::async_trait;
use duplex_protocol::Value;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// A native host function bound into the sandbox (spec.md §6.2 globals like
/// `__getConfig`, `__registerCallback`). Unlike `Value::Function`, which
/// models a fire-and-forget boundary-crossing proxy, this runs in-process
/// and returns a real value synchronously to the calling script.
pub type NativeFn = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// The boundary an Engine drives. Implementations wrap a real JS (or other
/// scripting) sandbox; this crate only defines the contract (spec.md §4.6,
/// §6.2).
#[async_trait]
pub trait ScriptContext: Send + Sync {
    /// Run `code` synchronously, returning its result.
    fn eval(&self, code: &str) -> anyhow::Result<Value>;

    /// Run `code`, awaiting completion for sandboxes that only support async
    /// evaluation (spec.md §4.6 point 3: the Engine must await the
    /// helper-install eval before executing the bundle).
    async fn eval_async(&self, code: &str) -> anyhow::Result<Value>;

    /// Bind `name` in the sandbox's global scope to `value`.
    fn set_global(&self, name: &str, value: Value);

    /// Read a sandbox global back out, if it is set.
    fn get_global(&self, name: &str) -> Option<Value>;

    /// Bind `name` to a native Rust function callable from sandboxed code
    /// with a real return value (spec.md §6.2's runtime globals table).
    fn set_native_fn(&self, name: &str, f: NativeFn);

    /// Tear down the underlying context/runtime. Called by `Engine::force_destroy`,
    /// which tolerates a failure here rather than propagating it (spec.md
    /// §4.6 point 5: "disposes context and runtime, tolerating disposal
    /// exceptions").
    fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory, non-sandboxed `ScriptContext` (spec.md §6.4: "a documented
/// non-bundled stand-in"). `eval`/`eval_async` do not interpret `code` at
/// all — they exist so `Engine`'s lifecycle state machine (load, timeout,
/// force-destroy) can be exercised without a real sandbox. Real embedders
/// supply their own implementation.
#[derive(Default)]
pub struct NullScriptContext {
    globals: Mutex<FxHashMap<String, Value>>,
    natives: Mutex<FxHashMap<String, NativeFn>>,
}

impl std::fmt::Debug for NullScriptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NullScriptContext")
            .field("globals", &self.globals.lock().len())
            .field("natives", &self.natives.lock().len())
            .finish()
    }
}

impl NullScriptContext {
    pub fn new() -> Self {
        NullScriptContext::default()
    }

    /// Simulate sandboxed code calling a native function bound via
    /// `set_native_fn`, for tests that exercise the runtime globals without
    /// a real script engine.
    pub fn call_native(&self, name: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let f = self
            .natives
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no native function bound as {name:?}"))?;
        f(args)
    }
}

#[async_trait]
impl ScriptContext for NullScriptContext {
    fn eval(&self, _code: &str) -> anyhow::Result<Value> {
        Ok(Value::Undefined)
    }

    async fn eval_async(&self, code: &str) -> anyhow::Result<Value> {
        self.eval(code)
    }

    fn set_global(&self, name: &str, value: Value) {
        self.globals.lock().insert(name.to_string(), value);
    }

    fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.lock().get(name).cloned()
    }

    fn set_native_fn(&self, name: &str, f: NativeFn) {
        self.natives.lock().insert(name.to_string(), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn null_context_round_trips_globals() {
        let ctx = NullScriptContext::new();
        assert!(ctx.get_global("x").is_none());
        ctx.set_global("x", Value::Number(1.0));
        assert_eq!(ctx.get_global("x"), Some(Value::Number(1.0)));
        assert_eq!(ctx.eval_async("1+1").await.unwrap(), Value::Undefined);
    }

    #[test]
    fn native_fn_round_trips_through_call_native() {
        let ctx = NullScriptContext::new();
        ctx.set_native_fn("double", Arc::new(|args| match args.first() {
            Some(Value::Number(n)) => Ok(Value::Number(n * 2.0)),
            _ => anyhow::bail!("expected a number"),
        }));
        assert_eq!(ctx.call_native("double", vec![Value::Number(21.0)]).unwrap(), Value::Number(42.0));
        assert!(ctx.call_native("missing", vec![]).is_err());
    }
}
