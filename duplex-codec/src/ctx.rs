//! Encode/decode contexts and the decode-side function proxy (spec.md §4.3,
//! §9 "Tagged envelopes vs. runtime type checks").
use crate::rules::RuleTable;
use crate::wire::Wire;
use anyhow::anyhow;
use duplex_protocol::{Callable, FnId, PromiseId, Value};
use duplex_registry::{CallbackRegistry, PromiseManager};
use std::{fmt, sync::Arc};

/// Default recursion cap shared by encode and decode (spec.md §4.3, "cycles
/// are not representable; depth is capped at 50").
pub const DEFAULT_MAX_DEPTH: usize = 50;

/// Invoked when a Guest/Host-owned function proxy is called from the
/// opposite side; the Bridge supplies the real implementation (turning this
/// into a `CALL_FUNCTION` message over the channel).
pub type RemoteCallSender = Arc<dyn Fn(FnId, Vec<Value>) -> anyhow::Result<()> + Send + Sync>;

/// Invoked when a live promise registered during encode settles; the Bridge
/// supplies the real implementation (turning this into a
/// `PROMISE_RESOLVE`/`PROMISE_REJECT` message to the peer).
pub type PromiseSettleSender = Arc<dyn Fn(PromiseId, Result<Value, Value>) + Send + Sync>;

/// Invoked once per *freshly* registered callback during an encode pass (not
/// when a value re-encodes an id it already carried). The Bridge uses this
/// to track which `fnId`s a structural op's props introduced, so a later
/// `REMOVE`/`DELETE` knows what to release (spec.md §9, "Subtree-scoped
/// callback release").
pub type OnRegister = Arc<dyn Fn(FnId) + Send + Sync>;

fn no_op_on_register() -> OnRegister {
    Arc::new(|_| {})
}

/// A decode-side stand-in for a function that really lives on the other side
/// of the boundary. Calling it forwards the call through `sender` rather
/// than running anything locally (spec.md §4.3 rule 4/5, §7 "fire-and-forget").
pub struct CallbackProxy {
    pub fn_id: FnId,
    pub source: Option<String>,
    pub sender: RemoteCallSender,
}

impl fmt::Debug for CallbackProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackProxy").field("fn_id", &self.fn_id).finish()
    }
}

impl Callable for CallbackProxy {
    fn call(&self, args: Vec<Value>) -> anyhow::Result<()> {
        (self.sender)(self.fn_id, args)
    }

    fn fn_id(&self) -> Option<FnId> {
        Some(self.fn_id)
    }

    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

/// Per-call state threaded through a single `encode` invocation.
pub struct EncodeCtx<'a> {
    rules: &'a RuleTable,
    pub registry: &'a CallbackRegistry,
    pub promises: &'a PromiseManager,
    pub on_promise_settle: PromiseSettleSender,
    pub on_register: OnRegister,
    pub max_depth: usize,
    depth: usize,
}

impl<'a> EncodeCtx<'a> {
    pub fn new(
        rules: &'a RuleTable,
        registry: &'a CallbackRegistry,
        promises: &'a PromiseManager,
        on_promise_settle: PromiseSettleSender,
    ) -> Self {
        EncodeCtx {
            rules,
            registry,
            promises,
            on_promise_settle,
            on_register: no_op_on_register(),
            max_depth: DEFAULT_MAX_DEPTH,
            depth: 0,
        }
    }

    pub fn with_on_register(mut self, on_register: OnRegister) -> Self {
        self.on_register = on_register;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Encode one value, respecting the recursion cap. Exceeding the cap
    /// yields the circular marker rather than an error: a pathologically
    /// deep tree is treated the same as an actual cycle (spec.md §4.3 rule
    /// 3) since this representation can't distinguish the two.
    pub fn encode(&mut self, v: &Value) -> anyhow::Result<Wire> {
        if self.depth >= self.max_depth {
            return Ok(Wire::Circular);
        }
        self.depth += 1;
        let rules = self.rules;
        let result = rules.dispatch_encode(v, self);
        self.depth -= 1;
        result
    }
}

/// Per-call state threaded through a single `decode` invocation.
pub struct DecodeCtx<'a> {
    rules: &'a RuleTable,
    pub registry: &'a CallbackRegistry,
    pub promises: &'a PromiseManager,
    pub sender: RemoteCallSender,
    pub max_depth: usize,
    depth: usize,
}

impl<'a> DecodeCtx<'a> {
    pub fn new(
        rules: &'a RuleTable,
        registry: &'a CallbackRegistry,
        promises: &'a PromiseManager,
        sender: RemoteCallSender,
    ) -> Self {
        DecodeCtx { rules, registry, promises, sender, max_depth: DEFAULT_MAX_DEPTH, depth: 0 }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn decode(&mut self, w: &Wire) -> anyhow::Result<Value> {
        if self.depth >= self.max_depth {
            return Ok(Value::Undefined);
        }
        self.depth += 1;
        let rules = self.rules;
        let result = rules.dispatch_decode(w, self);
        self.depth -= 1;
        result
    }
}

/// Encode a single value with a fresh top-level context.
pub fn encode(
    v: &Value,
    rules: &RuleTable,
    registry: &CallbackRegistry,
    promises: &PromiseManager,
    on_promise_settle: PromiseSettleSender,
) -> anyhow::Result<Wire> {
    EncodeCtx::new(rules, registry, promises, on_promise_settle).encode(v)
}

/// Decode a single value with a fresh top-level context.
pub fn decode(
    w: &Wire,
    rules: &RuleTable,
    registry: &CallbackRegistry,
    promises: &PromiseManager,
    sender: RemoteCallSender,
) -> anyhow::Result<Value> {
    DecodeCtx::new(rules, registry, promises, sender).decode(w)
}

pub(crate) fn parse_fn_id(s: &str) -> anyhow::Result<FnId> {
    s.parse::<FnId>().map_err(|e| anyhow!("bad fnId {s}: {e}"))
}

pub(crate) fn parse_promise_id(s: &str) -> anyhow::Result<PromiseId> {
    s.parse::<PromiseId>().map_err(|e| anyhow!("bad promiseId {s}: {e}"))
}
