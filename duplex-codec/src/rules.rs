//! The ordered type-rule table (spec.md §4.3): each rule owns one `Value`
//! shape and its `Wire` envelope. Dispatch is linear, first-match-wins, so
//! rule order matters — it mirrors the rule table in spec.md §4.3 exactly.
use crate::ctx::{parse_fn_id, parse_promise_id, CallbackProxy, DecodeCtx, EncodeCtx};
use crate::wire::Wire;
use anyhow::{anyhow, Context};
use arcstr::ArcStr;
use chrono::{DateTime, Utc};
use duplex_protocol::{TypedArray, Value};
use indexmap::IndexMap;
use std::sync::Arc;

const MAX_SOURCE_LEN: usize = 500;

fn truncate_source(s: &str) -> String {
    if s.len() <= MAX_SOURCE_LEN {
        s.to_string()
    } else {
        s.chars().take(MAX_SOURCE_LEN).collect()
    }
}

/// One entry in the ordered rule table: owns a `Value`/`Wire` pair and
/// decides, by pattern match, whether it applies to a given value. Returning
/// `None` lets the next rule in the table try.
pub trait TypeRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, value: &Value, ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>>;
    fn decode(&self, wire: &Wire, ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>>;
}

struct NullRule;
impl TypeRule for NullRule {
    fn name(&self) -> &'static str {
        "null"
    }
    fn encode(&self, v: &Value, _ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Null => Some(Ok(Wire::Null)),
            Value::Undefined => Some(Ok(Wire::Undefined)),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, _ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Null => Some(Ok(Value::Null)),
            Wire::Undefined | Wire::Circular => Some(Ok(Value::Undefined)),
            _ => None,
        }
    }
}

struct BoolRule;
impl TypeRule for BoolRule {
    fn name(&self) -> &'static str {
        "bool"
    }
    fn encode(&self, v: &Value, _ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Bool(b) => Some(Ok(Wire::Bool(*b))),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, _ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Bool(b) => Some(Ok(Value::Bool(*b))),
            _ => None,
        }
    }
}

struct NumberRule;
impl TypeRule for NumberRule {
    fn name(&self) -> &'static str {
        "number"
    }
    fn encode(&self, v: &Value, _ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Number(n) => Some(Ok(Wire::Number(*n))),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, _ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Number(n) => Some(Ok(Value::Number(*n))),
            _ => None,
        }
    }
}

struct StringRule;
impl TypeRule for StringRule {
    fn name(&self) -> &'static str {
        "string"
    }
    fn encode(&self, v: &Value, _ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::String(s) => Some(Ok(Wire::String(s.to_string()))),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, _ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::String(s) => Some(Ok(Value::String(ArcStr::from(s.as_str())))),
            _ => None,
        }
    }
}

/// Rule 4/5: function proxy. Encoding registers the real closure the first
/// time it crosses (a re-encoded proxy reuses its existing id instead of
/// minting a new one); decoding never runs anything local, it builds a
/// `CallbackProxy` that forwards through the injected sender.
struct FunctionRule;
impl TypeRule for FunctionRule {
    fn name(&self) -> &'static str {
        "function"
    }
    fn encode(&self, v: &Value, ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Function(callable) => {
                let id = match callable.fn_id() {
                    Some(id) => id,
                    None => {
                        let id = ctx.registry.register(callable.clone());
                        (ctx.on_register)(id);
                        id
                    }
                };
                let source = callable.source().map(truncate_source);
                Some(Ok(Wire::Function { fn_id: id.to_string(), source }))
            }
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Function { fn_id, source } => Some((|| {
                let fn_id = parse_fn_id(fn_id)?;
                Ok(Value::Function(Arc::new(CallbackProxy {
                    fn_id,
                    source: source.clone(),
                    sender: ctx.sender.clone(),
                })))
            })()),
            _ => None,
        }
    }
}

/// Rule 6/7: promise. Encoding a still-live promise registers it with the
/// promise manager and reports its settlement through `on_promise_settle`;
/// an already-registered promise (re-encoded, e.g. logged twice) just
/// forwards its existing id. Decoding always produces a pending handle.
struct PromiseRule;
impl TypeRule for PromiseRule {
    fn name(&self) -> &'static str {
        "promise"
    }
    fn encode(&self, v: &Value, ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Promise(p) => Some((|| {
                if let Some(id) = p.promise_id() {
                    return Ok(Wire::Promise { promise_id: id.to_string() });
                }
                let on_settle = ctx.on_promise_settle.clone();
                let id = ctx
                    .promises
                    .register(p, move |id, result| on_settle(id, result))
                    .ok_or_else(|| anyhow!("promise already registered"))?;
                Ok(Wire::Promise { promise_id: id.to_string() })
            })()),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Promise { promise_id } => Some((|| {
                let id = parse_promise_id(promise_id)?;
                Ok(ctx.promises.create_pending(id))
            })()),
            _ => None,
        }
    }
}

struct DateRule;
impl TypeRule for DateRule {
    fn name(&self) -> &'static str {
        "date"
    }
    fn encode(&self, v: &Value, _ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Date(dt) => Some(Ok(Wire::Date(dt.to_rfc3339()))),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, _ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Date(s) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| Value::Date(dt.with_timezone(&Utc)))
                    .with_context(|| format!("bad date {s}")),
            ),
            _ => None,
        }
    }
}

struct RegexpRule;
impl TypeRule for RegexpRule {
    fn name(&self) -> &'static str {
        "regexp"
    }
    fn encode(&self, v: &Value, _ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Regexp { source, flags } => {
                Some(Ok(Wire::Regexp { source: source.to_string(), flags: flags.to_string() }))
            }
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, _ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Regexp { source, flags } => Some(Ok(Value::Regexp {
                source: ArcStr::from(source.as_str()),
                flags: ArcStr::from(flags.as_str()),
            })),
            _ => None,
        }
    }
}

struct ErrorRule;
impl TypeRule for ErrorRule {
    fn name(&self) -> &'static str {
        "error"
    }
    fn encode(&self, v: &Value, _ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Error { name, message, stack } => Some(Ok(Wire::Error {
                name: name.to_string(),
                message: message.to_string(),
                stack: stack.as_ref().map(|s| s.to_string()),
            })),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, _ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Error { name, message, stack } => Some(Ok(Value::Error {
                name: ArcStr::from(name.as_str()),
                message: ArcStr::from(message.as_str()),
                stack: stack.as_ref().map(|s| ArcStr::from(s.as_str())),
            })),
            _ => None,
        }
    }
}

struct MapRule;
impl TypeRule for MapRule {
    fn name(&self) -> &'static str {
        "map"
    }
    fn encode(&self, v: &Value, ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Map(entries) => Some((|| {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((ctx.encode(k)?, ctx.encode(v)?));
                }
                Ok(Wire::Map(out))
            })()),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Map(entries) => Some((|| {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((ctx.decode(k)?, ctx.decode(v)?));
                }
                Ok(Value::Map(out))
            })()),
            _ => None,
        }
    }
}

struct SetRule;
impl TypeRule for SetRule {
    fn name(&self) -> &'static str {
        "set"
    }
    fn encode(&self, v: &Value, ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Set(items) => Some((|| {
                let mut out = Vec::with_capacity(items.len());
                for v in items {
                    out.push(ctx.encode(v)?);
                }
                Ok(Wire::Set(out))
            })()),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Set(items) => Some((|| {
                let mut out = Vec::with_capacity(items.len());
                for v in items {
                    out.push(ctx.decode(v)?);
                }
                Ok(Value::Set(out))
            })()),
            _ => None,
        }
    }
}

struct TypedArrayRule;
impl TypeRule for TypedArrayRule {
    fn name(&self) -> &'static str {
        "typedarray"
    }
    fn encode(&self, v: &Value, _ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::TypedArray(ta) => Some(Ok(Wire::TypedArray {
                ctor: ta.ctor.as_ref().map(|c| c.to_string()),
                data: ta.bytes.clone(),
                bigint: ta.bigint,
            })),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, _ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::TypedArray { ctor, data, bigint } => Some(Ok(Value::TypedArray(TypedArray {
                ctor: ctor.as_ref().map(|c| ArcStr::from(c.as_str())),
                bytes: data.clone(),
                bigint: *bigint,
            }))),
            _ => None,
        }
    }
}

/// Rule 14: a raw `ArrayBuffer`, distinct from rule 13's constructor-tagged
/// typed array.
struct BytesRule;
impl TypeRule for BytesRule {
    fn name(&self) -> &'static str {
        "arraybuffer"
    }
    fn encode(&self, v: &Value, _ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Bytes(b) => Some(Ok(Wire::ArrayBuffer(b.clone()))),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, _ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::ArrayBuffer(data) => Some(Ok(Value::Bytes(data.clone()))),
            _ => None,
        }
    }
}

struct ArrayRule;
impl TypeRule for ArrayRule {
    fn name(&self) -> &'static str {
        "array"
    }
    fn encode(&self, v: &Value, ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Array(items) => Some((|| {
                let mut out = Vec::with_capacity(items.len());
                for v in items {
                    out.push(ctx.encode(v)?);
                }
                Ok(Wire::Array(out))
            })()),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Array(items) => Some((|| {
                let mut out = Vec::with_capacity(items.len());
                for v in items {
                    out.push(ctx.decode(v)?);
                }
                Ok(Value::Array(out))
            })()),
            _ => None,
        }
    }
}

/// Catch-all: a plain object. Must stay last in the table since every other
/// rule's wire envelope is itself a JSON object distinguished by `__type`.
struct ObjectRule;
impl TypeRule for ObjectRule {
    fn name(&self) -> &'static str {
        "object"
    }
    fn encode(&self, v: &Value, ctx: &mut EncodeCtx) -> Option<anyhow::Result<Wire>> {
        match v {
            Value::Object(map) => Some((|| {
                let mut out = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.to_string(), ctx.encode(v)?);
                }
                Ok(Wire::Object(out))
            })()),
            _ => None,
        }
    }
    fn decode(&self, w: &Wire, ctx: &mut DecodeCtx) -> Option<anyhow::Result<Value>> {
        match w {
            Wire::Object(map) => Some((|| {
                let mut out = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(ArcStr::from(k.as_str()), ctx.decode(v)?);
                }
                Ok(Value::Object(out))
            })()),
            _ => None,
        }
    }
}

/// The ordered list of rules consulted by `encode`/`decode`, first match
/// wins (spec.md §4.3). Callers needing a non-default rule (e.g. a host
/// embedding adding its own domain type) can start from `RuleTable::new()`
/// and `push` before the catch-all object rule, or build on `with_builtins`
/// and insert ahead of `ObjectRule`.
pub struct RuleTable {
    rules: Vec<Box<dyn TypeRule>>,
}

impl RuleTable {
    pub fn new() -> Self {
        RuleTable { rules: Vec::new() }
    }

    pub fn with_builtins() -> Self {
        let mut t = RuleTable::new();
        t.push(Box::new(NullRule));
        t.push(Box::new(BoolRule));
        t.push(Box::new(NumberRule));
        t.push(Box::new(StringRule));
        t.push(Box::new(FunctionRule));
        t.push(Box::new(PromiseRule));
        t.push(Box::new(DateRule));
        t.push(Box::new(RegexpRule));
        t.push(Box::new(ErrorRule));
        t.push(Box::new(MapRule));
        t.push(Box::new(SetRule));
        t.push(Box::new(TypedArrayRule));
        t.push(Box::new(BytesRule));
        t.push(Box::new(ArrayRule));
        t.push(Box::new(ObjectRule));
        t
    }

    pub fn push(&mut self, rule: Box<dyn TypeRule>) {
        self.rules.push(rule);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn dispatch_encode(&self, v: &Value, ctx: &mut EncodeCtx) -> anyhow::Result<Wire> {
        for rule in &self.rules {
            if let Some(result) = rule.encode(v, ctx) {
                return result;
            }
        }
        Err(anyhow!("no type rule matched this value"))
    }

    pub fn dispatch_decode(&self, w: &Wire, ctx: &mut DecodeCtx) -> anyhow::Result<Value> {
        for rule in &self.rules {
            if let Some(result) = rule.decode(w, ctx) {
                return result;
            }
        }
        Err(anyhow!("no type rule matched this wire value"))
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        RuleTable::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::{decode, encode};
    use duplex_protocol::Side;
    use duplex_registry::{CallbackRegistry, PromiseManager};

    fn roundtrip(v: Value) -> Value {
        let rules = RuleTable::with_builtins();
        let registry = CallbackRegistry::new(Side::Guest);
        let promises = PromiseManager::new();
        let wire = encode(&v, &rules, &registry, &promises, Arc::new(|_, _| {})).unwrap();
        decode(&wire, &rules, &registry, &promises, Arc::new(|_, _| Ok(()))).unwrap()
    }

    #[test]
    fn primitives_round_trip() {
        assert_eq!(roundtrip(Value::Null), Value::Null);
        assert_eq!(roundtrip(Value::Undefined), Value::Undefined);
        assert_eq!(roundtrip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(Value::Number(3.5)), Value::Number(3.5));
        assert_eq!(roundtrip(Value::from("hi")), Value::from("hi"));
    }

    #[test]
    fn nested_object_round_trips() {
        let mut obj = IndexMap::new();
        obj.insert(ArcStr::from("a"), Value::Array(vec![Value::Number(1.0), Value::Bool(false)]));
        let v = Value::Object(obj);
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn error_round_trips() {
        let v = Value::Error {
            name: ArcStr::from("TypeError"),
            message: ArcStr::from("bad"),
            stack: Some(ArcStr::from("at x")),
        };
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn depth_cap_yields_undefined_instead_of_recursing_forever() {
        let mut v = Value::Number(0.0);
        for _ in 0..100 {
            v = Value::Array(vec![v]);
        }
        let rules = RuleTable::with_builtins();
        let registry = CallbackRegistry::new(Side::Guest);
        let promises = PromiseManager::new();
        let wire = encode(&v, &rules, &registry, &promises, Arc::new(|_, _| {})).unwrap();
        // At some depth encoding switches to Wire::Circular rather than stack overflowing.
        fn contains_circular(w: &Wire) -> bool {
            match w {
                Wire::Circular => true,
                Wire::Array(items) => items.iter().any(contains_circular),
                _ => false,
            }
        }
        assert!(contains_circular(&wire));
    }
}
