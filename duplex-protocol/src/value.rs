//! The live, in-process representation of a dynamic cross-boundary value
//! (spec.md §3.6 / §4.3). This is what Guest and Host code actually holds;
//! the `__type`-tagged JSON wire form lives in `duplex-codec::Wire` and is
//! produced/consumed only at the boundary.
use crate::ids::{FnId, PromiseId};
use arcstr::ArcStr;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// A live callable crossing the boundary. Implemented either by a real
/// Guest/Host closure (the producing side) or by a decode-side proxy that
/// forwards the call to the registry that owns the real function
/// (`duplex-codec::CallbackProxy`). Invocation is fire-and-forget: results
/// are never returned to the caller (spec.md §4.3, "Function-proxy call
/// semantics") — async results must go through a `Promise`.
pub trait Callable: Send + Sync + fmt::Debug {
    /// Invoke the callable. A synchronous failure is modeled as `Err`
    /// rather than a panic/unwind, matching spec.md §7's "Sync throw inside
    /// callback proxy" — the caller (the registry) decides whether to log
    /// and swallow it or propagate it, depending on debug mode.
    fn call(&self, args: Vec<Value>) -> anyhow::Result<()>;

    /// The id backing this callable, if it is a decode-side proxy or a
    /// registered live function. Used by the Receiver to release the
    /// registry entry when the node holding this value is torn down
    /// (spec.md §9, "Subtree-scoped callback release").
    fn fn_id(&self) -> Option<FnId> {
        None
    }

    /// Truncated source text for debugging, mirrors the `__source` wire
    /// field (spec.md §4.3, rule 5: "source truncated to ≤500 chars").
    fn source(&self) -> Option<&str> {
        None
    }
}

/// A boxed future producing the eventual promise outcome.
pub type PromiseFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, Value>> + Send>>;

/// The live counterpart of a promise crossing the boundary.
pub enum ValuePromise {
    /// Not yet registered: a real future on the producing side. `take`
    /// consumes it exactly once, when `PromiseManager::register` attaches
    /// its continuation.
    Live(Mutex<Option<PromiseFuture>>),
    /// A decode-side handle: resolves once the owning `PromiseManager` is
    /// told to `settle` this id (spec.md §4.2).
    Pending(PromiseId, Mutex<Option<futures::channel::oneshot::Receiver<Result<Value, Value>>>>),
}

impl fmt::Debug for ValuePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValuePromise::Live(_) => write!(f, "ValuePromise::Live"),
            ValuePromise::Pending(id, _) => write!(f, "ValuePromise::Pending({id})"),
        }
    }
}

impl ValuePromise {
    pub fn live(fut: PromiseFuture) -> Arc<Self> {
        Arc::new(ValuePromise::Live(Mutex::new(Some(fut))))
    }

    pub fn pending(
        id: PromiseId,
        rx: futures::channel::oneshot::Receiver<Result<Value, Value>>,
    ) -> Arc<Self> {
        Arc::new(ValuePromise::Pending(id, Mutex::new(Some(rx))))
    }

    /// Take the live future out, if this is a not-yet-registered promise and
    /// it hasn't already been taken.
    pub fn take_live(&self) -> Option<PromiseFuture> {
        match self {
            ValuePromise::Live(slot) => slot.lock().take(),
            ValuePromise::Pending(..) => None,
        }
    }

    pub fn promise_id(&self) -> Option<PromiseId> {
        match self {
            ValuePromise::Live(_) => None,
            ValuePromise::Pending(id, _) => Some(*id),
        }
    }
}

/// Wire shape for a typed array / byte buffer: rules 13/14 of spec.md §4.3.
/// `ctor` names the originating typed array constructor (e.g. `"Float64Array"`);
/// `None` identifies a plain `ArrayBuffer`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArray {
    pub ctor: Option<ArcStr>,
    pub bytes: Vec<u8>,
    pub bigint: bool,
}

/// The dynamic value type shared by operation props, callback args, host
/// event payloads, and promise results (spec.md §3.2, §4.3).
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    /// JS has no analogue on the wire other than `null`, but the protocol's
    /// rule 1 ("null / undefined") treats them as distinct passthrough kinds
    /// so a round trip preserves which one was sent (notably: decoding a
    /// circular marker yields `Undefined`, never `Null`, spec.md §4.3 rule 3).
    Undefined,
    Bool(bool),
    Number(f64),
    String(ArcStr),
    Array(Vec<Value>),
    Object(IndexMap<ArcStr, Value>),
    Date(DateTime<Utc>),
    Regexp {
        source: ArcStr,
        flags: ArcStr,
    },
    Error {
        name: ArcStr,
        message: ArcStr,
        stack: Option<ArcStr>,
    },
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    TypedArray(TypedArray),
    /// A raw byte buffer with no typed-array constructor tag (rule 14,
    /// `{__type:"arraybuffer"}`), as opposed to `TypedArray` (rule 13).
    Bytes(Vec<u8>),
    Function(Arc<dyn Callable>),
    Promise(Arc<ValuePromise>),
}

impl Value {
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<ArcStr, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    /// Depth-first walk of every `Value` nested under this one, including
    /// `self`. Used by the Receiver to collect `fnId`s in a removed subtree's
    /// props in a single pass (spec.md §9).
    pub fn walk(&self, f: &mut impl FnMut(&Value)) {
        f(self);
        match self {
            Value::Array(items) | Value::Set(items) => {
                for v in items {
                    v.walk(f)
                }
            }
            Value::Object(m) => {
                for v in m.values() {
                    v.walk(f)
                }
            }
            Value::Map(entries) => {
                for (k, v) in entries {
                    k.walk(f);
                    v.walk(f);
                }
            }
            _ => {}
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Regexp { source: sa, flags: fa }, Value::Regexp { source: sb, flags: fb }) => {
                sa == sb && fa == fb
            }
            (
                Value::Error { name: na, message: ma, stack: sa },
                Value::Error { name: nb, message: mb, stack: sb },
            ) => na == nb && ma == mb && sa == sb,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::TypedArray(a), Value::TypedArray(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Promise(a), Value::Promise(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

macro_rules! from_number {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Value {
                Value::Number(v as f64)
            }
        })*
    };
}
from_number!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, usize);

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(ArcStr::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(ArcStr::from(v))
    }
}

impl From<ArcStr> for Value {
    fn from(v: ArcStr) -> Value {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Value {
        match v {
            None => Value::Null,
            Some(v) => v.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_undefined_are_distinct() {
        assert_ne!(Value::Null, Value::Undefined);
        assert!(Value::Null.is_nullish());
        assert!(Value::Undefined.is_nullish());
    }

    #[test]
    fn walk_visits_nested_containers() {
        let mut obj = IndexMap::new();
        obj.insert(ArcStr::from("a"), Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]));
        let v = Value::Object(obj);
        let mut seen = 0;
        v.walk(&mut |_| seen += 1);
        // self + array + 2 numbers
        assert_eq!(seen, 4);
    }
}
