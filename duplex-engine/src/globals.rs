//! Injects the Host-to-Guest runtime globals a bundle expects to find
//! (spec.md §6.2). These are native host functions with real return values,
//! not wire-crossing callback proxies — they run in the same process as the
//! sandbox, so `ScriptContext::set_native_fn` binds them directly rather
//! than routing through the boundary codec.
use crate::engine::{Engine, EngineEvent, Subscription};
use crate::script_context::ScriptContext;
use arcstr::ArcStr;
use duplex_protocol::{Callable, FnId, NodeId, Op, OperationBatch, Props, Value};
use indexmap::IndexMap;
use log::{error, info, warn};
use smallvec::SmallVec;
use std::sync::{atomic::Ordering, Arc};

pub(crate) fn install_globals<C: ScriptContext + 'static>(engine: &Arc<Engine<C>>) {
    engine.ctx.set_global("console", console_value());
    engine.ctx.set_global("__callbacks", callbacks_value(engine.bridge.registry()));

    {
        let engine = engine.clone();
        engine_native("__getConfig", &engine.clone(), move |_args| {
            Ok(engine.config_value.lock().clone())
        });
    }
    {
        let engine = engine.clone();
        engine_native("__sendEventToHost", &engine.clone(), move |args| {
            let name = arg_str(&args, 0)?;
            let payload = args.get(1).cloned().unwrap_or(Value::Undefined);
            engine.emit(EngineEvent::Message { event_name: name, payload });
            Ok(Value::Undefined)
        });
    }
    {
        let engine = engine.clone();
        engine_native("__sendOperation", &engine.clone(), move |args| {
            let op_value = args.first().ok_or_else(|| anyhow::anyhow!("__sendOperation: missing op"))?;
            let op = value_to_op(op_value)?;
            let batch_id = duplex_protocol::BatchId(engine.op_seq.fetch_add(1, Ordering::Relaxed));
            let batch = OperationBatch::new(batch_id, vec![op]);
            engine.receiver.apply_batch(&batch);
            engine.emit(EngineEvent::Operation { batch_id });
            Ok(Value::Undefined)
        });
    }
    {
        let engine = engine.clone();
        engine_native("__useHostEvent", &engine.clone(), move |args| {
            let name = arg_str(&args, 0)?;
            let callback = match args.get(1) {
                Some(Value::Function(f)) => f.clone(),
                _ => anyhow::bail!("__useHostEvent: second argument must be a function"),
            };
            let id = engine.next_sub_id.fetch_add(1, Ordering::Relaxed);
            engine.subscribers.lock().entry(name.clone()).or_default().push(Subscription {
                id,
                callback,
            });
            let engine = engine.clone();
            let unsub = move |_args: Vec<Value>| -> anyhow::Result<()> {
                if let Some(list) = engine.subscribers.lock().get_mut(&name) {
                    list.retain(|s| s.id != id);
                }
                Ok(())
            };
            Ok(Value::Function(Arc::new(FnCallable(unsub))))
        });
    }
    {
        let engine = engine.clone();
        engine_native("__handleHostEvent", &engine.clone(), move |args| {
            let name = arg_str(&args, 0)?;
            let payload = args.get(1).cloned().unwrap_or(Value::Undefined);
            let listeners: Vec<_> = engine
                .subscribers
                .lock()
                .get(&name)
                .map(|l| l.iter().map(|s| s.callback.clone()).collect())
                .unwrap_or_default();
            for cb in listeners {
                if let Err(e) = cb.call(vec![payload.clone()]) {
                    warn!("__handleHostEvent: listener for {name} threw: {e:?}");
                }
            }
            Ok(Value::Undefined)
        });
    }
    {
        let engine = engine.clone();
        engine_native("__registerCallback", &engine.clone(), move |args| {
            let callable = match args.first() {
                Some(Value::Function(f)) => f.clone(),
                _ => anyhow::bail!("__registerCallback: argument must be a function"),
            };
            let id = engine.bridge.registry().register(callable);
            engine.ctx.set_global("__callbacks", callbacks_value(engine.bridge.registry()));
            Ok(Value::String(ArcStr::from(id.to_string())))
        });
    }
    {
        let engine = engine.clone();
        engine_native("__invokeCallback", &engine.clone(), move |args| {
            let id = arg_fn_id(&args, 0)?;
            let call_args = match args.get(1) {
                Some(Value::Array(items)) => items.clone(),
                Some(other) => vec![other.clone()],
                None => Vec::new(),
            };
            engine.bridge.registry().invoke(id, call_args)
        });
    }
    {
        let engine = engine.clone();
        engine_native("__removeCallback", &engine.clone(), move |args| {
            let id = arg_fn_id(&args, 0)?;
            engine.bridge.registry().release(id);
            engine.ctx.set_global("__callbacks", callbacks_value(engine.bridge.registry()));
            Ok(Value::Undefined)
        });
    }
}

/// Snapshot of the registry's current entries as a `{fnId: fn}` object,
/// bound to the `__callbacks` global (spec.md §6.2: "Shared map backing the
/// above") and re-bound after every `__registerCallback`/`__removeCallback`
/// so it tracks the registry rather than going stale after load.
fn callbacks_value(registry: &duplex_registry::CallbackRegistry) -> Value {
    let mut obj: IndexMap<ArcStr, Value> = IndexMap::new();
    for (id, callable) in registry.snapshot() {
        obj.insert(ArcStr::from(id.to_string()), Value::Function(callable));
    }
    Value::Object(obj)
}

/// Thin adapter: `ScriptContext` only knows how to bind `Value`s and native
/// functions by name; this just gives each closure above a name and logs if
/// binding ever fails (it can't, with `NullScriptContext`, but a real
/// sandbox's FFI layer might reject a name collision).
fn engine_native<C: ScriptContext + 'static>(
    name: &'static str,
    engine: &Arc<Engine<C>>,
    f: impl Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
) {
    engine.ctx.set_native_fn(name, Arc::new(f));
}

fn arg_str(args: &[Value], i: usize) -> anyhow::Result<String> {
    match args.get(i) {
        Some(Value::String(s)) => Ok(s.to_string()),
        other => anyhow::bail!("expected a string argument at position {i}, got {other:?}"),
    }
}

fn arg_fn_id(args: &[Value], i: usize) -> anyhow::Result<FnId> {
    match args.get(i) {
        Some(Value::String(s)) => s.parse::<FnId>().map_err(|e| anyhow::anyhow!("{e}")),
        other => anyhow::bail!("expected an fnId string at position {i}, got {other:?}"),
    }
}

/// A plain closure wrapped as a `Callable`, used for the unsub handle
/// `__useHostEvent` returns.
struct FnCallable<F>(F);

impl<F: Fn(Vec<Value>) -> anyhow::Result<()> + Send + Sync> std::fmt::Debug for FnCallable<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnCallable")
    }
}

impl<F: Fn(Vec<Value>) -> anyhow::Result<()> + Send + Sync> Callable for FnCallable<F> {
    fn call(&self, args: Vec<Value>) -> anyhow::Result<()> {
        (self.0)(args)
    }
}

#[derive(Debug)]
struct ConsoleSink(&'static str);

impl Callable for ConsoleSink {
    fn call(&self, args: Vec<Value>) -> anyhow::Result<()> {
        let line = args.iter().map(|v| format!("{v:?}")).collect::<Vec<_>>().join(" ");
        match self.0 {
            "error" => error!("guest console.error: {line}"),
            "warn" => warn!("guest console.warn: {line}"),
            _ => info!("guest console.log: {line}"),
        }
        Ok(())
    }
}

fn console_value() -> Value {
    let mut obj: IndexMap<ArcStr, Value> = IndexMap::new();
    obj.insert(ArcStr::from("log"), Value::Function(Arc::new(ConsoleSink("log"))));
    obj.insert(ArcStr::from("warn"), Value::Function(Arc::new(ConsoleSink("warn"))));
    obj.insert(ArcStr::from("error"), Value::Function(Arc::new(ConsoleSink("error"))));
    Value::Object(obj)
}

fn obj_field<'a>(v: &'a Value, key: &str) -> Option<&'a Value> {
    v.as_object().and_then(|m| m.get(key))
}

fn field_node_id(v: &Value, key: &str) -> anyhow::Result<NodeId> {
    match obj_field(v, key) {
        Some(Value::Number(n)) => Ok(NodeId(*n as u32)),
        other => anyhow::bail!("expected numeric field {key:?}, got {other:?}"),
    }
}

fn field_str(v: &Value, key: &str) -> anyhow::Result<ArcStr> {
    match obj_field(v, key) {
        Some(Value::String(s)) => Ok(s.clone()),
        other => anyhow::bail!("expected string field {key:?}, got {other:?}"),
    }
}

fn field_props(v: &Value, key: &str) -> Props {
    match obj_field(v, key) {
        Some(Value::Object(m)) => m.clone(),
        _ => IndexMap::new(),
    }
}

/// Decode a plain `{tag, ...}` object into an `Op` (spec.md §3.2). Used by
/// `__sendOperation`, the one place an `Op` is built from an untyped value
/// rather than coming pre-typed off the wire via the codec.
fn value_to_op(v: &Value) -> anyhow::Result<Op> {
    let tag = field_str(v, "tag")?;
    Ok(match tag.as_str() {
        "CREATE" => Op::Create {
            id: field_node_id(v, "id")?,
            type_: field_str(v, "type")?,
            props: field_props(v, "props"),
        },
        "UPDATE" => {
            let removed_props = match obj_field(v, "removedProps") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|i| i.as_str().map(ArcStr::from))
                    .collect::<SmallVec<[ArcStr; 4]>>(),
                _ => SmallVec::new(),
            };
            Op::Update { id: field_node_id(v, "id")?, props: field_props(v, "props"), removed_props }
        }
        "APPEND" => {
            Op::Append { parent_id: field_node_id(v, "parentId")?, child_id: field_node_id(v, "childId")? }
        }
        "INSERT" => Op::Insert {
            parent_id: field_node_id(v, "parentId")?,
            child_id: field_node_id(v, "childId")?,
            index: match obj_field(v, "index") {
                Some(Value::Number(n)) => *n as usize,
                _ => 0,
            },
        },
        "REMOVE" => {
            Op::Remove { parent_id: field_node_id(v, "parentId")?, child_id: field_node_id(v, "childId")? }
        }
        "DELETE" => Op::Delete { id: field_node_id(v, "id")? },
        "REORDER" => {
            let child_ids = match obj_field(v, "childIds") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|i| match i {
                        Value::Number(n) => Some(NodeId(*n as u32)),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Op::Reorder { parent_id: field_node_id(v, "parentId")?, child_ids }
        }
        "TEXT" => Op::Text { id: field_node_id(v, "id")?, text: field_str(v, "text")? },
        other => anyhow::bail!("__sendOperation: unknown op tag {other:?}"),
    })
}
