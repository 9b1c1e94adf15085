//! Encode/decode for a whole `OperationBatch` (spec.md §4.1, §6.1): applies
//! the value codec to every prop map inside every operation.
use crate::ctx::{DecodeCtx, EncodeCtx, PromiseSettleSender, RemoteCallSender};
use crate::rules::RuleTable;
use crate::wire::{WireOp, WireOperationBatch};
use arcstr::ArcStr;
use duplex_protocol::{BatchId, NodeId, Op, OperationBatch};
use duplex_registry::{CallbackRegistry, PromiseManager};
use indexmap::IndexMap;
use smallvec::SmallVec;

pub fn encode_batch(
    batch: &OperationBatch,
    rules: &RuleTable,
    registry: &CallbackRegistry,
    promises: &PromiseManager,
    on_promise_settle: PromiseSettleSender,
) -> anyhow::Result<WireOperationBatch> {
    let mut ctx = EncodeCtx::new(rules, registry, promises, on_promise_settle);
    encode_batch_with_ctx(batch, &mut ctx)
}

/// Same as `encode_batch`, but against a context the caller already built
/// (e.g. one tracking freshly-registered `fnId`s, or using a non-default
/// promise-settle sink) rather than a freshly constructed default one.
pub fn encode_batch_with_ctx(
    batch: &OperationBatch,
    ctx: &mut EncodeCtx,
) -> anyhow::Result<WireOperationBatch> {
    let mut operations = Vec::with_capacity(batch.operations.len());
    for op in &batch.operations {
        operations.push(match op {
            Op::Create { id, type_, props } => WireOp::Create {
                id: id.0,
                type_: type_.to_string(),
                props: encode_props(ctx, props)?,
            },
            Op::Update { id, props, removed_props } => WireOp::Update {
                id: id.0,
                props: encode_props(ctx, props)?,
                removed_props: removed_props.iter().map(|p| p.to_string()).collect(),
            },
            Op::Append { parent_id, child_id } => {
                WireOp::Append { parent_id: parent_id.0, child_id: child_id.0 }
            }
            Op::Insert { parent_id, child_id, index } => {
                WireOp::Insert { parent_id: parent_id.0, child_id: child_id.0, index: *index as u32 }
            }
            Op::Remove { parent_id, child_id } => {
                WireOp::Remove { parent_id: parent_id.0, child_id: child_id.0 }
            }
            Op::Delete { id } => WireOp::Delete { id: id.0 },
            Op::Reorder { parent_id, child_ids } => WireOp::Reorder {
                parent_id: parent_id.0,
                child_ids: child_ids.iter().map(|c| c.0).collect(),
            },
            Op::Text { id, text } => WireOp::Text { id: id.0, text: text.to_string() },
        });
    }
    Ok(WireOperationBatch { version: batch.version, batch_id: batch.batch_id.0, operations })
}

pub fn decode_batch(
    wire: &WireOperationBatch,
    rules: &RuleTable,
    registry: &CallbackRegistry,
    promises: &PromiseManager,
    sender: RemoteCallSender,
) -> anyhow::Result<OperationBatch> {
    let mut ctx = DecodeCtx::new(rules, registry, promises, sender);
    decode_batch_with_ctx(wire, &mut ctx)
}

/// Same as `decode_batch`, but against a context the caller already built.
pub fn decode_batch_with_ctx(
    wire: &WireOperationBatch,
    ctx: &mut DecodeCtx,
) -> anyhow::Result<OperationBatch> {
    let mut operations = Vec::with_capacity(wire.operations.len());
    for op in &wire.operations {
        operations.push(match op {
            WireOp::Create { id, type_, props } => Op::Create {
                id: NodeId(*id),
                type_: ArcStr::from(type_.as_str()),
                props: decode_props(ctx, props)?,
            },
            WireOp::Update { id, props, removed_props } => Op::Update {
                id: NodeId(*id),
                props: decode_props(ctx, props)?,
                removed_props: removed_props.iter().map(|p| ArcStr::from(p.as_str())).collect::<SmallVec<_>>(),
            },
            WireOp::Append { parent_id, child_id } => {
                Op::Append { parent_id: NodeId(*parent_id), child_id: NodeId(*child_id) }
            }
            WireOp::Insert { parent_id, child_id, index } => Op::Insert {
                parent_id: NodeId(*parent_id),
                child_id: NodeId(*child_id),
                index: *index as usize,
            },
            WireOp::Remove { parent_id, child_id } => {
                Op::Remove { parent_id: NodeId(*parent_id), child_id: NodeId(*child_id) }
            }
            WireOp::Delete { id } => Op::Delete { id: NodeId(*id) },
            WireOp::Reorder { parent_id, child_ids } => Op::Reorder {
                parent_id: NodeId(*parent_id),
                child_ids: child_ids.iter().map(|c| NodeId(*c)).collect(),
            },
            WireOp::Text { id, text } => Op::Text { id: NodeId(*id), text: ArcStr::from(text.as_str()) },
        });
    }
    Ok(OperationBatch { version: wire.version, batch_id: BatchId(wire.batch_id), operations })
}

fn encode_props(
    ctx: &mut EncodeCtx,
    props: &IndexMap<ArcStr, duplex_protocol::Value>,
) -> anyhow::Result<IndexMap<String, crate::wire::Wire>> {
    let mut out = IndexMap::with_capacity(props.len());
    for (k, v) in props {
        out.insert(k.to_string(), ctx.encode(v)?);
    }
    Ok(out)
}

fn decode_props(
    ctx: &mut DecodeCtx,
    props: &IndexMap<String, crate::wire::Wire>,
) -> anyhow::Result<IndexMap<ArcStr, duplex_protocol::Value>> {
    let mut out = IndexMap::with_capacity(props.len());
    for (k, v) in props {
        out.insert(ArcStr::from(k.as_str()), ctx.decode(v)?);
    }
    Ok(out)
}
