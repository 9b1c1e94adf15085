//! Operation and batch envelope (spec.md §3.2, §6.1).
use crate::ids::{BatchId, NodeId};
use crate::value::Value;
use arcstr::ArcStr;
use indexmap::IndexMap;
use smallvec::SmallVec;

/// Reserved component type identifying a text node; its `props` carry a
/// single `text` string (spec.md §3.2).
pub const TEXT_TAG: &str = "__TEXT__";

/// Current and only supported wire version (spec.md §3.2, §4.4).
pub const WIRE_VERSION: u32 = 1;

pub type Props = IndexMap<ArcStr, Value>;

/// A single mutation instruction. Order within a batch is significant
/// (spec.md §3.2).
#[derive(Debug, Clone)]
pub enum Op {
    Create {
        id: NodeId,
        type_: ArcStr,
        props: Props,
    },
    Update {
        id: NodeId,
        props: Props,
        removed_props: SmallVec<[ArcStr; 4]>,
    },
    Append {
        parent_id: NodeId,
        child_id: NodeId,
    },
    Insert {
        parent_id: NodeId,
        child_id: NodeId,
        index: usize,
    },
    Remove {
        parent_id: NodeId,
        child_id: NodeId,
    },
    Delete {
        id: NodeId,
    },
    Reorder {
        parent_id: NodeId,
        child_ids: Vec<NodeId>,
    },
    Text {
        id: NodeId,
        text: ArcStr,
    },
}

impl Op {
    /// The node tag used for logging/attribution (spec.md §4.5.2,
    /// `topNodeTypes`/`topNodeTypesSkipped`) — not meaningful for structural
    /// ops that don't name a type.
    pub fn tag(&self) -> &'static str {
        match self {
            Op::Create { .. } => "CREATE",
            Op::Update { .. } => "UPDATE",
            Op::Append { .. } => "APPEND",
            Op::Insert { .. } => "INSERT",
            Op::Remove { .. } => "REMOVE",
            Op::Delete { .. } => "DELETE",
            Op::Reorder { .. } => "REORDER",
            Op::Text { .. } => "TEXT",
        }
    }
}

/// `{ version, batchId, operations }` (spec.md §3.2).
#[derive(Debug, Clone)]
pub struct OperationBatch {
    pub version: u32,
    pub batch_id: BatchId,
    pub operations: Vec<Op>,
}

impl OperationBatch {
    pub fn new(batch_id: BatchId, operations: Vec<Op>) -> Self {
        OperationBatch { version: WIRE_VERSION, batch_id, operations }
    }
}
