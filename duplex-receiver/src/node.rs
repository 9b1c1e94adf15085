//! Host-side node tree (spec.md §3.3): a flat `nodeMap` plus a root child
//! list, rather than owning parent/child references, so `DELETE` cascades
//! stay a map removal instead of a graph walk.
use arcstr::ArcStr;
use duplex_protocol::{NodeId, Props};

#[derive(Debug, Clone)]
pub struct NodeInstance {
    pub id: NodeId,
    pub type_: ArcStr,
    pub props: Props,
    pub children: Vec<NodeId>,
}

impl NodeInstance {
    pub fn new(id: NodeId, type_: ArcStr, props: Props) -> Self {
        NodeInstance { id, type_, props, children: Vec::new() }
    }
}

/// Remove every occurrence of `child` from `list`, returning whether
/// anything was removed (spec.md §3.4 invariant 3: lists are duplicate-free,
/// so in practice this removes at most one entry).
pub fn detach(list: &mut Vec<NodeId>, child: NodeId) -> bool {
    let before = list.len();
    list.retain(|c| *c != child);
    list.len() != before
}

/// Insert `child` at `index`, clamped to `list.len()` (spec.md §9, Open
/// Question: "INSERT with index > length: clamp to length").
pub fn insert_clamped(list: &mut Vec<NodeId>, index: usize, child: NodeId) {
    let index = index.min(list.len());
    list.insert(index, child);
}
