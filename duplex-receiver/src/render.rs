//! Pure projection of the current tree into something the Host UI framework
//! consumes (spec.md §4.5.3). No layout, styling, or paint happens here.
use crate::node::NodeInstance;
use arcstr::ArcStr;
use duplex_protocol::{NodeId, Props};
use fxhash::FxHashMap;
use log::warn;

/// Safety cap against a pathologically deep or (by producer bug) cyclic
/// tree; mirrors the codec's recursion cap (spec.md §4.3 rule 3) rather than
/// assuming the node graph is acyclic by construction.
const RENDER_DEPTH_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedNode {
    pub id: NodeId,
    pub type_: ArcStr,
    pub props: Props,
    pub children: Vec<RenderedNode>,
}

/// Materialized tree handed to the Host UI framework (spec.md §4.5: `render`
/// rules — no roots is `Null`, one root renders directly, multiple roots
/// wrap in a transparent fragment).
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Null,
    Node(RenderedNode),
    Fragment(Vec<RenderedNode>),
}

pub fn render_tree(
    node_map: &FxHashMap<NodeId, NodeInstance>,
    root_children: &[NodeId],
) -> Element {
    match root_children.len() {
        0 => Element::Null,
        1 => match render_node(node_map, root_children[0], 0) {
            Some(n) => Element::Node(n),
            None => Element::Null,
        },
        _ => Element::Fragment(
            root_children.iter().filter_map(|id| render_node(node_map, *id, 0)).collect(),
        ),
    }
}

fn render_node(
    node_map: &FxHashMap<NodeId, NodeInstance>,
    id: NodeId,
    depth: usize,
) -> Option<RenderedNode> {
    let node = match node_map.get(&id) {
        Some(n) => n,
        None => {
            warn!("render: node {id} referenced but missing, rendering nothing for it");
            return None;
        }
    };
    if node.type_.is_empty() {
        warn!("render: node {id} has an unknown/empty type, rendering nothing for its subtree");
        return None;
    }
    let children = if depth >= RENDER_DEPTH_CAP {
        warn!("render: depth cap {RENDER_DEPTH_CAP} exceeded at node {id}, truncating subtree");
        Vec::new()
    } else {
        node.children
            .iter()
            .filter_map(|c| render_node(node_map, *c, depth + 1))
            .collect()
    };
    Some(RenderedNode { id: node.id, type_: node.type_.clone(), props: node.props.clone(), children })
}
