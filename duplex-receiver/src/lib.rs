//! Receiver (spec.md §2 component 6): the Host-side node tree applier,
//! backpressure governor, and attribution chokepoint.
pub mod config;
pub mod node;
pub mod receiver;
pub mod render;
pub mod stats;

pub use config::{ReceiverConfig, ReceiverConfigBuilder};
pub use node::NodeInstance;
pub use receiver::{DebugInfo, OnUpdate, Receiver};
pub use render::{Element, RenderedNode};
pub use stats::{ApplyStats, AttributionWindow};

#[cfg(test)]
mod tests {
    use super::*;
    use arcstr::ArcStr;
    use duplex_bridge::{Bridge, BridgeConfig};
    use duplex_protocol::{BatchId, NodeId, Op, OperationBatch, Props, Side, Value};
    use futures::channel::mpsc;
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn receiver_with_bridge() -> (Receiver, mpsc::UnboundedReceiver<duplex_bridge::WireHostMessage>) {
        let (tx, rx) = mpsc::unbounded();
        let bridge = Arc::new(Bridge::new(BridgeConfig::builder(Side::Host).build().unwrap(), tx));
        (Receiver::new(bridge, ReceiverConfig::default()), rx)
    }

    fn props(pairs: &[(&str, Value)]) -> Props {
        let mut m = IndexMap::new();
        for (k, v) in pairs {
            m.insert(ArcStr::from(*k), v.clone());
        }
        m
    }

    fn batch(id: u64, ops: Vec<Op>) -> OperationBatch {
        OperationBatch::new(BatchId(id), ops)
    }

    #[test]
    fn hello_tree() {
        let (receiver, _rx) = receiver_with_bridge();
        let stats = receiver.apply_batch(&batch(
            1,
            vec![
                Op::Create { id: NodeId(1), type_: ArcStr::from("View"), props: props(&[]) },
                Op::Create { id: NodeId(2), type_: ArcStr::from("Text"), props: props(&[]) },
                Op::Append { parent_id: NodeId(1), child_id: NodeId(2) },
                Op::Append { parent_id: NodeId::ROOT, child_id: NodeId(1) },
            ],
        ));
        assert_eq!(stats.applied, 4);
        assert_eq!(receiver.get_debug_info().node_count, 2);
        match receiver.render() {
            Element::Node(n) => {
                assert_eq!(n.id, NodeId(1));
                assert_eq!(n.children.len(), 1);
                assert_eq!(n.children[0].id, NodeId(2));
            }
            other => panic!("expected a single root node, got {other:?}"),
        }
    }

    #[test]
    fn update_then_remove_key() {
        let (receiver, _rx) = receiver_with_bridge();
        receiver.apply_batch(&batch(
            1,
            vec![Op::Create { id: NodeId(1), type_: ArcStr::from("View"), props: props(&[]) }],
        ));
        receiver.apply_batch(&batch(
            2,
            vec![
                Op::Update {
                    id: NodeId(1),
                    props: props(&[("style", Value::from("flex2")), ("testID", Value::from("a"))]),
                    removed_props: Default::default(),
                },
                Op::Update {
                    id: NodeId(1),
                    props: props(&[]),
                    removed_props: smallvec::smallvec![ArcStr::from("testID")],
                },
            ],
        ));
        match receiver.render() {
            Element::Node(n) => {
                assert_eq!(n.props.len(), 1);
                assert!(n.props.contains_key("style"));
                assert!(!n.props.contains_key("testID"));
            }
            other => panic!("expected a node, got {other:?}"),
        }
    }

    #[test]
    fn reorder_replaces_children_verbatim() {
        let (receiver, _rx) = receiver_with_bridge();
        receiver.apply_batch(&batch(
            1,
            vec![
                Op::Create { id: NodeId(1), type_: ArcStr::from("View"), props: props(&[]) },
                Op::Create { id: NodeId(2), type_: ArcStr::from("Text"), props: props(&[]) },
                Op::Create { id: NodeId(3), type_: ArcStr::from("Text"), props: props(&[]) },
                Op::Create { id: NodeId(4), type_: ArcStr::from("Text"), props: props(&[]) },
                Op::Append { parent_id: NodeId(1), child_id: NodeId(2) },
                Op::Append { parent_id: NodeId(1), child_id: NodeId(3) },
                Op::Append { parent_id: NodeId(1), child_id: NodeId(4) },
            ],
        ));
        receiver.apply_batch(&batch(
            2,
            vec![Op::Reorder {
                parent_id: NodeId(1),
                child_ids: vec![NodeId(4), NodeId(2), NodeId(3)],
            }],
        ));
        match receiver.render() {
            Element::Node(n) => {
                let ids: Vec<_> = n.children.iter().map(|c| c.id).collect();
                assert_eq!(ids, vec![NodeId(4), NodeId(2), NodeId(3)]);
            }
            other => panic!("expected a node, got {other:?}"),
        }
    }

    #[test]
    fn delete_cascades_and_clears_root() {
        let (receiver, _rx) = receiver_with_bridge();
        receiver.apply_batch(&batch(
            1,
            vec![
                Op::Create { id: NodeId(1), type_: ArcStr::from("View"), props: props(&[]) },
                Op::Create { id: NodeId(2), type_: ArcStr::from("View"), props: props(&[]) },
                Op::Create { id: NodeId(3), type_: ArcStr::from("Text"), props: props(&[]) },
                Op::Create { id: NodeId(4), type_: ArcStr::from("Text"), props: props(&[]) },
                Op::Append { parent_id: NodeId(2), child_id: NodeId(3) },
                Op::Append { parent_id: NodeId(1), child_id: NodeId(2) },
                Op::Append { parent_id: NodeId(1), child_id: NodeId(4) },
                Op::Append { parent_id: NodeId::ROOT, child_id: NodeId(1) },
            ],
        ));
        receiver.apply_batch(&batch(2, vec![Op::Delete { id: NodeId(1) }]));
        assert_eq!(receiver.get_debug_info().node_count, 0);
        assert!(matches!(receiver.render(), Element::Null));
    }

    #[test]
    fn backpressure_applies_only_the_cap_and_emits_a_host_event() {
        let (tx, mut rx) = mpsc::unbounded();
        let bridge = Arc::new(Bridge::new(BridgeConfig::builder(Side::Host).build().unwrap(), tx));
        let config = ReceiverConfig::builder().max_batch_size(10).build().unwrap();
        let receiver = Receiver::new(bridge, config);

        let ops = (1..=25u32)
            .map(|n| Op::Create { id: NodeId(n), type_: ArcStr::from("View"), props: props(&[]) })
            .collect();
        let stats = receiver.apply_batch(&batch(1, ops));

        assert_eq!(stats.total, 25);
        assert_eq!(stats.applied, 10);
        assert_eq!(stats.skipped, 15);
        assert_eq!(stats.failed, 0);
        assert!(stats.is_consistent());

        match rx.try_next().unwrap().unwrap() {
            duplex_bridge::WireHostMessage::HostEvent { event_name, .. } => {
                assert_eq!(event_name, "RECEIVER_BACKPRESSURE");
            }
            other => panic!("expected a host event, got {other:?}"),
        }
    }

    #[test]
    fn create_into_existing_id_overwrites_and_drops_old_children() {
        let (receiver, _rx) = receiver_with_bridge();
        receiver.apply_batch(&batch(
            1,
            vec![
                Op::Create { id: NodeId(1), type_: ArcStr::from("View"), props: props(&[]) },
                Op::Create { id: NodeId(2), type_: ArcStr::from("Text"), props: props(&[]) },
                Op::Append { parent_id: NodeId(1), child_id: NodeId(2) },
            ],
        ));
        receiver.apply_batch(&batch(
            2,
            vec![Op::Create { id: NodeId(1), type_: ArcStr::from("View"), props: props(&[]) }],
        ));
        let info = receiver.get_debug_info();
        assert_eq!(info.node_count, 2, "the orphaned child is not swept by the overwrite");
    }
}
