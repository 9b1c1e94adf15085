//! The Host-side applier (spec.md §4.5): owns the node tree, applies
//! batches, and is the single instrumented chokepoint for backpressure and
//! attribution.
use crate::config::ReceiverConfig;
use crate::node::{detach, insert_clamped, NodeInstance};
use crate::render::{render_tree, Element};
use crate::stats::{top_n, ApplyStats, AttributionHistory, AttributionWindow};
use arcstr::ArcStr;
use duplex_bridge::{Bridge, HostMessage};
use duplex_protocol::{NodeId, Op, OperationBatch, Value};
use fxhash::FxHashMap;
use indexmap::IndexMap;
use log::warn;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

/// Invoked once after a batch has been applied (spec.md §5: "Receiver
/// schedules its onUpdate callback on the microtask queue"). There is no
/// microtask queue in this port; the Host framework is expected to poll
/// `Receiver::take_dirty()` on its own paint tick, with this hook available
/// for frameworks that want an immediate nudge instead (spec.md §9,
/// "Microtask coalescing").
pub type OnUpdate = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    pub node_count: usize,
    pub root_count: usize,
    pub history_samples: usize,
    pub registry_size: usize,
    pub dirty: bool,
}

pub struct Receiver {
    bridge: Arc<Bridge>,
    config: ReceiverConfig,
    node_map: RwLock<FxHashMap<NodeId, NodeInstance>>,
    root_children: RwLock<Vec<NodeId>>,
    history: Mutex<AttributionHistory>,
    dirty: AtomicBool,
    on_update: Option<OnUpdate>,
}

impl Receiver {
    pub fn new(bridge: Arc<Bridge>, config: ReceiverConfig) -> Self {
        let history = AttributionHistory::new(config.attribution_history, config.attribution_max_samples);
        Receiver {
            bridge,
            config,
            node_map: RwLock::new(FxHashMap::default()),
            root_children: RwLock::new(Vec::new()),
            history: Mutex::new(history),
            dirty: AtomicBool::new(false),
            on_update: None,
        }
    }

    pub fn with_on_update(mut self, on_update: OnUpdate) -> Self {
        self.on_update = Some(on_update);
        self
    }

    /// Apply every operation in `batch`, up to `max_batch_size`, and return
    /// the resulting stats (spec.md §4.5).
    pub fn apply_batch(&self, batch: &OperationBatch) -> ApplyStats {
        let started = Instant::now();
        let total = batch.operations.len();
        let apply_count = total.min(self.config.max_batch_size);
        let skipped = total - apply_count;

        let nodes_before = self.node_map.read().len();

        let mut op_counts: FxHashMap<&'static str, u32> = FxHashMap::default();
        let mut skipped_op_counts: FxHashMap<&'static str, u32> = FxHashMap::default();
        let mut applied_type_counts: FxHashMap<String, u32> = FxHashMap::default();
        let mut skipped_type_counts: FxHashMap<String, u32> = FxHashMap::default();
        let mut applied = 0usize;
        let failed = 0usize;

        {
            let mut node_map = self.node_map.write();
            let mut root_children = self.root_children.write();
            for op in &batch.operations[..apply_count] {
                let label = attribution_label(&node_map, op);
                apply_op(&self.bridge, &mut node_map, &mut root_children, op);
                applied += 1;
                *op_counts.entry(op.tag()).or_insert(0) += 1;
                *applied_type_counts.entry(label).or_insert(0) += 1;
            }
            for op in &batch.operations[apply_count..] {
                let label = attribution_label(&node_map, op);
                *skipped_op_counts.entry(op.tag()).or_insert(0) += 1;
                *skipped_type_counts.entry(label).or_insert(0) += 1;
            }
        }

        let nodes_after = self.node_map.read().len();
        let stats = ApplyStats {
            batch_id: batch.batch_id,
            total,
            applied,
            skipped,
            failed,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            nodes_before,
            nodes_after,
            node_delta: nodes_after as i64 - nodes_before as i64,
            op_counts,
            skipped_op_counts,
            top_node_types: top_n(&applied_type_counts),
            top_node_types_skipped: top_n(&skipped_type_counts),
        };

        if let Some(sink) = &self.config.on_metric {
            sink("applyBatch", stats.duration_ms, Some(stats.total as u64));
        }

        if skipped > 0 {
            self.emit_backpressure(&stats);
        }

        self.history.lock().push(stats.clone(), Instant::now());
        self.dirty.store(true, Ordering::Release);
        if let Some(cb) = &self.on_update {
            cb();
        }

        stats
    }

    fn emit_backpressure(&self, stats: &ApplyStats) {
        let mut payload = IndexMap::new();
        payload.insert(ArcStr::from("batchId"), Value::from(stats.batch_id.0));
        payload.insert(ArcStr::from("skipped"), Value::from(stats.skipped as u64));
        payload.insert(ArcStr::from("applied"), Value::from(stats.applied as u64));
        payload.insert(ArcStr::from("total"), Value::from(stats.total as u64));
        let message = HostMessage::HostEvent {
            event_name: "RECEIVER_BACKPRESSURE".to_string(),
            payload: Value::Object(payload),
        };
        if let Err(e) = self.bridge.to_guest(message) {
            warn!("failed to deliver RECEIVER_BACKPRESSURE: {e:?}");
        }
    }

    /// Materialize the current tree (spec.md §4.5.3).
    pub fn render(&self) -> Element {
        let started = Instant::now();
        let node_map = self.node_map.read();
        let root_children = self.root_children.read();
        let result = render_tree(&node_map, &root_children);
        if let Some(sink) = &self.config.on_metric {
            sink("render", started.elapsed().as_secs_f64() * 1000.0, None);
        }
        result
    }

    /// Drop every node, releasing any callback it held (spec.md §4.5).
    pub fn clear(&self) {
        let mut node_map = self.node_map.write();
        for node in node_map.values() {
            release_props_callbacks(&self.bridge, &node.props);
        }
        node_map.clear();
        self.root_children.write().clear();
    }

    pub fn get_stats(&self) -> Option<ApplyStats> {
        self.history.lock().latest().cloned()
    }

    pub fn get_debug_info(&self) -> DebugInfo {
        let history = self.history.lock();
        DebugInfo {
            node_count: self.node_map.read().len(),
            root_count: self.root_children.read().len(),
            history_samples: history.len(),
            registry_size: self.bridge.registry().size(),
            dirty: self.dirty.load(Ordering::Acquire),
        }
    }

    /// Consume the dirty flag set by the last `apply_batch` (spec.md §9,
    /// "Microtask coalescing").
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Compute an `AttributionWindow` over the configured default query
    /// window (spec.md §4.5.2).
    pub fn attribution_window(&self) -> AttributionWindow {
        self.attribution_window_for(self.config.attribution_window)
    }

    pub fn attribution_window_for(&self, window: std::time::Duration) -> AttributionWindow {
        self.history.lock().window(window, Instant::now())
    }
}

/// The node type attributed to `op`, used only for `topNodeTypes`/
/// `topNodeTypesSkipped` accounting (spec.md §4.5.2). `CREATE` names its own
/// type; every other op is attributed to the current type of the node it
/// targets, or `"<unknown>"` if that node can't be resolved.
fn attribution_label(node_map: &FxHashMap<NodeId, NodeInstance>, op: &Op) -> String {
    let lookup = |id: NodeId| {
        node_map.get(&id).map(|n| n.type_.to_string()).unwrap_or_else(|| "<unknown>".to_string())
    };
    match op {
        Op::Create { type_, .. } => type_.to_string(),
        Op::Update { id, .. } | Op::Delete { id } | Op::Text { id, .. } => lookup(*id),
        Op::Append { child_id, .. } | Op::Insert { child_id, .. } | Op::Remove { child_id, .. } => {
            lookup(*child_id)
        }
        Op::Reorder { parent_id, .. } => lookup(*parent_id),
    }
}

fn apply_op(
    bridge: &Bridge,
    node_map: &mut FxHashMap<NodeId, NodeInstance>,
    root_children: &mut Vec<NodeId>,
    op: &Op,
) {
    match op {
        Op::Create { id, type_, props } => {
            if node_map.contains_key(id) {
                warn!("CREATE: id {id} already exists, overwriting (producer bug)");
            }
            node_map.insert(*id, NodeInstance::new(*id, type_.clone(), props.clone()));
        }
        Op::Update { id, props, removed_props } => match node_map.get_mut(id) {
            None => warn!("UPDATE: node {id} not found"),
            Some(node) => {
                for (k, v) in props {
                    node.props.insert(k.clone(), v.clone());
                }
                for k in removed_props {
                    node.props.shift_remove(k);
                }
            }
        },
        Op::Append { parent_id, child_id } => {
            if !node_map.contains_key(child_id) {
                warn!("APPEND: child {child_id} not found");
                return;
            }
            let list = target_list(node_map, root_children, *parent_id);
            let list = match list {
                Some(l) => l,
                None => {
                    warn!("APPEND: parent {parent_id} not found");
                    return;
                }
            };
            if !list.contains(child_id) {
                list.push(*child_id);
            }
        }
        Op::Insert { parent_id, child_id, index } => {
            if !node_map.contains_key(child_id) {
                warn!("INSERT: child {child_id} not found");
                return;
            }
            let list = match target_list(node_map, root_children, *parent_id) {
                Some(l) => l,
                None => {
                    warn!("INSERT: parent {parent_id} not found");
                    return;
                }
            };
            detach(list, *child_id);
            insert_clamped(list, *index, *child_id);
        }
        Op::Remove { parent_id, child_id } => {
            match target_list(node_map, root_children, *parent_id) {
                Some(list) => {
                    detach(list, *child_id);
                    release_subtree_callbacks(bridge, node_map, *child_id);
                }
                None => warn!("REMOVE: parent {parent_id} not found"),
            }
        }
        Op::Delete { id } => delete_subtree(bridge, node_map, root_children, *id),
        Op::Reorder { parent_id, child_ids } => {
            let list = match target_list(node_map, root_children, *parent_id) {
                Some(l) => l,
                None => {
                    warn!("REORDER: parent {parent_id} not found");
                    return;
                }
            };
            let mut seen = HashSet::with_capacity(child_ids.len());
            let mut deduped = Vec::with_capacity(child_ids.len());
            for c in child_ids {
                if seen.insert(*c) {
                    deduped.push(*c);
                } else {
                    warn!("REORDER: duplicate child {c} in childIds, keeping first occurrence");
                }
            }
            *list = deduped;
        }
        Op::Text { id, text } => match node_map.get_mut(id) {
            None => warn!("TEXT: node {id} not found"),
            Some(node) => {
                node.props.insert(ArcStr::from("text"), Value::from(text.as_str()));
            }
        },
    }
}

fn target_list<'a>(
    node_map: &'a mut FxHashMap<NodeId, NodeInstance>,
    root_children: &'a mut Vec<NodeId>,
    parent_id: NodeId,
) -> Option<&'a mut Vec<NodeId>> {
    if parent_id.is_root() {
        Some(root_children)
    } else {
        node_map.get_mut(&parent_id).map(|n| &mut n.children)
    }
}

/// `DELETE`: defensively detach `id` from the root list and every remaining
/// parent, then recursively remove its subtree from `nodeMap`, releasing any
/// callback the removed props held (spec.md §4.5.1, §9 "Subtree-scoped
/// callback release").
fn delete_subtree(
    bridge: &Bridge,
    node_map: &mut FxHashMap<NodeId, NodeInstance>,
    root_children: &mut Vec<NodeId>,
    id: NodeId,
) {
    detach(root_children, id);
    for node in node_map.values_mut() {
        detach(&mut node.children, id);
    }

    let mut stack = vec![id];
    let mut visited = HashSet::new();
    while let Some(next) = stack.pop() {
        if !visited.insert(next) {
            continue;
        }
        if let Some(node) = node_map.remove(&next) {
            release_props_callbacks(bridge, &node.props);
            stack.extend(node.children.iter().copied());
        }
    }
}

/// `REMOVE`: the detached node is not destroyed (it may be re-appended
/// elsewhere), but its own subtree's callbacks are still released — the
/// remaining, still-attached tree is left untouched (spec.md §9,
/// "Subtree-scoped callback release" names `REMOVE`/`DELETE` alike).
fn release_subtree_callbacks(bridge: &Bridge, node_map: &FxHashMap<NodeId, NodeInstance>, id: NodeId) {
    let mut stack = vec![id];
    let mut visited = HashSet::new();
    while let Some(next) = stack.pop() {
        if !visited.insert(next) {
            continue;
        }
        if let Some(node) = node_map.get(&next) {
            release_props_callbacks(bridge, &node.props);
            stack.extend(node.children.iter().copied());
        }
    }
}

fn release_props_callbacks(bridge: &Bridge, props: &duplex_protocol::Props) {
    for value in props.values() {
        value.walk(&mut |v| {
            if let Value::Function(callable) = v {
                if let Some(id) = callable.fn_id() {
                    bridge.release_callback(id);
                }
            }
        });
    }
}
