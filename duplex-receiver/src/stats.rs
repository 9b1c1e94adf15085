//! Per-batch and rolling attribution accounting (spec.md §4.5.2, §9
//! "Attribution accounting").
use duplex_protocol::BatchId;
use fxhash::FxHashMap;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

const TOP_N: usize = 6;

/// Result of a single `Receiver::apply_batch` call (spec.md §4.5.2).
#[derive(Debug, Clone)]
pub struct ApplyStats {
    pub batch_id: BatchId,
    pub total: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration_ms: f64,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub node_delta: i64,
    pub op_counts: FxHashMap<&'static str, u32>,
    pub skipped_op_counts: FxHashMap<&'static str, u32>,
    pub top_node_types: Vec<(String, u32)>,
    pub top_node_types_skipped: Vec<(String, u32)>,
}

impl ApplyStats {
    /// Source of truth for P4: `applied + skipped + failed == total`.
    pub fn is_consistent(&self) -> bool {
        self.applied + self.skipped + self.failed == self.total
    }
}

impl Default for ApplyStats {
    fn default() -> Self {
        ApplyStats {
            batch_id: BatchId(0),
            total: 0,
            applied: 0,
            skipped: 0,
            failed: 0,
            duration_ms: 0.0,
            nodes_before: 0,
            nodes_after: 0,
            node_delta: 0,
            op_counts: FxHashMap::default(),
            skipped_op_counts: FxHashMap::default(),
            top_node_types: Vec::new(),
            top_node_types_skipped: Vec::new(),
        }
    }
}

/// Rank `counts` by value descending, keeping the first `TOP_N`. Ties break
/// on key so the result is deterministic.
pub fn top_n(counts: &FxHashMap<String, u32>) -> Vec<(String, u32)> {
    let mut v: Vec<(String, u32)> = counts.iter().map(|(k, n)| (k.clone(), *n)).collect();
    v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    v.truncate(TOP_N);
    v
}

/// One retained `ApplyStats`, timestamped for eviction (spec.md §9: "Keep
/// per-batch ApplyStats in a ring buffer bounded by both time (history_ms)
/// and count (max_samples)").
struct Sample {
    at: Instant,
    stats: ApplyStats,
}

/// Rolling history of recent `ApplyStats`, evicted by age and capped by
/// count.
pub struct AttributionHistory {
    history_window: Duration,
    max_samples: usize,
    samples: VecDeque<Sample>,
}

impl AttributionHistory {
    pub fn new(history_window: Duration, max_samples: usize) -> Self {
        AttributionHistory { history_window, max_samples, samples: VecDeque::new() }
    }

    pub fn push(&mut self, stats: ApplyStats, now: Instant) {
        self.samples.push_back(Sample { at: now, stats });
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > self.history_window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&ApplyStats> {
        self.samples.back().map(|s| &s.stats)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Build an `AttributionWindow` from samples observed within the last
    /// `window` of `now` (spec.md §4.5.2: default query window 5s, drawn
    /// from up to `history_window`/`max_samples` of retained history).
    pub fn window(&self, window: Duration, now: Instant) -> AttributionWindow {
        let mut out = AttributionWindow { window_ms: window.as_millis() as u64, ..Default::default() };
        for Sample { at, stats } in &self.samples {
            if now.duration_since(*at) > window {
                continue;
            }
            out.sample_count += 1;
            out.total_applied += stats.applied as u64;
            out.total_skipped += stats.skipped as u64;
            out.total_failed += stats.failed as u64;
            for (tag, n) in &stats.op_counts {
                *out.op_counts.entry(tag).or_insert(0) += *n as u64;
            }
            replace_if(&mut out.largest, stats, |s| s.total as i64);
            replace_if(&mut out.slowest, stats, |s| s.duration_ms as i64);
            replace_if(&mut out.most_skipped, stats, |s| s.skipped as i64);
            replace_if(&mut out.most_growth, stats, |s| s.node_delta.unsigned_abs() as i64);
        }
        out
    }
}

fn replace_if(slot: &mut Option<ApplyStats>, candidate: &ApplyStats, key: impl Fn(&ApplyStats) -> i64) {
    let better = match slot {
        None => true,
        Some(current) => key(candidate) > key(current),
    };
    if better {
        *slot = Some(candidate.clone());
    }
}

/// Rolling summary over a query window, with four worst-batch exemplars
/// (spec.md §4.5.2).
#[derive(Debug, Clone, Default)]
pub struct AttributionWindow {
    pub window_ms: u64,
    pub sample_count: usize,
    pub total_applied: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub op_counts: FxHashMap<&'static str, u64>,
    pub largest: Option<ApplyStats>,
    pub slowest: Option<ApplyStats>,
    pub most_skipped: Option<ApplyStats>,
    pub most_growth: Option<ApplyStats>,
}
