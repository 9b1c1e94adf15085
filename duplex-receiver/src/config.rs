use derive_builder::Builder;
use std::time::Duration;

/// Default cap on operations applied from a single batch (spec.md §4.5,
/// §5 "Backpressure").
pub const DEFAULT_MAX_BATCH_SIZE: usize = 5000;
/// Default query window used by `Receiver::attribution_window()` with no
/// explicit argument (spec.md §4.5.2).
pub const DEFAULT_ATTRIBUTION_WINDOW: Duration = Duration::from_secs(5);
/// Default age past which a retained `ApplyStats` sample is evicted
/// regardless of count (spec.md §4.5.2, §9).
pub const DEFAULT_ATTRIBUTION_HISTORY: Duration = Duration::from_secs(60);
/// Default count cap on retained samples regardless of age.
pub const DEFAULT_ATTRIBUTION_MAX_SAMPLES: usize = 200;

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct ReceiverConfig {
    #[builder(default = "DEFAULT_MAX_BATCH_SIZE")]
    pub max_batch_size: usize,
    #[builder(default = "DEFAULT_ATTRIBUTION_WINDOW")]
    pub attribution_window: Duration,
    #[builder(default = "DEFAULT_ATTRIBUTION_HISTORY")]
    pub attribution_history: Duration,
    #[builder(default = "DEFAULT_ATTRIBUTION_MAX_SAMPLES")]
    pub attribution_max_samples: usize,
    #[builder(setter(strip_option), default)]
    pub on_metric: Option<duplex_bridge::OnMetric>,
}

impl ReceiverConfig {
    pub fn builder() -> ReceiverConfigBuilder {
        ReceiverConfigBuilder::default()
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            attribution_window: DEFAULT_ATTRIBUTION_WINDOW,
            attribution_history: DEFAULT_ATTRIBUTION_HISTORY,
            attribution_max_samples: DEFAULT_ATTRIBUTION_MAX_SAMPLES,
            on_metric: None,
        }
    }
}
