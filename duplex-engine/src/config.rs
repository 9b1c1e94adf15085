use derive_builder::Builder;
use std::time::Duration;

/// Default hard timeout on bundle load (spec.md §4.6 point 5, §5).
pub const DEFAULT_HARD_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct EngineConfig {
    #[builder(default = "DEFAULT_HARD_LOAD_TIMEOUT")]
    pub hard_load_timeout: Duration,
    /// Re-raise synchronous callback throws rather than swallow them,
    /// threaded through to the `Bridge`'s own debug flag expectations
    /// (spec.md §4.1, §7).
    #[builder(default)]
    pub debug: bool,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { hard_load_timeout: DEFAULT_HARD_LOAD_TIMEOUT, debug: false }
    }
}
