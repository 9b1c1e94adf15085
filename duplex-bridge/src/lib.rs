//! Bridge (spec.md §2 component 5): the single entry point either side uses
//! to talk to its peer — owns the codec, the registries, and the channel
//! shape (spec.md §4.4).
pub mod bridge;
pub mod message;

pub use bridge::{Bridge, BridgeConfig, BridgeConfigBuilder, OnMetric};
pub use message::{HostMessage, WireHostMessage};
