//! Callback Registry and Promise Manager (spec.md §2 components 2 & 3).
pub mod callback;
pub mod promise;

pub use callback::CallbackRegistry;
pub use promise::{PromiseManager, DEFAULT_TIMEOUT};
