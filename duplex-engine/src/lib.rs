//! Engine (spec.md §2 component 7, §4.6): the external-collaborator shell
//! around a sandbox — bundle loading, runtime globals, lifecycle events.
pub mod config;
pub mod engine;
mod globals;
pub mod script_context;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::{Engine, EngineEvent, EngineHealth, OnEngineEvent};
pub use script_context::{NativeFn, NullScriptContext, ScriptContext};
