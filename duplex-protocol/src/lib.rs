//! Operation & batch model, and the dynamic `Value` the whole bridge carries.
//!
//! This is the leaf crate of the workspace (spec.md §2, component 1): it
//! defines ids, the live `Value` representation, and the `Op`/`OperationBatch`
//! wire model, but knows nothing about encoding, registries, or the node
//! tree built on top of it.
pub mod ids;
pub mod op;
pub mod value;

pub use ids::{BatchId, FnId, NodeId, PromiseId, Side};
pub use op::{Op, OperationBatch, Props, TEXT_TAG, WIRE_VERSION};
pub use value::{Callable, PromiseFuture, TypedArray, Value, ValuePromise};
