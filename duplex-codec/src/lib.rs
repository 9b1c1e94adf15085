//! Type-Rule Codec (spec.md §2 component 4): translates between the live
//! `duplex_protocol::Value`/`Op` representation and the `__type`-tagged JSON
//! wire form that actually crosses the boundary.
pub mod batch;
pub mod ctx;
pub mod rules;
pub mod wire;

pub use batch::{decode_batch, decode_batch_with_ctx, encode_batch, encode_batch_with_ctx};
pub use ctx::{
    decode, encode, CallbackProxy, DecodeCtx, EncodeCtx, OnRegister, PromiseSettleSender,
    RemoteCallSender, DEFAULT_MAX_DEPTH,
};
pub use rules::{RuleTable, TypeRule};
pub use wire::{Wire, WireOp, WireOperationBatch};
