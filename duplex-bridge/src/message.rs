//! `HostMessage` and its wire shape (spec.md §4.4, §6.1).
use duplex_codec::Wire;
use duplex_protocol::{FnId, PromiseId, Value};
use serde::{Deserialize, Serialize};

/// Message sent by the Host to the Guest over `Bridge::to_guest`. Mirrors
/// the `type`-tagged records of spec.md §6.1 one for one.
#[derive(Debug, Clone)]
pub enum HostMessage {
    CallFunction { fn_id: FnId, args: Vec<Value>, seq: Option<u64> },
    HostEvent { event_name: String, payload: Value },
    ConfigUpdate { config: Value },
    PromiseResolve { promise_id: PromiseId, value: Value },
    PromiseReject { promise_id: PromiseId, error: Value },
    Destroy,
}

/// The `__type`-style wire record for a `HostMessage`, after every `Value`
/// field has been run through the codec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WireHostMessage {
    #[serde(rename = "CALL_FUNCTION")]
    CallFunction {
        #[serde(rename = "fnId")]
        fn_id: String,
        args: Vec<Wire>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    #[serde(rename = "HOST_EVENT")]
    HostEvent {
        #[serde(rename = "eventName")]
        event_name: String,
        payload: Wire,
    },
    #[serde(rename = "CONFIG_UPDATE")]
    ConfigUpdate { config: Wire },
    #[serde(rename = "PROMISE_RESOLVE")]
    PromiseResolve {
        #[serde(rename = "promiseId")]
        promise_id: String,
        value: Wire,
    },
    #[serde(rename = "PROMISE_REJECT")]
    PromiseReject {
        #[serde(rename = "promiseId")]
        promise_id: String,
        error: Wire,
    },
    #[serde(rename = "DESTROY")]
    Destroy,
}
