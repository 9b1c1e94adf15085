//! Shared two-sided harness: a Guest `Bridge` and a Host `Bridge` wired so a
//! function/promise that crosses one way can be driven back the other,
//! mirroring how an embedder would actually wire `peer_tx` to a real
//! transport (spec.md §4.4, §6.1).
#![allow(dead_code)]
use duplex_bridge::{Bridge, BridgeConfig, WireHostMessage};
use duplex_codec::WireOperationBatch;
use duplex_protocol::{FnId, Side, Value};
use futures::channel::mpsc;
use std::sync::Arc;

pub struct TwoSides {
    pub guest: Arc<Bridge>,
    pub host: Arc<Bridge>,
    /// Messages the Guest bridge sent, waiting to be delivered to the Host.
    pub guest_to_host: mpsc::UnboundedReceiver<WireHostMessage>,
    /// Messages the Host bridge sent, waiting to be delivered to the Guest.
    pub host_to_guest: mpsc::UnboundedReceiver<WireHostMessage>,
}

pub fn two_bridges() -> TwoSides {
    let (guest_tx, guest_to_host) = mpsc::unbounded();
    let (host_tx, host_to_guest) = mpsc::unbounded();
    let guest = Arc::new(Bridge::new(BridgeConfig::builder(Side::Guest).build().unwrap(), guest_tx));
    let host = Arc::new(Bridge::new(BridgeConfig::builder(Side::Host).build().unwrap(), host_tx));
    TwoSides { guest, host, guest_to_host, host_to_guest }
}

/// Pop the next `CALL_FUNCTION` message and invoke it against whichever
/// side's registry actually owns `fn_id`, returning the decoded args the
/// original closure observed.
pub fn deliver_one_call(
    rx: &mut mpsc::UnboundedReceiver<WireHostMessage>,
    owner: &Bridge,
) -> anyhow::Result<Vec<Value>> {
    let msg = rx.try_next().expect("a message was expected").expect("channel open");
    match msg {
        WireHostMessage::CallFunction { fn_id, args, .. } => {
            let sender: duplex_codec::RemoteCallSender = Arc::new(|_, _| Ok(()));
            let rules = duplex_codec::RuleTable::with_builtins();
            let mut ctx = duplex_codec::DecodeCtx::new(
                &rules,
                owner.registry(),
                owner.promises(),
                sender,
            );
            let decoded_args =
                args.iter().map(|w| ctx.decode(w)).collect::<anyhow::Result<Vec<_>>>()?;
            let parsed: FnId = fn_id.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            owner.registry().invoke(parsed, decoded_args.clone())?;
            Ok(decoded_args)
        }
        other => anyhow::bail!("expected CALL_FUNCTION, got {other:?}"),
    }
}

pub fn empty_batch(version: u32, batch_id: u64) -> WireOperationBatch {
    WireOperationBatch { version, batch_id, operations: Vec::new() }
}
