//! The Bridge (spec.md §4.4): the single entry point either side uses to
//! talk to its peer. An embedder instantiates one `Bridge` per side; the
//! `side` tag decides which half of each `FnId` this instance's registry
//! owns (spec.md §4.1, "Guest/Host partitioning").
use crate::message::{HostMessage, WireHostMessage};
use anyhow::anyhow;
use duplex_codec::{
    decode_batch_with_ctx, encode_batch_with_ctx, DecodeCtx, EncodeCtx, OnRegister,
    PromiseSettleSender, RemoteCallSender, RuleTable, WireOperationBatch,
};
use duplex_protocol::{BatchId, FnId, OperationBatch, PromiseId, Side, Value};
use duplex_registry::{CallbackRegistry, PromiseManager, DEFAULT_TIMEOUT};
use futures::channel::mpsc;
use log::{debug, warn};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Instrumentation sink invoked once per `to_guest`/`to_host` call with the
/// operation name and its wall-clock duration in milliseconds (spec.md §4.4,
/// "Instrumentation hook"). `Receiver` reuses the same sink shape for its own
/// `applyBatch`/`render` timings.
pub type OnMetric = Arc<dyn Fn(&str, f64, Option<u64>) + Send + Sync>;

#[derive(derive_builder::Builder)]
#[builder(pattern = "owned")]
pub struct BridgeConfig {
    /// Which side this Bridge instance's local registry belongs to.
    pub side: Side,
    /// Re-raise synchronous callback throws instead of logging and
    /// swallowing them (spec.md §4.1, §7).
    #[builder(default)]
    pub debug: bool,
    /// Recursion cap applied by the codec (spec.md §4.3).
    #[builder(default = "duplex_codec::DEFAULT_MAX_DEPTH")]
    pub max_depth: usize,
    /// Promise Manager timeout; `Duration::ZERO` disables it (spec.md §4.2).
    #[builder(default = "DEFAULT_TIMEOUT")]
    pub promise_timeout: Duration,
    #[builder(setter(strip_option), default)]
    pub on_metric: Option<OnMetric>,
}

impl BridgeConfig {
    pub fn builder(side: Side) -> BridgeConfigBuilder {
        BridgeConfigBuilder::default().side(side)
    }
}

/// The bidirectional codec+channel abstraction (spec.md §2 component 5).
/// Internals are `Arc`-wrapped so the function/promise proxies it decodes
/// can carry a `'static` callback back into this Bridge's state without
/// borrowing it.
pub struct Bridge {
    side: Side,
    rules: Arc<RuleTable>,
    registry: Arc<CallbackRegistry>,
    promises: PromiseManager,
    next_batch_id: AtomicU64,
    max_depth: usize,
    /// Outbound channel to the peer. The transport is expected to drain
    /// this and ship each message across the sandbox boundary.
    peer_tx: mpsc::UnboundedSender<WireHostMessage>,
    /// Injected release channel (spec.md §4.4: "otherwise route to the
    /// Guest via an injected release channel") for releasing an id this
    /// Bridge's local registry never saw register.
    release_tx: Option<mpsc::UnboundedSender<FnId>>,
    on_metric: Option<OnMetric>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, peer_tx: mpsc::UnboundedSender<WireHostMessage>) -> Self {
        Bridge {
            side: config.side,
            rules: Arc::new(RuleTable::with_builtins()),
            registry: Arc::new(CallbackRegistry::with_debug(config.side, config.debug)),
            promises: PromiseManager::with_timeout(config.promise_timeout),
            next_batch_id: AtomicU64::new(1),
            max_depth: config.max_depth,
            peer_tx,
            release_tx: None,
            on_metric: config.on_metric,
        }
    }

    pub fn with_release_channel(mut self, release_tx: mpsc::UnboundedSender<FnId>) -> Self {
        self.release_tx = Some(release_tx);
        self
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub fn promises(&self) -> &PromiseManager {
        &self.promises
    }

    pub fn next_batch_id(&self) -> BatchId {
        BatchId(self.next_batch_id.fetch_add(1, Ordering::Relaxed))
    }

    fn record(&self, name: &str, started: Instant, extra: Option<u64>) {
        if let Some(sink) = &self.on_metric {
            sink(name, started.elapsed().as_secs_f64() * 1000.0, extra);
        }
    }

    fn promise_settle_sender(&self) -> PromiseSettleSender {
        let rules = self.rules.clone();
        let registry = self.registry.clone();
        let peer_tx = self.peer_tx.clone();
        let max_depth = self.max_depth;
        Arc::new(move |id: PromiseId, result: Result<Value, Value>| {
            // A settling manager never owns the promise that's settling, so
            // a throwaway manager here is fine: the only thing needed is
            // `encode`'s access to the shared registry/rules.
            let scratch_promises = PromiseManager::new();
            let mut ctx = EncodeCtx::new(&rules, &registry, &scratch_promises, Arc::new(|_, _| {}))
                .with_max_depth(max_depth);
            let msg = match result {
                Ok(value) => ctx
                    .encode(&value)
                    .map(|value| WireHostMessage::PromiseResolve { promise_id: id.to_string(), value }),
                Err(error) => ctx
                    .encode(&error)
                    .map(|error| WireHostMessage::PromiseReject { promise_id: id.to_string(), error }),
            };
            match msg {
                Ok(msg) => {
                    let _ = peer_tx.unbounded_send(msg);
                }
                Err(e) => warn!("promise {id} settlement failed to encode: {e:?}"),
            }
        })
    }

    /// A callable that, when invoked, encodes its args and forwards the call
    /// to the peer as `CALL_FUNCTION` (spec.md §4.3, "Function-proxy call
    /// semantics"). Used as the `sender` for every `DecodeCtx` this Bridge
    /// builds, so a decoded proxy's call always crosses back over the
    /// channel regardless of which side actually owns the real function.
    fn remote_call_sender(&self) -> RemoteCallSender {
        let rules = self.rules.clone();
        let registry = self.registry.clone();
        let promises = self.promises.clone();
        let peer_tx = self.peer_tx.clone();
        let max_depth = self.max_depth;
        Arc::new(move |fn_id, args| {
            let mut ctx = EncodeCtx::new(&rules, &registry, &promises, Arc::new(|_, _| {}))
                .with_max_depth(max_depth);
            let wire_args =
                args.iter().map(|a| ctx.encode(a)).collect::<anyhow::Result<Vec<_>>>()?;
            peer_tx
                .unbounded_send(WireHostMessage::CallFunction {
                    fn_id: fn_id.to_string(),
                    args: wire_args,
                    seq: None,
                })
                .map_err(|_| anyhow!("peer channel closed"))
        })
    }

    /// Encode a batch owned by this side and hand it to the Host receiver
    /// (spec.md §4.4: `toHost`). Returns synchronously; the caller is
    /// responsible for actually delivering `wire` to the Host (over the
    /// channel this Bridge's peer is wired to).
    pub fn to_host(&self, batch: &OperationBatch) -> anyhow::Result<WireOperationBatch> {
        let (wire, _ids) = self.encode_batch_inner(batch)?;
        Ok(wire)
    }

    /// Decode a batch that arrived from the Guest (the wire counterpart of
    /// `to_host`, run on the receiving end). Any function/promise the batch
    /// carries is peer-owned; decoding never registers anything in this
    /// side's own registry.
    pub fn from_guest(&self, wire: &WireOperationBatch) -> anyhow::Result<OperationBatch> {
        let started = Instant::now();
        let sender = self.remote_call_sender();
        let mut ctx = DecodeCtx::new(&self.rules, &self.registry, &self.promises, sender)
            .with_max_depth(self.max_depth);
        let result = decode_batch_with_ctx(wire, &mut ctx);
        self.record("fromGuest", started, Some(wire.operations.len() as u64));
        result
    }

    /// Encode a batch owned by this side, reporting the `fnId`s freshly
    /// registered while doing so (spec.md §4.4: `encodeBatchWithTracking`,
    /// "same as `toHost` but also returns the set of fnIds").
    pub fn encode_batch_with_tracking(
        &self,
        batch: &OperationBatch,
    ) -> anyhow::Result<(WireOperationBatch, Vec<FnId>)> {
        self.encode_batch_inner(batch)
    }

    fn encode_batch_inner(
        &self,
        batch: &OperationBatch,
    ) -> anyhow::Result<(WireOperationBatch, Vec<FnId>)> {
        let started = Instant::now();
        let registered = Arc::new(Mutex::new(Vec::new()));
        let on_register: OnRegister = {
            let registered = registered.clone();
            Arc::new(move |id: FnId| registered.lock().push(id))
        };
        let on_settle = self.promise_settle_sender();
        let mut ctx = EncodeCtx::new(&self.rules, &self.registry, &self.promises, on_settle)
            .with_on_register(on_register)
            .with_max_depth(self.max_depth);
        let wire = encode_batch_with_ctx(batch, &mut ctx)?;
        let ids = std::mem::take(&mut *registered.lock());
        self.record("toHost", started, Some(wire.operations.len() as u64));
        Ok((wire, ids))
    }

    /// Encode then deliver a `HostMessage` to the peer (spec.md §4.4:
    /// `toGuest`). Any real function/promise embedded in the message's
    /// payload is registered under this side's registry/promise manager.
    pub fn to_guest(&self, message: HostMessage) -> anyhow::Result<()> {
        let started = Instant::now();
        let on_settle = self.promise_settle_sender();
        let mut ctx = EncodeCtx::new(&self.rules, &self.registry, &self.promises, on_settle)
            .with_max_depth(self.max_depth);
        let wire = encode_host_message(message, &mut ctx)?;
        self.peer_tx.unbounded_send(wire).map_err(|_| anyhow!("peer channel closed"))?;
        self.record("toGuest", started, None);
        Ok(())
    }

    /// Release `fnId` locally if this side's registry owns it; otherwise
    /// route the release across the injected release channel (spec.md
    /// §4.4). A missing release channel just logs — best-effort teardown.
    pub fn release_callback(&self, fn_id: FnId) {
        if fn_id.side() == self.side {
            self.registry.release(fn_id);
            return;
        }
        match &self.release_tx {
            Some(tx) => {
                if tx.unbounded_send(fn_id).is_err() {
                    warn!("release_callback: peer release channel closed for {fn_id}");
                }
            }
            None => debug!("release_callback: no release channel wired for remote {fn_id}"),
        }
    }

    /// Clear this side's registry and promise manager (spec.md §4.4).
    pub fn destroy(&self) {
        self.registry.clear();
        self.promises.clear();
    }
}

fn encode_host_message(
    message: HostMessage,
    ctx: &mut EncodeCtx,
) -> anyhow::Result<WireHostMessage> {
    Ok(match message {
        HostMessage::CallFunction { fn_id, args, seq } => WireHostMessage::CallFunction {
            fn_id: fn_id.to_string(),
            args: args.iter().map(|a| ctx.encode(a)).collect::<anyhow::Result<_>>()?,
            seq,
        },
        HostMessage::HostEvent { event_name, payload } => {
            WireHostMessage::HostEvent { event_name, payload: ctx.encode(&payload)? }
        }
        HostMessage::ConfigUpdate { config } => {
            WireHostMessage::ConfigUpdate { config: ctx.encode(&config)? }
        }
        HostMessage::PromiseResolve { promise_id, value } => WireHostMessage::PromiseResolve {
            promise_id: promise_id.to_string(),
            value: ctx.encode(&value)?,
        },
        HostMessage::PromiseReject { promise_id, error } => WireHostMessage::PromiseReject {
            promise_id: promise_id.to_string(),
            error: ctx.encode(&error)?,
        },
        HostMessage::Destroy => WireHostMessage::Destroy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcstr::ArcStr;
    use duplex_protocol::{NodeId, Op};
    use indexmap::IndexMap;

    fn test_bridge(side: Side) -> (Bridge, mpsc::UnboundedReceiver<WireHostMessage>) {
        let (tx, rx) = mpsc::unbounded();
        let bridge = Bridge::new(BridgeConfig::builder(side).build().unwrap(), tx);
        (bridge, rx)
    }

    #[test]
    fn from_guest_decodes_a_wire_batch() {
        let (bridge, _rx) = test_bridge(Side::Host);
        let mut props = IndexMap::new();
        props.insert("className".to_string(), duplex_codec::Wire::String("card".into()));
        let wire = WireOperationBatch {
            version: 1,
            batch_id: 1,
            operations: vec![duplex_codec::WireOp::Create {
                id: 1,
                type_: "div".to_string(),
                props,
            }],
        };
        let batch = bridge.from_guest(&wire).unwrap();
        assert_eq!(batch.operations.len(), 1);
        match &batch.operations[0] {
            Op::Create { id, type_, .. } => {
                assert_eq!(*id, NodeId(1));
                assert_eq!(type_.as_str(), "div");
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn to_host_encodes_a_domain_batch() {
        let (bridge, _rx) = test_bridge(Side::Guest);
        let batch = OperationBatch::new(
            BatchId(1),
            vec![Op::Create { id: NodeId(1), type_: ArcStr::from("div"), props: IndexMap::new() }],
        );
        let wire = bridge.to_host(&batch).unwrap();
        assert_eq!(wire.operations.len(), 1);
    }

    #[test]
    fn to_guest_delivers_a_destroy_message() {
        let (bridge, mut rx) = test_bridge(Side::Host);
        bridge.to_guest(HostMessage::Destroy).unwrap();
        let msg = rx.try_next().unwrap().unwrap();
        assert_eq!(msg, WireHostMessage::Destroy);
    }

    #[test]
    fn release_callback_local_side_releases_directly() {
        let (bridge, _rx) = test_bridge(Side::Host);
        #[derive(Debug)]
        struct Noop;
        impl duplex_protocol::Callable for Noop {
            fn call(&self, _args: Vec<Value>) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let id = bridge.registry().register(Arc::new(Noop));
        assert!(bridge.registry().has(id));
        bridge.release_callback(id);
        assert!(!bridge.registry().has(id));
    }

    #[test]
    fn release_callback_remote_side_routes_through_release_channel() {
        let (tx, _rx) = mpsc::unbounded();
        let (release_tx, mut release_rx) = mpsc::unbounded();
        let bridge =
            Bridge::new(BridgeConfig::builder(Side::Host).build().unwrap(), tx).with_release_channel(release_tx);
        let guest_id = FnId::new(Side::Guest, 7);
        bridge.release_callback(guest_id);
        assert_eq!(release_rx.try_next().unwrap().unwrap(), guest_id);
    }

    #[test]
    fn encode_batch_with_tracking_reports_newly_registered_functions() {
        let (bridge, _rx) = test_bridge(Side::Guest);
        #[derive(Debug)]
        struct Noop;
        impl duplex_protocol::Callable for Noop {
            fn call(&self, _args: Vec<Value>) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let mut props = IndexMap::new();
        props.insert(ArcStr::from("onPress"), Value::Function(Arc::new(Noop)));
        let batch = OperationBatch::new(
            BatchId(1),
            vec![Op::Create { id: NodeId(1), type_: ArcStr::from("Touchable"), props }],
        );
        let (_wire, ids) = bridge.encode_batch_with_tracking(&batch).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].side(), Side::Guest);
    }
}
