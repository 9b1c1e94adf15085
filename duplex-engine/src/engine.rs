//! The Engine (spec.md §4.6): an external-collaborator shell that creates a
//! sandbox, injects the Guest-facing runtime globals, feeds it a bundle, and
//! enforces a hard load timeout. Everything it talks to (`Bridge`,
//! `Receiver`) is core; the sandbox itself (`ScriptContext`) is not.
use crate::config::EngineConfig;
use crate::globals::install_globals;
use crate::script_context::ScriptContext;
use duplex_bridge::Bridge;
use duplex_protocol::{BatchId, Value};
use duplex_receiver::Receiver;
use log::{error, warn};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Lifecycle events an embedder can observe (spec.md §6.3).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Load,
    Error { message: String },
    FatalError { message: String },
    Destroy,
    Operation { batch_id: BatchId },
    Message { event_name: String, payload: Value },
}

pub type OnEngineEvent = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// One subscription created through `__useHostEvent`.
pub(crate) struct Subscription {
    pub(crate) id: u64,
    pub(crate) callback: Arc<dyn duplex_protocol::Callable>,
}

pub struct Engine<C: ScriptContext> {
    pub(crate) ctx: Arc<C>,
    pub(crate) bridge: Arc<Bridge>,
    pub(crate) receiver: Arc<Receiver>,
    config: EngineConfig,
    on_event: Option<OnEngineEvent>,
    destroyed: AtomicBool,
    pub(crate) subscribers: Mutex<fxhash::FxHashMap<String, Vec<Subscription>>>,
    pub(crate) config_value: Mutex<Value>,
    pub(crate) op_seq: AtomicU64,
    pub(crate) next_sub_id: AtomicU64,
}

impl<C: ScriptContext + 'static> Engine<C> {
    pub fn new(ctx: Arc<C>, bridge: Arc<Bridge>, receiver: Arc<Receiver>, config: EngineConfig) -> Self {
        Engine {
            ctx,
            bridge,
            receiver,
            config,
            on_event: None,
            destroyed: AtomicBool::new(false),
            subscribers: Mutex::new(fxhash::FxHashMap::default()),
            config_value: Mutex::new(Value::Object(Default::default())),
            op_seq: AtomicU64::new(1),
            next_sub_id: AtomicU64::new(1),
        }
    }

    pub fn with_on_event(mut self, on_event: OnEngineEvent) -> Self {
        self.on_event = Some(on_event);
        self
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        if let Some(cb) = &self.on_event {
            cb(event);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Install the runtime globals (spec.md §6.2), await the helper-install
    /// eval, then await the bundle itself — both races against
    /// `hard_load_timeout`. A timeout is fatal: it emits `fatalError` and
    /// force-destroys the sandbox (spec.md §4.6 point 5).
    pub async fn load_bundle(self: &Arc<Self>, helper_install: &str, bundle: &str) -> anyhow::Result<()> {
        if self.is_destroyed() {
            anyhow::bail!("engine already destroyed");
        }
        install_globals(self);

        let work = async {
            self.ctx.eval_async(helper_install).await?;
            self.ctx.eval_async(bundle).await
        };

        match tokio::time::timeout(self.config.hard_load_timeout, work).await {
            Ok(Ok(_)) => {
                self.emit(EngineEvent::Load);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("bundle load failed: {e:?}");
                self.emit(EngineEvent::Error { message: e.to_string() });
                Err(e)
            }
            Err(_elapsed) => {
                let message = format!(
                    "bundle load exceeded hard timeout of {}ms",
                    self.config.hard_load_timeout.as_millis()
                );
                error!("{message}");
                self.emit(EngineEvent::FatalError { message: message.clone() });
                self.force_destroy();
                Err(anyhow::anyhow!(message))
            }
        }
    }

    /// Push a `HOST_EVENT`/`CONFIG_UPDATE`-style message to the Guest,
    /// tracking `config` updates so `__getConfig` reflects the latest value.
    pub fn send_event(&self, event_name: impl Into<String>, payload: Value) -> anyhow::Result<()> {
        self.bridge
            .to_guest(duplex_bridge::HostMessage::HostEvent { event_name: event_name.into(), payload })
    }

    pub fn update_config(&self, config: Value) -> anyhow::Result<()> {
        *self.config_value.lock() = config.clone();
        self.bridge.to_guest(duplex_bridge::HostMessage::ConfigUpdate { config })
    }

    /// Graceful shutdown; converges on the same teardown as `force_destroy`
    /// since there is no separate async-dispose step in this port beyond
    /// what `ScriptContext::dispose` already models.
    pub fn destroy(&self) {
        self.force_destroy();
    }

    /// Idempotent. Clears the registries/promise-manager timers (via
    /// `Bridge::destroy`), drops the Receiver's tree, disposes the sandbox
    /// tolerating any error it raises, then emits `destroy` (spec.md §4.6
    /// point 5, §5 "forceDestroy is idempotent").
    pub fn force_destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bridge.destroy();
        self.receiver.clear();
        if let Err(e) = self.ctx.dispose() {
            warn!("sandbox dispose raised (tolerated): {e:?}");
        }
        self.subscribers.lock().clear();
        self.emit(EngineEvent::Destroy);
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            destroyed: self.is_destroyed(),
            registry_size: self.bridge.registry().size(),
            node_count: self.receiver.get_debug_info().node_count,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineHealth {
    pub destroyed: bool,
    pub registry_size: usize,
    pub node_count: usize,
}

/// Wait up to `timeout` with no cap beyond `tokio::time::timeout`'s own
/// accounting; exposed for callers that want to probe liveness without
/// driving a full bundle load.
pub async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, tokio::time::error::Elapsed> {
    tokio::time::timeout(timeout, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script_context::NullScriptContext;
    use async_trait::async_trait;
    use duplex_bridge::BridgeConfig;
    use duplex_protocol::Side;
    use duplex_receiver::ReceiverConfig;
    use futures::channel::mpsc;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;

    fn fresh_engine() -> (Arc<Engine<NullScriptContext>>, mpsc::UnboundedReceiver<duplex_bridge::WireHostMessage>) {
        fresh_engine_with(None)
    }

    fn fresh_engine_with(
        on_event: Option<OnEngineEvent>,
    ) -> (Arc<Engine<NullScriptContext>>, mpsc::UnboundedReceiver<duplex_bridge::WireHostMessage>) {
        let (tx, rx) = mpsc::unbounded();
        let bridge = Arc::new(Bridge::new(BridgeConfig::builder(Side::Guest).build().unwrap(), tx));
        let receiver = Arc::new(Receiver::new(bridge.clone(), ReceiverConfig::default()));
        let ctx = Arc::new(NullScriptContext::new());
        let mut engine = Engine::new(ctx, bridge, receiver, EngineConfig::default());
        if let Some(cb) = on_event {
            engine = engine.with_on_event(cb);
        }
        (Arc::new(engine), rx)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn load_bundle_succeeds_and_emits_load() {
        let events = Arc::new(PlMutex::new(Vec::new()));
        let events2 = events.clone();
        let (engine, _rx) = fresh_engine_with(Some(Arc::new(move |e| events2.lock().push(e))));
        engine.load_bundle("/* helpers */", "/* bundle */").await.unwrap();
        assert!(matches!(events.lock().last(), Some(EngineEvent::Load)));
        assert!(!engine.is_destroyed());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn load_bundle_already_destroyed_errors_without_touching_globals() {
        let (engine, _rx) = fresh_engine();
        engine.force_destroy();
        assert!(engine.load_bundle("", "").await.is_err());
    }

    struct NeverResolvingContext;

    #[async_trait]
    impl ScriptContext for NeverResolvingContext {
        fn eval(&self, _code: &str) -> anyhow::Result<Value> {
            Ok(Value::Undefined)
        }

        async fn eval_async(&self, _code: &str) -> anyhow::Result<Value> {
            futures::future::pending::<()>().await;
            unreachable!()
        }

        fn set_global(&self, _name: &str, _value: Value) {}

        fn get_global(&self, _name: &str) -> Option<Value> {
            None
        }

        fn set_native_fn(&self, _name: &str, _f: crate::script_context::NativeFn) {}
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn load_bundle_hard_timeout_force_destroys_and_emits_fatal_error() {
        let (tx, _rx) = mpsc::unbounded();
        let bridge = Arc::new(Bridge::new(BridgeConfig::builder(Side::Guest).build().unwrap(), tx));
        let receiver = Arc::new(Receiver::new(bridge.clone(), ReceiverConfig::default()));
        let ctx = Arc::new(NeverResolvingContext);
        let config = EngineConfig::builder().hard_load_timeout(Duration::from_millis(10)).build().unwrap();
        let events = Arc::new(PlMutex::new(Vec::new()));
        let events2 = events.clone();
        let engine = Arc::new(
            Engine::new(ctx, bridge, receiver, config).with_on_event(Arc::new(move |e| events2.lock().push(e))),
        );
        let result = engine.load_bundle("h", "b").await;
        assert!(result.is_err());
        assert!(engine.is_destroyed());
        assert!(events.lock().iter().any(|e| matches!(e, EngineEvent::FatalError { .. })));
        assert!(events.lock().iter().any(|e| matches!(e, EngineEvent::Destroy)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn force_destroy_is_idempotent() {
        let (engine, _rx) = fresh_engine();
        engine.force_destroy();
        engine.force_destroy();
        assert!(engine.is_destroyed());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn globals_register_invoke_and_remove_callback_round_trip() {
        let (engine, _rx) = fresh_engine();
        engine.load_bundle("", "").await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        #[derive(Debug)]
        struct Counter(Arc<AtomicUsize>);
        impl duplex_protocol::Callable for Counter {
            fn call(&self, _args: Vec<Value>) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
        let cb = Value::Function(Arc::new(Counter(count2)));

        let fn_id_value = engine.ctx.call_native("__registerCallback", vec![cb]).unwrap();
        let fn_id = match &fn_id_value {
            Value::String(s) => s.to_string(),
            _ => panic!("expected a string fnId"),
        };

        engine
            .ctx
            .call_native("__invokeCallback", vec![Value::from(fn_id.clone()), Value::Array(vec![])])
            .unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);

        engine.ctx.call_native("__removeCallback", vec![Value::from(fn_id)]).unwrap();
        assert_eq!(engine.bridge.registry().size(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_event_to_host_emits_a_message_event() {
        let events = Arc::new(PlMutex::new(Vec::new()));
        let events2 = events.clone();
        let (engine, _rx) = fresh_engine_with(Some(Arc::new(move |e| events2.lock().push(e))));
        engine.load_bundle("", "").await.unwrap();
        engine
            .ctx
            .call_native("__sendEventToHost", vec![Value::from("ping"), Value::Number(1.0)])
            .unwrap();
        assert!(events.lock().iter().any(|e| matches!(
            e,
            EngineEvent::Message { event_name, .. } if event_name == "ping"
        )));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn use_host_event_subscription_fires_until_unsubscribed() {
        let (engine, _rx) = fresh_engine();
        engine.load_bundle("", "").await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        #[derive(Debug)]
        struct Listener(Arc<AtomicUsize>);
        impl duplex_protocol::Callable for Listener {
            fn call(&self, _args: Vec<Value>) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
        let listener = Value::Function(Arc::new(Listener(count2)));

        let unsub =
            engine.ctx.call_native("__useHostEvent", vec![Value::from("tick"), listener]).unwrap();
        engine.ctx.call_native("__handleHostEvent", vec![Value::from("tick"), Value::Null]).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);

        match unsub {
            Value::Function(f) => f.call(vec![]).unwrap(),
            _ => panic!("expected a function"),
        }
        engine.ctx.call_native("__handleHostEvent", vec![Value::from("tick"), Value::Null]).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn get_config_reflects_update_config() {
        let (engine, _rx) = fresh_engine();
        engine.load_bundle("", "").await.unwrap();
        let mut cfg = indexmap::IndexMap::new();
        cfg.insert(arcstr::ArcStr::from("theme"), Value::from("dark"));
        engine.update_config(Value::Object(cfg)).unwrap();
        let read_back = engine.ctx.call_native("__getConfig", vec![]).unwrap();
        match read_back {
            Value::Object(m) => assert_eq!(m.get("theme"), Some(&Value::from("dark"))),
            _ => panic!("expected an object"),
        }
    }
}
