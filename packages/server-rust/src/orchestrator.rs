//! The coordinator: owns the registry, serves registrations, gates startup
//! on persistence availability, and wires intake deliveries to the router.
//!
//! Deferred startup: `new()` allocates state, `init()` loads persisted
//! registry entries, `listen()` binds the broker endpoints and blocks
//! until the coordinator reaches `Running` -- which it refuses to do until
//! a persistence module is registered, so no message is ever taken in
//! without somewhere durable to land it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use datafeed_core::{RegisterReply, RegisterRequest};

use crate::broker::{Broker, BrokerContext, ReplySocket};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::intake::IntakeRunnable;
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::registry::ModuleRegistry;
use crate::storage::DocumentStore;
use crate::worker::BackgroundWorker;

/// How long shutdown waits for in-flight handlers to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A single coordinator instance.
///
/// One orchestrator owns one registry; instances do not share state and no
/// distributed coordination is attempted.
pub struct Orchestrator {
    config: OrchestratorConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn DocumentStore>,
    registry: Arc<ModuleRegistry>,
    lifecycle: Arc<LifecycleController>,
    ctx: parking_lot::Mutex<Option<Arc<dyn BrokerContext>>>,
    intake_worker: parking_lot::Mutex<Option<BackgroundWorker<IntakeRunnable>>>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Creates a coordinator in the `Created` state. Nothing is loaded or
    /// bound yet.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let registry = Arc::new(ModuleRegistry::new(
            store.clone(),
            config.modules_collection.clone(),
        ));
        Self {
            config,
            broker,
            store,
            registry,
            lifecycle: Arc::new(LifecycleController::new()),
            ctx: parking_lot::Mutex::new(None),
            intake_worker: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// The shared module registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ModuleRegistry> {
        Arc::clone(&self.registry)
    }

    /// The lifecycle controller (state, shutdown signal, in-flight count).
    #[must_use]
    pub fn lifecycle(&self) -> Arc<LifecycleController> {
        Arc::clone(&self.lifecycle)
    }

    /// Loads persisted registry state, replaying each stored module
    /// through the registration path. Idempotent: a second call is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Storage`] when the store cannot be
    /// read.
    pub async fn init(&self) -> Result<(), OrchestratorError> {
        if self.lifecycle.state() != LifecycleState::Created {
            debug!("init() after initialization is a no-op");
            return Ok(());
        }
        self.lifecycle.advance(LifecycleState::Initializing);
        info!(name = %self.config.name, "initializing orchestrator");

        self.store.load().await.map_err(OrchestratorError::Storage)?;
        let replayed = self.registry.load().await?;
        info!(modules = replayed, "registry state loaded");
        Ok(())
    }

    /// Opens the registration endpoint, waits for a persistence module,
    /// then opens message intake. Returns once the coordinator is
    /// `Running`; calling it again at that point is a no-op.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Connection`] when the broker is unreachable
    /// (the bootstrap layer decides whether to exit),
    /// [`OrchestratorError::NoPersistenceModule`] when a configured
    /// `persistence_max_wait` expires, and [`OrchestratorError::BrokerClosed`]
    /// when shutdown interrupts startup.
    pub async fn listen(&self) -> Result<(), OrchestratorError> {
        match self.lifecycle.state() {
            LifecycleState::Running => {
                debug!("listen() while running is a no-op");
                return Ok(());
            }
            LifecycleState::Created => self.init().await?,
            LifecycleState::Initializing | LifecycleState::AwaitingPersistenceModule => {}
            LifecycleState::ShuttingDown | LifecycleState::Stopped => {
                return Err(OrchestratorError::BrokerClosed)
            }
        }

        let ctx = self.broker.connect(&self.config.broker_url).await?;
        let previous = self.ctx.lock().replace(Arc::clone(&ctx));
        if let Some(previous) = previous {
            // A retried startup (e.g. after a gate timeout) reconnects.
            previous.close().await;
        }

        let reply = ctx.reply(&self.config.register_queue).await?;
        self.lifecycle.advance(LifecycleState::AwaitingPersistenceModule);
        info!(
            queue = %self.config.register_queue,
            "registration endpoint open; accepting modules"
        );
        self.spawn_registration_loop(reply);

        self.await_persistence_module().await?;

        let worker_socket = ctx
            .worker_pull(&self.config.messages_queue, self.config.intake_prefetch)
            .await?;
        let runnable = IntakeRunnable::new(self.registry.clone(), Arc::clone(&ctx));
        let worker = BackgroundWorker::start(
            runnable,
            self.config.intake_queue_depth,
            self.config.autosave_interval,
        );
        let sender = worker.sender().ok_or(OrchestratorError::BrokerClosed)?;
        *self.intake_worker.lock() = Some(worker);

        let pump = tokio::spawn(async move {
            let mut socket = worker_socket;
            while let Some(delivery) = socket.next().await {
                if sender.send(delivery).await.is_err() {
                    break;
                }
            }
            debug!("intake stream ended");
        });
        self.tasks.lock().push(pump);

        self.lifecycle.advance(LifecycleState::Running);
        info!(
            name = %self.config.name,
            queue = %self.config.messages_queue,
            "orchestrator running; message intake open"
        );
        Ok(())
    }

    /// Graceful shutdown: stop intake, close the broker context, flush the
    /// registry, drain handlers. Idempotent; calling it when not running
    /// is a no-op.
    pub async fn shutdown(&self) {
        match self.lifecycle.state() {
            LifecycleState::ShuttingDown | LifecycleState::Stopped => return,
            LifecycleState::Created => {
                self.lifecycle.advance(LifecycleState::Stopped);
                return;
            }
            _ => {}
        }
        info!(name = %self.config.name, "shutting down orchestrator");
        self.lifecycle.trigger_shutdown();

        let worker = self.intake_worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }

        let ctx = self.ctx.lock().take();
        if let Some(ctx) = ctx {
            ctx.close().await;
            info!("broker context closed");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        if let Err(err) = self.registry.save().await {
            warn!(error = %err, "registry flush on shutdown failed");
        }
        if let Err(err) = self.store.close().await {
            warn!(error = %err, "storage close failed");
        }

        if !self.lifecycle.wait_for_drain(DRAIN_TIMEOUT).await {
            warn!("drain timeout expired with handlers still in flight");
            self.lifecycle.advance(LifecycleState::Stopped);
        }
        info!(name = %self.config.name, "orchestrator stopped");
    }

    /// Serves registration requests until the socket stream ends.
    fn spawn_registration_loop(&self, mut reply: Box<dyn ReplySocket>) {
        let registry = self.registry.clone();
        let lifecycle = self.lifecycle.clone();
        let task = tokio::spawn(async move {
            while let Some(request) = reply.next().await {
                let _guard = lifecycle.in_flight_guard();
                let response = handle_registration(&registry, &request.payload).await;
                request.respond(response);
            }
            debug!("registration stream ended");
        });
        self.tasks.lock().push(task);
    }

    /// Blocks until a persistence module is registered.
    ///
    /// Selects on the registry's availability watch and a fixed-interval
    /// poll; cancellable only by shutdown. Without a configured
    /// `persistence_max_wait` a misconfigured deployment waits forever --
    /// deliberately, and loudly.
    async fn await_persistence_module(&self) -> Result<(), OrchestratorError> {
        if self.registry.has_persistence_module() {
            return Ok(());
        }
        info!(
            "waiting for a persistence module; message intake stays closed until one registers"
        );

        let mut available: watch::Receiver<bool> = self.registry.persistence_watch();
        let mut shutdown = self.lifecycle.shutdown_receiver();
        let mut poll = tokio::time::interval(self.config.persistence_poll_interval);
        let deadline = self
            .config
            .persistence_max_wait
            .map(|max_wait| tokio::time::Instant::now() + max_wait);

        loop {
            if self.registry.has_persistence_module() {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    warn!("gave up waiting for a persistence module");
                    return Err(OrchestratorError::NoPersistenceModule);
                }
            }
            tokio::select! {
                _ = poll.tick() => {
                    debug!("still waiting for a persistence module");
                }
                changed = available.changed() => {
                    if changed.is_err() {
                        return Err(OrchestratorError::BrokerClosed);
                    }
                }
                _ = shutdown.changed() => {
                    return Err(OrchestratorError::BrokerClosed);
                }
            }
        }
    }
}

/// Handles one registration request, always producing a reply body: the
/// resolved module on success, the error otherwise. Failures are contained
/// per-request and never disturb coordinator state.
async fn handle_registration(registry: &ModuleRegistry, payload: &[u8]) -> Vec<u8> {
    let reply = match serde_json::from_slice::<RegisterRequest>(payload) {
        Err(err) => {
            warn!(error = %err, "rejecting unparseable registration");
            RegisterReply::Rejected {
                error: format!("invalid registration payload: {err}"),
            }
        }
        Ok(request) => match registry.register(request).await {
            Ok(module) => RegisterReply::Registered(Box::new(module)),
            Err(err) => {
                warn!(error = %err, "rejecting registration");
                RegisterReply::Rejected {
                    error: err.to_string(),
                }
            }
        },
    };
    serde_json::to_vec(&reply).unwrap_or_else(|_| br#"{"error":"internal error"}"#.to_vec())
}

#[cfg(test)]
mod tests {
    use datafeed_core::ModuleKind;
    use serde_json::{json, Value};

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::client::ModuleClient;
    use crate::config::ClientConfig;
    use crate::modules::{ArchiveConfig, ArchiveModule};
    use crate::storage::{DocumentStore, MemoryDocumentStore};

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            persistence_poll_interval: Duration::from_millis(50),
            persistence_max_wait: Some(Duration::from_secs(5)),
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator(
        config: OrchestratorConfig,
    ) -> (Arc<Orchestrator>, MemoryBroker, Arc<MemoryDocumentStore>) {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryDocumentStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            Arc::new(broker.clone()),
            store.clone(),
        ));
        (orchestrator, broker, store)
    }

    async fn wait_for_state(orchestrator: &Orchestrator, state: LifecycleState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while orchestrator.lifecycle.state() != state {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for state {state:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let (orchestrator, _broker, _store) = orchestrator(test_config());
        orchestrator.init().await.unwrap();
        assert_eq!(orchestrator.lifecycle.state(), LifecycleState::Initializing);
        orchestrator.init().await.unwrap();
    }

    #[tokio::test]
    async fn never_runs_without_a_persistence_module() {
        let config = OrchestratorConfig {
            persistence_max_wait: Some(Duration::from_millis(200)),
            persistence_poll_interval: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        };
        let (orchestrator, _broker, _store) = orchestrator(config);

        let err = orchestrator.listen().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoPersistenceModule));
        assert_eq!(
            orchestrator.lifecycle.state(),
            LifecycleState::AwaitingPersistenceModule
        );
    }

    #[tokio::test]
    async fn transitions_to_running_once_persistence_registers() {
        let (orchestrator, broker, _store) = orchestrator(test_config());

        let listening = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.listen().await })
        };
        wait_for_state(&orchestrator, LifecycleState::AwaitingPersistenceModule).await;

        let ctx = broker.connect("mem://client").await.unwrap();
        let _archive = ModuleClient::register(
            ctx,
            RegisterRequest {
                kind: Some(ModuleKind::Persistence),
                ..RegisterRequest::for_service("archive")
            },
            &ClientConfig::default(),
        )
        .await
        .unwrap();

        listening.await.unwrap().unwrap();
        assert!(orchestrator.lifecycle.is_running());

        orchestrator.shutdown().await;
        assert_eq!(orchestrator.lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn listen_while_running_is_a_no_op() {
        let (orchestrator, broker, _store) = orchestrator(test_config());
        let listening = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.listen().await })
        };
        wait_for_state(&orchestrator, LifecycleState::AwaitingPersistenceModule).await;

        let ctx = broker.connect("mem://client").await.unwrap();
        let _archive = ArchiveModule::spawn(
            ctx,
            Arc::new(MemoryDocumentStore::new()),
            &ClientConfig::default(),
            ArchiveConfig::default(),
        )
        .await
        .unwrap();
        listening.await.unwrap().unwrap();

        orchestrator.listen().await.unwrap();
        assert!(orchestrator.lifecycle.is_running());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn bad_registration_is_contained() {
        let (orchestrator, broker, _store) = orchestrator(test_config());
        let listening = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.listen().await })
        };
        wait_for_state(&orchestrator, LifecycleState::AwaitingPersistenceModule).await;

        let ctx = broker.connect("mem://client").await.unwrap();
        let _archive = ArchiveModule::spawn(
            ctx.clone(),
            Arc::new(MemoryDocumentStore::new()),
            &ClientConfig::default(),
            ArchiveConfig::default(),
        )
        .await
        .unwrap();
        listening.await.unwrap().unwrap();

        // Missing service class: rejected, surfaced to the client.
        let err = ModuleClient::register(
            ctx.clone(),
            RegisterRequest::for_service(""),
            &ClientConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation { .. }));

        // The coordinator keeps serving registrations afterwards.
        assert!(orchestrator.lifecycle.is_running());
        let ok = ModuleClient::register(
            ctx,
            RegisterRequest::for_service("geocoder"),
            &ClientConfig::default(),
        )
        .await;
        assert!(ok.is_ok());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_safe_when_created() {
        let (orchestrator, _broker, _store) = orchestrator(test_config());
        orchestrator.shutdown().await;
        assert_eq!(orchestrator.lifecycle.state(), LifecycleState::Stopped);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn full_cycle_stores_then_dispatches_then_terminates() {
        let (orchestrator, broker, store) = orchestrator(test_config());
        let listening = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.listen().await })
        };
        wait_for_state(&orchestrator, LifecycleState::AwaitingPersistenceModule).await;

        // The archive module shares the coordinator's store so the test
        // can observe what was persisted.
        let ctx = broker.connect("mem://client").await.unwrap();
        let _archive = ArchiveModule::spawn(
            ctx.clone(),
            store.clone(),
            &ClientConfig::default(),
            ArchiveConfig::default(),
        )
        .await
        .unwrap();
        listening.await.unwrap().unwrap();

        // A processor that wants addresses it has not located yet.
        let mut processor = ModuleClient::register(
            ctx.clone(),
            RegisterRequest {
                positive_match: Some("$.address".to_string()),
                negative_match: Some("$.located".to_string()),
                ..RegisterRequest::for_service("geocoder")
            },
            &ClientConfig::default(),
        )
        .await
        .unwrap();
        let mut deliveries = processor.deliveries();

        // A fresh message (no routing stamp) enters the intake queue.
        let push = ctx.push("o_messages").await.unwrap();
        push.send(serde_json::to_vec(&json!({ "uuid": "abc", "address": "x" })).unwrap())
            .await
            .unwrap();

        // It is stored first, then dispatched to the processor bare.
        let delivery = tokio::time::timeout(Duration::from_secs(2), deliveries.recv())
            .await
            .expect("processor should receive the message")
            .unwrap();
        let (mut message, token) = delivery.into_parts();
        assert_eq!(message["address"], json!("x"));
        assert!(message.as_object().unwrap().get("__meta").is_none());

        let archived = store.get("messages", "abc").await.unwrap().unwrap();
        assert_eq!(archived["address"], json!("x"));

        // The processor finishes its work and completes.
        message["located"] = json!(true);
        processor.complete(message, token).await.unwrap();

        // The completion is re-archived (same uuid, replaced copy) ...
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let current = store.get("messages", "abc").await.unwrap();
            if current.is_some_and(|doc| doc["located"] == json!(true)) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for the re-archived message"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // ... and its re-dispatch matches nothing (negative predicate now
        // selects), so the pipeline ends: no further delivery arrives.
        let extra = tokio::time::timeout(Duration::from_millis(300), deliveries.recv()).await;
        assert!(extra.is_err(), "pipeline should terminate after location is set");

        orchestrator.shutdown().await;
        assert_eq!(orchestrator.lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn registry_survives_restart_via_the_store() {
        let store = Arc::new(MemoryDocumentStore::new());
        let broker = MemoryBroker::new();

        let first = Orchestrator::new(
            test_config(),
            Arc::new(broker.clone()),
            store.clone(),
        );
        first.init().await.unwrap();
        first
            .registry()
            .register(RegisterRequest::for_service("geocoder"))
            .await
            .unwrap();

        let second = Orchestrator::new(test_config(), Arc::new(broker), store);
        second.init().await.unwrap();
        let modules = second.registry().modules();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].service_class, "geocoder");
    }

    #[tokio::test]
    async fn handle_registration_replies_with_resolved_module() {
        let registry = ModuleRegistry::new(Arc::new(MemoryDocumentStore::new()), "modules");
        let payload = serde_json::to_vec(&json!({ "serviceClass": "geocoder" })).unwrap();

        let reply = handle_registration(&registry, &payload).await;
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["serviceClass"], json!("geocoder"));
        assert!(reply["workQueueName"].as_str().is_some());
    }

    #[tokio::test]
    async fn handle_registration_replies_with_error_for_garbage() {
        let registry = ModuleRegistry::new(Arc::new(MemoryDocumentStore::new()), "modules");
        let reply = handle_registration(&registry, b"not json").await;
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert!(reply["error"].as_str().is_some());
    }
}
