//! Two-phase message intake: store first, dispatch second.
//!
//! Every inbound message is classified by its `__meta` stamp. A message
//! stamped by the persistence module is already durable and goes through
//! the router; everything else -- fresh arrivals and processor completions
//! alike -- is forwarded to the persistence module first, so storage
//! happens exactly once per message before any processor sees it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use datafeed_core::{peek, strip, RouteMeta};
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::{BrokerContext, PushSocket, WorkDelivery};
use crate::error::OrchestratorError;
use crate::registry::ModuleRegistry;
use crate::router::MessageRouter;
use crate::worker::BackgroundRunnable;

/// What to do with an inbound message.
#[derive(Debug, PartialEq, Eq)]
pub enum IntakePhase {
    /// Not yet durable: forward to the persistence module.
    Store,
    /// Durably stored; run the router with the producer's identity.
    Dispatch(RouteMeta),
}

impl IntakePhase {
    /// Classifies a message by its routing stamp. Only a stamp from the
    /// persistence module marks a message as durable; a processor stamp or
    /// no stamp at all means "store first".
    #[must_use]
    pub fn classify(message: &Value) -> Self {
        match peek(message) {
            Some(meta) if meta.is_persisted() => Self::Dispatch(meta),
            _ => Self::Store,
        }
    }
}

/// The coordinator's intake handler, driven by the background worker so
/// all registry reads and dispatch decisions run on one logical thread.
pub struct IntakeRunnable {
    registry: Arc<ModuleRegistry>,
    router: MessageRouter,
    ctx: Arc<dyn BrokerContext>,
    outbound: HashMap<String, Box<dyn PushSocket>>,
}

impl IntakeRunnable {
    /// Creates the handler over the shared registry and broker context.
    #[must_use]
    pub fn new(registry: Arc<ModuleRegistry>, ctx: Arc<dyn BrokerContext>) -> Self {
        Self {
            router: MessageRouter::new(registry.clone()),
            registry,
            ctx,
            outbound: HashMap::new(),
        }
    }

    /// Handles one raw intake payload.
    ///
    /// # Errors
    ///
    /// `Parse` for undecodable bytes, `NoPersistenceModule` when a message
    /// needs storing and none is registered; both are contained by the
    /// caller (reported, message dropped, no retry).
    async fn handle(&mut self, payload: &[u8]) -> Result<(), OrchestratorError> {
        let mut message: Value =
            serde_json::from_slice(payload).map_err(OrchestratorError::Parse)?;

        match IntakePhase::classify(&message) {
            IntakePhase::Store => {
                let target = self
                    .registry
                    .persistence_module()
                    .ok_or(OrchestratorError::NoPersistenceModule)?;
                // The envelope travels unchanged: a processor's stamp stays
                // attached so the producer identity survives the storage hop.
                debug!(queue = %target.work_queue_name, "forwarding message for storage");
                metrics::counter!("datafeed_messages_stored_total").increment(1);
                self.forward(&target.work_queue_name, &message).await
            }
            IntakePhase::Dispatch(_) => {
                let sender = strip(&mut message);
                match self.router.route(&message, sender.as_ref()) {
                    Some(target) => self.forward(&target.work_queue_name, &message).await,
                    None => Ok(()),
                }
            }
        }
    }

    async fn forward(&mut self, queue: &str, message: &Value) -> Result<(), OrchestratorError> {
        if !self.outbound.contains_key(queue) {
            let socket = self.ctx.push(queue).await?;
            self.outbound.insert(queue.to_string(), socket);
        }
        let socket = self
            .outbound
            .get(queue)
            .expect("socket inserted just above");
        let bytes = serde_json::to_vec(message).map_err(OrchestratorError::Parse)?;
        socket.send(bytes).await
    }
}

#[async_trait]
impl BackgroundRunnable for IntakeRunnable {
    type Task = WorkDelivery;

    async fn run(&mut self, delivery: WorkDelivery) {
        if let Err(err) = self.handle(&delivery.payload).await {
            match &err {
                OrchestratorError::Parse(_) => {
                    metrics::counter!("datafeed_messages_parse_errors_total").increment(1);
                    warn!(error = %err, "discarding unparseable message");
                }
                OrchestratorError::NoPersistenceModule => {
                    metrics::counter!("datafeed_messages_dropped_total").increment(1);
                    warn!(error = %err, "dropping message; check deployment configuration");
                }
                _ => warn!(error = %err, "intake handling failed; message dropped"),
            }
        }
        // Processed (or deliberately dropped) either way; the core never
        // retries a message.
        delivery.ack.ack();
    }

    async fn on_tick(&mut self) {
        if let Err(err) = self.registry.save().await {
            warn!(error = %err, "registry autosave failed");
        }
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.registry.save().await {
            warn!(error = %err, "registry save on shutdown failed");
        }
    }
}
