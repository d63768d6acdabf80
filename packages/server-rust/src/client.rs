//! Module-side client: registration, the work-queue consumer loop, and the
//! completion path back into the coordinator.
//!
//! The client owns exactly one connection to its assigned work queue and
//! surfaces deliveries through a bounded channel sized by the module's
//! prefetch count. Routing stamps are stripped before business logic sees
//! a document and re-attached only on the coordinator-bound completion
//! path, with the upstream producer identity preserved across the storage
//! hop.

use std::sync::Arc;

use datafeed_core::{stamp, strip, RegisterReply, RegisterRequest, RegisteredModule, RouteMeta};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{AckHandle, BrokerContext, PushSocket, WorkDelivery};
use crate::config::ClientConfig;
use crate::error::OrchestratorError;

/// One unit of work handed to module business logic.
#[derive(Debug)]
pub struct Delivery {
    message: Value,
    token: CompletionToken,
}

impl Delivery {
    /// The business document, routing stamp already removed.
    #[must_use]
    pub fn message(&self) -> &Value {
        &self.message
    }

    /// Splits into the document and the completion token.
    #[must_use]
    pub fn into_parts(self) -> (Value, CompletionToken) {
        (self.message, self.token)
    }
}

/// Pairs the delivery's acknowledgement with the upstream producer
/// identity remembered from the stripped routing stamp.
#[derive(Debug)]
pub struct CompletionToken {
    upstream: Option<RouteMeta>,
    ack: AckHandle,
}

/// A registered module connected to its work queue.
pub struct ModuleClient {
    descriptor: RegisteredModule,
    intake: Box<dyn PushSocket>,
    deliveries: Option<mpsc::Receiver<Delivery>>,
    listener: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for ModuleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleClient")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl ModuleClient {
    /// Registers with the coordinator and starts listening on the assigned
    /// work queue.
    ///
    /// # Errors
    ///
    /// `Validation` when the coordinator rejects the registration,
    /// `Parse` for an undecodable reply, and broker errors for transport
    /// failures.
    pub async fn register(
        ctx: Arc<dyn BrokerContext>,
        request: RegisterRequest,
        config: &ClientConfig,
    ) -> Result<Self, OrchestratorError> {
        let mut socket = ctx.request(&config.register_queue).await?;
        let payload = serde_json::to_vec(&request).map_err(OrchestratorError::Parse)?;
        let reply_bytes = socket.send(payload).await?;

        let reply: RegisterReply =
            serde_json::from_slice(&reply_bytes).map_err(OrchestratorError::Parse)?;
        let descriptor = match reply {
            RegisterReply::Registered(module) => *module,
            RegisterReply::Rejected { error } => {
                return Err(OrchestratorError::Validation { reason: error })
            }
        };
        info!(
            module_id = %descriptor.id,
            service_class = %descriptor.service_class,
            queue = %descriptor.work_queue_name,
            "module registered; listening for work"
        );

        let mut worker = ctx
            .worker_pull(&descriptor.work_queue_name, descriptor.prefetch_count)
            .await?;
        let (tx, rx) = mpsc::channel(usize::from(descriptor.prefetch_count.max(1)));
        let listener = tokio::spawn(async move {
            while let Some(delivery) = worker.next().await {
                let WorkDelivery { payload, ack } = delivery;
                let mut message: Value = match serde_json::from_slice(&payload) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(error = %err, "discarding unparseable delivery");
                        ack.ack();
                        continue;
                    }
                };
                let upstream = strip(&mut message);
                let handed = Delivery {
                    message,
                    token: CompletionToken { upstream, ack },
                };
                if tx.send(handed).await.is_err() {
                    break; // Consumer dropped the delivery stream.
                }
            }
            debug!("work-queue stream ended");
        });

        let intake = ctx.push(&config.messages_queue).await?;
        Ok(Self {
            descriptor,
            intake,
            deliveries: Some(rx),
            listener,
        })
    }

    /// The resolved descriptor the coordinator assigned.
    #[must_use]
    pub fn descriptor(&self) -> &RegisteredModule {
        &self.descriptor
    }

    /// Takes the delivery stream. Single consumer loop per client.
    ///
    /// # Panics
    ///
    /// Panics when called a second time.
    #[must_use]
    pub fn deliveries(&mut self) -> mpsc::Receiver<Delivery> {
        self.deliveries
            .take()
            .expect("deliveries() may only be taken once")
    }

    /// Hands a processed document back to the coordinator and acknowledges
    /// the delivery.
    ///
    /// The re-attached stamp carries this module's `kind` and, when the
    /// delivery arrived with a producer identity, that upstream
    /// `serviceClass`/`id` -- which is what keeps resend suppression
    /// working across the storage hop.
    ///
    /// # Errors
    ///
    /// Returns broker errors when the intake push fails; the delivery is
    /// not acknowledged in that case (redelivery is the transport's call).
    pub async fn complete(
        &self,
        mut message: Value,
        token: CompletionToken,
    ) -> Result<(), OrchestratorError> {
        let CompletionToken { upstream, ack } = token;
        let meta = match upstream {
            Some(upstream) => RouteMeta {
                kind: self.descriptor.kind,
                service_class: upstream.service_class,
                id: upstream.id,
            },
            None => RouteMeta::for_module(&self.descriptor),
        };
        stamp(&mut message, &meta);

        let bytes = serde_json::to_vec(&message).map_err(OrchestratorError::Parse)?;
        self.intake.send(bytes).await?;
        ack.ack();
        Ok(())
    }

    /// Stops the work-queue listener.
    pub fn close(&self) {
        self.listener.abort();
    }
}
