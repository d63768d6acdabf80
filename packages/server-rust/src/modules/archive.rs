//! The archive module: the pipeline's designated persistence worker.
//!
//! Registers itself with `kind = persistence`, stores every delivered
//! message in the document store, and completes -- which re-submits the
//! message, persistence-stamped, into the coordinator's intake path for
//! dispatch to processors. A storage failure is logged and the message
//! still completes.

use std::sync::Arc;

use datafeed_core::{ModuleKind, RegisterRequest, RegisteredModule};
use tracing::{debug, info, warn};

use crate::broker::BrokerContext;
use crate::client::ModuleClient;
use crate::config::ClientConfig;
use crate::error::OrchestratorError;
use crate::storage::DocumentStore;

/// Archive module settings.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Service class the module registers under.
    pub service_class: String,
    /// Collection messages are archived into.
    pub messages_collection: String,
    /// Work-queue prefetch window.
    pub prefetch_count: u16,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            service_class: "archive".to_string(),
            messages_collection: "messages".to_string(),
            prefetch_count: 1,
        }
    }
}

/// A running archive module.
pub struct ArchiveModule {
    descriptor: RegisteredModule,
    handle: tokio::task::JoinHandle<()>,
}

impl ArchiveModule {
    /// Registers the module and starts its archival loop.
    ///
    /// # Errors
    ///
    /// Propagates registration and broker failures from
    /// [`ModuleClient::register`].
    pub async fn spawn(
        ctx: Arc<dyn BrokerContext>,
        store: Arc<dyn DocumentStore>,
        client_config: &ClientConfig,
        config: ArchiveConfig,
    ) -> Result<Self, OrchestratorError> {
        let request = RegisterRequest {
            kind: Some(ModuleKind::Persistence),
            prefetch_count: Some(config.prefetch_count),
            ..RegisterRequest::for_service(config.service_class.clone())
        };
        let mut client = ModuleClient::register(ctx, request, client_config).await?;
        let descriptor = client.descriptor().clone();
        info!(
            module_id = %descriptor.id,
            queue = %descriptor.work_queue_name,
            collection = %config.messages_collection,
            "archive module started"
        );

        let mut deliveries = client.deliveries();
        let collection = config.messages_collection;
        let handle = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let (message, token) = delivery.into_parts();
                match store.store(&collection, message.clone()).await {
                    Ok(id) => debug!(%id, "message archived"),
                    Err(err) => warn!(error = %err, "failed to archive message"),
                }
                if let Err(err) = client.complete(message, token).await {
                    warn!(error = %err, "failed to hand archived message back");
                }
            }
            debug!("archive delivery stream ended");
        });

        Ok(Self { descriptor, handle })
    }

    /// The descriptor the coordinator assigned.
    #[must_use]
    pub fn descriptor(&self) -> &RegisteredModule {
        &self.descriptor
    }

    /// Stops the archival loop.
    pub fn stop(&self) {
        self.handle.abort();
    }
}
