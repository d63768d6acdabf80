//! Dispatch decision: which module, if any, receives a message.
//!
//! Deliberately at-most-one-handler: of all matching candidates the one
//! with the lowest registration order wins, and a message no module wants
//! simply terminates the pipeline (logged, never retried).

use std::sync::Arc;

use datafeed_core::{RegisteredModule, RouteMeta};
use serde_json::Value;
use tracing::debug;

use crate::registry::ModuleRegistry;

/// Computes dispatch decisions against a [`ModuleRegistry`].
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<ModuleRegistry>,
}

impl MessageRouter {
    /// Creates a router over `registry`.
    #[must_use]
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    /// Selects the dispatch target for `message`, given optional metadata
    /// about its most recent sender.
    ///
    /// Returns `None` when no module matches; the caller drops the message
    /// (end of pipeline).
    #[must_use]
    pub fn route(&self, message: &Value, sender: Option<&RouteMeta>) -> Option<RegisteredModule> {
        let candidates = self.registry.find_matching(message, sender);
        match candidates.into_iter().next() {
            Some(target) => {
                metrics::counter!("datafeed_messages_routed_total").increment(1);
                debug!(
                    module_id = %target.id,
                    service_class = %target.service_class,
                    queue = %target.work_queue_name,
                    "message routed"
                );
                Some(target)
            }
            None => {
                metrics::counter!("datafeed_messages_unrouted_total").increment(1);
                debug!("no matching module; pipeline complete for this message");
                None
            }
        }
    }
}
