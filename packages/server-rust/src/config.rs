//! Configuration types for the datafeed server.

use std::path::PathBuf;
use std::time::Duration;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Display name used in logs and the status endpoint.
    pub name: String,
    /// Broker URL handed to [`crate::broker::Broker::connect`].
    pub broker_url: String,
    /// Queue the registration endpoint replies on.
    pub register_queue: String,
    /// Queue the message-intake endpoint consumes from.
    pub messages_queue: String,
    /// Document-store collection holding registered modules.
    pub modules_collection: String,
    /// How many intake deliveries may be unacknowledged at once.
    pub intake_prefetch: u16,
    /// Capacity of the intake worker's task channel.
    pub intake_queue_depth: usize,
    /// Fixed interval at which the persistence-module gate re-checks the
    /// registry.
    pub persistence_poll_interval: Duration,
    /// Upper bound on the persistence-module wait. `None` (the default)
    /// blocks startup indefinitely -- a deployment with no persistence
    /// module is an operational problem, not one the coordinator can fix.
    pub persistence_max_wait: Option<Duration>,
    /// Interval between registry autosaves while running.
    pub autosave_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: "orchestrator".to_string(),
            broker_url: "mem://local".to_string(),
            register_queue: "o_register".to_string(),
            messages_queue: "o_messages".to_string(),
            modules_collection: "modules".to_string(),
            intake_prefetch: 16,
            intake_queue_depth: 256,
            persistence_poll_interval: Duration::from_millis(500),
            persistence_max_wait: None,
            autosave_interval: Duration::from_secs(30),
        }
    }
}

/// Module-client configuration: where to register and where to hand
/// completed work back.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Queue registration requests are sent to.
    pub register_queue: String,
    /// Queue completed messages are pushed back to (coordinator intake).
    pub messages_queue: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            register_queue: "o_register".to_string(),
            messages_queue: "o_messages".to_string(),
        }
    }
}

/// Document-store configuration.
///
/// With a `db_path` (and the `redb` feature, on by default) the store is
/// an embedded redb database; without one everything stays in memory.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Path of the embedded database file, if durability is wanted.
    pub db_path: Option<PathBuf>,
    /// Collection messages are archived into.
    pub messages_collection: String,
}

impl StorageConfig {
    /// In-memory storage with the default messages collection.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            db_path: None,
            messages_collection: "messages".to_string(),
        }
    }
}

/// HTTP status endpoint configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Bind address for the status server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
        }
    }
}
