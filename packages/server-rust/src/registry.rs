//! Module registry: lifecycle, uniqueness, queue assignment, and matching.
//!
//! The registry is the coordinator's single source of truth for which
//! worker modules exist. It enforces id uniqueness (replace-on-duplicate),
//! the at-most-one-persistence-module invariant, stable per-service-class
//! work-queue names, and a strictly increasing registration order that
//! doubles as dispatch priority. Every payload entering the registry is
//! normalized into the canonical [`RegisteredModule`] shape exactly once,
//! here, and written through to the document store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use datafeed_core::{ModuleKind, PathExpr, RegisterRequest, RegisteredModule, RouteMeta};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::storage::DocumentStore;

/// A match predicate compiled at registration time.
///
/// An expression that fails to compile is kept as `Invalid` rather than
/// rejecting the registration: only a missing service class is fatal. An
/// invalid positive predicate never selects; an invalid negative predicate
/// never excludes.
enum CompiledMatch {
    Absent,
    Valid(PathExpr),
    Invalid,
}

impl CompiledMatch {
    fn compile(expr: Option<&str>, which: &str, module_id: &str) -> Self {
        match expr {
            None => Self::Absent,
            Some(raw) => match PathExpr::parse(raw) {
                Ok(compiled) => Self::Valid(compiled),
                Err(err) => {
                    warn!(
                        module_id,
                        expression = raw,
                        which,
                        error = %err,
                        "match expression does not compile; treating as never-matching"
                    );
                    Self::Invalid
                }
            },
        }
    }
}

/// A registered module paired with its compiled predicates.
struct ModuleEntry {
    module: RegisteredModule,
    positive: CompiledMatch,
    negative: CompiledMatch,
}

impl ModuleEntry {
    /// Match rule: (positive absent or selects) AND (negative absent or
    /// does not select).
    fn matches(&self, message: &Value) -> bool {
        let positive_ok = match &self.positive {
            CompiledMatch::Absent => true,
            CompiledMatch::Valid(expr) => expr.matches(message),
            CompiledMatch::Invalid => false,
        };
        let negative_ok = match &self.negative {
            CompiledMatch::Absent => true,
            CompiledMatch::Valid(expr) => !expr.matches(message),
            CompiledMatch::Invalid => true,
        };
        positive_ok && negative_ok
    }
}

/// Registry of worker modules, keyed by module id.
pub struct ModuleRegistry {
    modules: DashMap<String, ModuleEntry>,
    order: AtomicU64,
    store: Arc<dyn DocumentStore>,
    collection: String,
    persistence: watch::Sender<bool>,
}

impl ModuleRegistry {
    /// Creates an empty registry persisting into `collection` of `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        let (persistence, _) = watch::channel(false);
        Self {
            modules: DashMap::new(),
            order: AtomicU64::new(0),
            store,
            collection: collection.into(),
            persistence,
        }
    }

    /// Registers (or re-registers) a module and returns the fully resolved
    /// descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] when `serviceClass` is
    /// missing and [`OrchestratorError::Storage`] when the write-through
    /// fails.
    pub async fn register(
        &self,
        request: RegisterRequest,
    ) -> Result<RegisteredModule, OrchestratorError> {
        let service_class = request.service_class.trim().to_string();
        if service_class.is_empty() {
            return Err(OrchestratorError::validation("a service class is required"));
        }

        let id = request
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let kind = request.kind.unwrap_or_default();

        if kind == ModuleKind::Persistence {
            self.evict_other_persistence_modules(&id).await?;
        }

        // Replace-in-place: the previous entry under this id is removed but
        // remembered so its queue assignment can be preserved.
        let previous = self.modules.remove(&id).map(|(_, entry)| entry.module);
        if let Some(previous) = &previous {
            info!(
                module_id = %id,
                display_name = %previous.display_name,
                "re-registering module; replacing previous entry"
            );
        }

        let registration_order = self.order.fetch_add(1, Ordering::Relaxed);
        let work_queue_name = self
            .live_queue_for(&service_class)
            .or_else(|| {
                previous
                    .as_ref()
                    .filter(|p| p.service_class == service_class)
                    .map(|p| p.work_queue_name.clone())
            })
            .unwrap_or_else(|| mint_queue_name(&service_class, registration_order));

        let display_name = request
            .display_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default_display_name(&service_class, &id));

        let module = RegisteredModule {
            service_class,
            id: id.clone(),
            display_name,
            positive_match: request.positive_match,
            negative_match: request.negative_match,
            kind,
            resend: request.resend.unwrap_or(true),
            prefetch_count: request.prefetch_count.unwrap_or(1).max(1),
            registration_order,
            work_queue_name,
        };

        let entry = ModuleEntry {
            positive: CompiledMatch::compile(module.positive_match.as_deref(), "positive", &id),
            negative: CompiledMatch::compile(module.negative_match.as_deref(), "negative", &id),
            module: module.clone(),
        };
        self.modules.insert(id, entry);

        let stored = serde_json::to_value(&module).map_err(OrchestratorError::Parse)?;
        self.store
            .store(&self.collection, stored)
            .await
            .map_err(OrchestratorError::Storage)?;

        self.refresh_persistence_watch();
        info!(
            module_id = %module.id,
            service_class = %module.service_class,
            kind = kind.as_str(),
            order = module.registration_order,
            queue = %module.work_queue_name,
            "module registered"
        );
        Ok(module)
    }

    /// Removes a module by id. Unknown ids are a no-op, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Storage`] when removing the stored
    /// copy fails.
    pub async fn unregister(&self, id: &str) -> Result<(), OrchestratorError> {
        let Some((_, entry)) = self.modules.remove(id) else {
            debug!(module_id = id, "unregister of unknown module ignored");
            return Ok(());
        };
        self.store
            .remove(&self.collection, id)
            .await
            .map_err(OrchestratorError::Storage)?;
        self.refresh_persistence_watch();
        info!(
            module_id = id,
            display_name = %entry.module.display_name,
            "module unregistered"
        );
        Ok(())
    }

    /// Whether a module with this id is currently registered.
    #[must_use]
    pub fn is_registered(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    /// All non-persistence modules matching `message`, minus same-service
    /// bounce-backs the sender forbids, ordered by ascending registration
    /// order (earliest registration wins dispatch).
    #[must_use]
    pub fn find_matching(
        &self,
        message: &Value,
        sender: Option<&RouteMeta>,
    ) -> Vec<RegisteredModule> {
        let mut matched: Vec<RegisteredModule> = self
            .modules
            .iter()
            .filter_map(|entry| {
                let module = &entry.value().module;
                if module.kind == ModuleKind::Persistence {
                    return None;
                }
                if let Some(sender) = sender {
                    if sender.service_class == module.service_class && !module.resend {
                        return None;
                    }
                }
                entry.value().matches(message).then(|| module.clone())
            })
            .collect();
        matched.sort_by_key(|module| module.registration_order);
        matched
    }

    /// Whether a persistence module is currently registered.
    #[must_use]
    pub fn has_persistence_module(&self) -> bool {
        self.persistence_module().is_some()
    }

    /// The current persistence module, if any.
    #[must_use]
    pub fn persistence_module(&self) -> Option<RegisteredModule> {
        self.modules
            .iter()
            .find(|entry| entry.value().module.kind == ModuleKind::Persistence)
            .map(|entry| entry.value().module.clone())
    }

    /// Watch channel that flips whenever persistence-module availability
    /// changes; the coordinator's startup gate selects on it.
    #[must_use]
    pub fn persistence_watch(&self) -> watch::Receiver<bool> {
        self.persistence.subscribe()
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Snapshot of all modules, ordered by registration order.
    #[must_use]
    pub fn modules(&self) -> Vec<RegisteredModule> {
        let mut all: Vec<RegisteredModule> = self
            .modules
            .iter()
            .map(|entry| entry.value().module.clone())
            .collect();
        all.sort_by_key(|module| module.registration_order);
        all
    }

    /// Replays every stored module through [`ModuleRegistry::register`],
    /// preserving their relative order. Undecodable documents are skipped
    /// with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Storage`] when the backing store
    /// cannot be read.
    pub async fn load(&self) -> Result<usize, OrchestratorError> {
        let stored = self
            .store
            .all(&self.collection)
            .await
            .map_err(OrchestratorError::Storage)?;

        let mut modules: Vec<RegisteredModule> = stored
            .into_iter()
            .filter_map(|doc| match serde_json::from_value(doc) {
                Ok(module) => Some(module),
                Err(err) => {
                    warn!(error = %err, "skipping undecodable stored module");
                    None
                }
            })
            .collect();
        modules.sort_by_key(|module| module.registration_order);

        let count = modules.len();
        for module in modules {
            self.register(replay_request(module)).await?;
        }
        Ok(count)
    }

    /// Flushes the backing store.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Storage`] when the flush fails.
    pub async fn save(&self) -> Result<(), OrchestratorError> {
        self.store.save().await.map_err(OrchestratorError::Storage)
    }

    /// Removes any persistence module whose id differs from `keep_id`,
    /// upholding the single-persistence invariant.
    async fn evict_other_persistence_modules(
        &self,
        keep_id: &str,
    ) -> Result<(), OrchestratorError> {
        let stale: Vec<String> = self
            .modules
            .iter()
            .filter(|entry| {
                entry.value().module.kind == ModuleKind::Persistence && entry.key() != keep_id
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            info!(
                module_id = %id,
                "replacing previous persistence module with the new registration"
            );
            self.unregister(&id).await?;
        }
        Ok(())
    }

    fn live_queue_for(&self, service_class: &str) -> Option<String> {
        self.modules
            .iter()
            .find(|entry| entry.value().module.service_class == service_class)
            .map(|entry| entry.value().module.work_queue_name.clone())
    }

    #[allow(clippy::cast_precision_loss)]
    fn refresh_persistence_watch(&self) {
        metrics::gauge!("datafeed_registered_modules").set(self.modules.len() as f64);
        let _ = self.persistence.send_replace(self.has_persistence_module());
    }
}

/// Mints a work-queue name for the first module of a service class. The
/// random suffix only guards against collisions across coordinator
/// restarts; nothing parses the name.
fn mint_queue_name(service_class: &str, order: u64) -> String {
    format!("q-{service_class}-{order}-{:08x}", rand::random::<u32>())
}

fn default_display_name(service_class: &str, id: &str) -> String {
    let prefix: String = id.chars().take(8).collect();
    format!("{service_class}-{prefix}")
}

/// Rebuilds the registration request for a stored module during startup
/// replay.
fn replay_request(module: RegisteredModule) -> RegisterRequest {
    RegisterRequest {
        service_class: module.service_class,
        id: Some(module.id),
        display_name: Some(module.display_name),
        positive_match: module.positive_match,
        negative_match: module.negative_match,
        kind: Some(module.kind),
        resend: Some(module.resend),
        prefetch_count: Some(module.prefetch_count),
    }
}
