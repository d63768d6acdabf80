//! The coordinator-internal routing stamp carried inside message envelopes.
//!
//! On the completion path a module client attaches a `__meta` field naming
//! the module that produced the message; the coordinator uses it for the
//! store-then-dispatch decision and for same-service resend suppression,
//! and it is stripped again before any module's business logic sees the
//! document. Downstream code must never observe `__meta`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::registration::{ModuleKind, RegisteredModule};

/// Envelope field reserved for coordinator-internal routing state.
pub const META_FIELD: &str = "__meta";

/// Identity of the module whose completion most recently produced a message.
///
/// `kind` tells the coordinator whether the message is already durably
/// stored (`persistence`) or still needs storing; `service_class`/`id`
/// identify the producer for resend suppression. A persistence module's
/// completion keeps the upstream producer's `service_class`/`id` while
/// setting `kind` to `persistence`, so both concerns survive the storage
/// hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMeta {
    /// Role of the completing module.
    pub kind: ModuleKind,
    /// Service class of the producing module.
    pub service_class: String,
    /// Identity of the producing module.
    pub id: String,
}

impl RouteMeta {
    /// Builds the stamp for a module completing with no upstream producer.
    #[must_use]
    pub fn for_module(module: &RegisteredModule) -> Self {
        Self {
            kind: module.kind,
            service_class: module.service_class.clone(),
            id: module.id.clone(),
        }
    }

    /// Whether the message this stamp rode in on is already durably stored.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.kind == ModuleKind::Persistence
    }
}

/// Attaches (or overwrites) the routing stamp on an envelope.
///
/// Non-object documents cannot carry a stamp; they are left untouched and
/// will be treated as fresh arrivals by the coordinator.
pub fn stamp(message: &mut Value, meta: &RouteMeta) {
    if let Some(obj) = message.as_object_mut() {
        // serde of RouteMeta cannot fail: all fields are strings/enums.
        let encoded = serde_json::to_value(meta).unwrap_or(Value::Null);
        obj.insert(META_FIELD.to_string(), encoded);
    } else {
        debug!("refusing to stamp non-object message");
    }
}

/// Removes and decodes the routing stamp from an envelope.
///
/// Returns `None` for non-object documents, absent stamps, and stamps that
/// do not decode (a foreign `__meta` field is dropped rather than leaked
/// to module business logic).
pub fn strip(message: &mut Value) -> Option<RouteMeta> {
    let removed = message.as_object_mut()?.remove(META_FIELD)?;
    match serde_json::from_value(removed) {
        Ok(meta) => Some(meta),
        Err(err) => {
            debug!(error = %err, "discarding undecodable routing stamp");
            None
        }
    }
}

/// Decodes the routing stamp without removing it.
#[must_use]
pub fn peek(message: &Value) -> Option<RouteMeta> {
    let raw = message.as_object()?.get(META_FIELD)?;
    serde_json::from_value(raw.clone()).ok()
}
