//! Registration wire contract between module clients and the coordinator.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so the JSON wire
//! format matches the field names module authors see in the protocol
//! (`serviceClass`, `workQueueName`, ...). A [`RegisterRequest`] travels
//! client -> coordinator on the register queue; the coordinator answers
//! with a [`RegisterReply`].

use serde::{Deserialize, Serialize};

/// Role of a module in the pipeline.
///
/// Exactly one `persistence` module may be active at a time; it receives
/// every message before any `processor` sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// An ordinary worker selected by its match predicates.
    #[default]
    Processor,
    /// The single designated module that durably stores every message.
    Persistence,
}

impl ModuleKind {
    /// Lowercase wire/display form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processor => "processor",
            Self::Persistence => "persistence",
        }
    }
}

/// Body of a registration request.
///
/// Only `serviceClass` is required; everything else is defaulted by the
/// coordinator when absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Grouping key: all modules with the same service class share one
    /// work queue.
    pub service_class: String,

    /// Stable identity; assigned by the coordinator when absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,

    /// Human-readable label; derived when absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,

    /// JSONPath that must select at least one node for a message to match.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub positive_match: Option<String>,

    /// JSONPath that must select nothing for a message to match.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub negative_match: Option<String>,

    /// Module role; defaults to `processor`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<ModuleKind>,

    /// Whether a message most recently produced by this service class may
    /// be routed back to it. Defaults to `true`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resend: Option<bool>,

    /// Concurrency hint for the client's work-queue listener.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prefetch_count: Option<u16>,
}

impl RegisterRequest {
    /// Convenience constructor for the common "just a service class" case.
    #[must_use]
    pub fn for_service(service_class: impl Into<String>) -> Self {
        Self {
            service_class: service_class.into(),
            ..Self::default()
        }
    }
}

/// The canonical, fully resolved module descriptor.
///
/// This is both the registry's internal shape and the registration
/// response body: every optional request field has been defaulted and the
/// server-assigned fields (`id` when it was absent, `registrationOrder`,
/// `workQueueName`) are filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredModule {
    /// Grouping key; shared work queue per service class.
    pub service_class: String,

    /// Unique identity within the registry.
    pub id: String,

    /// Human-readable label.
    pub display_name: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub positive_match: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub negative_match: Option<String>,

    /// Module role.
    pub kind: ModuleKind,

    /// Same-service re-dispatch permission.
    pub resend: bool,

    /// Concurrency hint for the work-queue listener.
    pub prefetch_count: u16,

    /// Monotonic priority key; lower means registered earlier and wins
    /// dispatch ties.
    pub registration_order: u64,

    /// The queue this module (and its service-class peers) listens on.
    pub work_queue_name: String,
}

/// Coordinator answer on the register queue: the resolved module, or an
/// error the registering client must surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterReply {
    /// Registration accepted; descriptor is fully resolved.
    Registered(Box<RegisteredModule>),
    /// Registration rejected (e.g. missing `serviceClass`).
    Rejected {
        /// Human-readable rejection reason.
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn resolved() -> RegisteredModule {
        RegisteredModule {
            service_class: "geocoder".to_string(),
            id: "m-1".to_string(),
            display_name: "geocoder-m-1".to_string(),
            positive_match: Some("$.address".to_string()),
            negative_match: None,
            kind: ModuleKind::Processor,
            resend: true,
            prefetch_count: 1,
            registration_order: 3,
            work_queue_name: "q-geocoder-3-1f2e3d4c".to_string(),
        }
    }

    #[test]
    fn module_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ModuleKind::Processor).unwrap(),
            json!("processor")
        );
        assert_eq!(
            serde_json::to_value(ModuleKind::Persistence).unwrap(),
            json!("persistence")
        );
    }

    #[test]
    fn request_minimal_deserializes_with_defaults() {
        let req: RegisterRequest =
            serde_json::from_value(json!({ "serviceClass": "archive" })).unwrap();
        assert_eq!(req.service_class, "archive");
        assert_eq!(req.id, None);
        assert_eq!(req.kind, None);
        assert_eq!(req.resend, None);
        assert_eq!(req.prefetch_count, None);
    }

    #[test]
    fn request_field_names_are_camel_case() {
        let req = RegisterRequest {
            service_class: "geocoder".to_string(),
            positive_match: Some("$.address".to_string()),
            prefetch_count: Some(4),
            ..RegisterRequest::default()
        };
        let value = serde_json::to_value(&req).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("serviceClass"));
        assert!(obj.contains_key("positiveMatch"));
        assert!(obj.contains_key("prefetchCount"));
        // Absent optionals are omitted entirely, not serialized as null.
        assert!(!obj.contains_key("negativeMatch"));
        assert!(!obj.contains_key("id"));
    }

    #[test]
    fn registered_module_roundtrip() {
        let module = resolved();
        let value = serde_json::to_value(&module).unwrap();
        let back: RegisteredModule = serde_json::from_value(value).unwrap();
        assert_eq!(back, module);
    }

    #[test]
    fn registered_module_wire_has_assigned_fields() {
        let value = serde_json::to_value(resolved()).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("registrationOrder"));
        assert!(obj.contains_key("workQueueName"));
        assert_eq!(value["kind"], json!("processor"));
    }

    #[test]
    fn reply_decodes_registered_variant() {
        let value = serde_json::to_value(resolved()).unwrap();
        let reply: RegisterReply = serde_json::from_value(value).unwrap();
        assert!(matches!(reply, RegisterReply::Registered(_)));
    }

    #[test]
    fn reply_decodes_rejection_variant() {
        let reply: RegisterReply =
            serde_json::from_value(json!({ "error": "a service class is required" })).unwrap();
        match reply {
            RegisterReply::Rejected { error } => {
                assert_eq!(error, "a service class is required");
            }
            RegisterReply::Registered(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn for_service_sets_only_the_service_class() {
        let req = RegisterRequest::for_service("archive");
        assert_eq!(req.service_class, "archive");
        assert_eq!(req, RegisterRequest {
            service_class: "archive".to_string(),
            ..RegisterRequest::default()
        });
    }
}
