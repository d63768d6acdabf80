//! Document storage for module durability and message archival.
//!
//! The coordinator persists its module registry and the archive module
//! persists every message through the same narrow [`DocumentStore`]
//! interface: named collections of JSON documents keyed by their
//! `"id"`/`"uuid"` field. Two backends are provided -- an in-memory store
//! (tests, ephemeral deployments) and an embedded redb database behind
//! the default-on `redb` feature.

pub mod factory;
pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;

use async_trait::async_trait;
use serde_json::Value;

pub use factory::open_store;
pub use memory::MemoryDocumentStore;
#[cfg(feature = "redb")]
pub use redb::RedbDocumentStore;

/// Pluggable document persistence backend.
///
/// All methods return `anyhow::Result`; callers wrap failures into
/// [`crate::error::OrchestratorError::Storage`] at the boundary.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a document in `collection`, returning its id.
    ///
    /// The id is read from the document's `"id"` (then `"uuid"`) field; a
    /// document carrying neither gets a fresh uuid injected as `"id"`.
    async fn store(&self, collection: &str, document: Value) -> anyhow::Result<String>;

    /// Fetch a single document by id.
    async fn get(&self, collection: &str, id: &str) -> anyhow::Result<Option<Value>>;

    /// All documents whose fields equal every field of `query`
    /// (conjunctive equality match; an empty query matches everything).
    async fn find(&self, collection: &str, query: &Value) -> anyhow::Result<Vec<Value>>;

    /// Remove a document by id. Absent documents are not an error.
    async fn remove(&self, collection: &str, id: &str) -> anyhow::Result<()>;

    /// Every document in the collection.
    async fn all(&self, collection: &str) -> anyhow::Result<Vec<Value>>;

    /// One-time load hook called before first use.
    async fn load(&self) -> anyhow::Result<()>;

    /// Flush hook; durable backends may no-op when every write commits.
    async fn save(&self) -> anyhow::Result<()>;

    /// Release resources.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Reads a document's identity: `"id"` first, then `"uuid"`.
#[must_use]
pub fn document_id(document: &Value) -> Option<String> {
    let obj = document.as_object()?;
    obj.get("id")
        .or_else(|| obj.get("uuid"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Conjunctive field-equality match used by [`DocumentStore::find`].
pub(crate) fn matches_query(document: &Value, query: &Value) -> bool {
    let Some(conditions) = query.as_object() else {
        return false;
    };
    let Some(fields) = document.as_object() else {
        return conditions.is_empty();
    };
    conditions
        .iter()
        .all(|(key, expected)| fields.get(key) == Some(expected))
}

/// Resolves a document's id, minting and injecting one when absent.
pub(crate) fn ensure_document_id(document: &mut Value) -> String {
    if let Some(id) = document_id(document) {
        return id;
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Some(obj) = document.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.clone()));
    }
    id
}
