//! Backend selection for the document store.

use std::sync::Arc;

use crate::config::StorageConfig;

use super::{DocumentStore, MemoryDocumentStore};

/// Opens the document store described by `config`.
///
/// A configured `db_path` selects the embedded redb backend; without one
/// (or when built without the `redb` feature) everything stays in memory.
///
/// # Errors
///
/// Returns an error when the embedded database cannot be opened.
pub fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    if let Some(path) = &config.db_path {
        #[cfg(feature = "redb")]
        {
            return Ok(Arc::new(super::RedbDocumentStore::open(path)?));
        }
        #[cfg(not(feature = "redb"))]
        tracing::warn!(
            path = %path.display(),
            "built without the redb feature; falling back to in-memory storage"
        );
    }
    Ok(Arc::new(MemoryDocumentStore::new()))
}
