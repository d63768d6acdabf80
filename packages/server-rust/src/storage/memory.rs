//! In-memory [`DocumentStore`] backed by [`DashMap`] collections.
//!
//! Nothing survives the process; the load/save/close hooks are no-ops.
//! This is the default backend for tests and for deployments that opt out
//! of durability.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{ensure_document_id, matches_query, DocumentStore};

/// Concurrent in-memory document collections.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: DashMap<String, DashMap<String, Value>>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_collection<T>(&self, name: &str, f: impl FnOnce(&DashMap<String, Value>) -> T) -> T {
        let collection = self
            .collections
            .entry(name.to_string())
            .or_insert_with(DashMap::new);
        f(collection.value())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn store(&self, collection: &str, mut document: Value) -> anyhow::Result<String> {
        let id = ensure_document_id(&mut document);
        self.with_collection(collection, |c| {
            c.insert(id.clone(), document);
        });
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.with_collection(collection, |c| c.get(id).map(|entry| entry.value().clone())))
    }

    async fn find(&self, collection: &str, query: &Value) -> anyhow::Result<Vec<Value>> {
        Ok(self.with_collection(collection, |c| {
            c.iter()
                .filter(|entry| matches_query(entry.value(), query))
                .map(|entry| entry.value().clone())
                .collect()
        }))
    }

    async fn remove(&self, collection: &str, id: &str) -> anyhow::Result<()> {
        self.with_collection(collection, |c| {
            c.remove(id);
        });
        Ok(())
    }

    async fn all(&self, collection: &str) -> anyhow::Result<Vec<Value>> {
        Ok(self.with_collection(collection, |c| {
            c.iter().map(|entry| entry.value().clone()).collect()
        }))
    }

    async fn load(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
