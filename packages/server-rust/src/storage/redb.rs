//! Embedded [`DocumentStore`] backed by a [`redb`] database.
//!
//! One redb table per collection name; documents are stored as JSON bytes
//! keyed by their id. Every write commits its own transaction, so the
//! save hook is a no-op and durability holds across restarts.

use std::path::Path;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde_json::Value;
use tracing::info;

use super::{ensure_document_id, matches_query, DocumentStore};

fn table(collection: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(collection)
}

/// Durable document collections in a single redb file.
pub struct RedbDocumentStore {
    db: Database,
}

impl RedbDocumentStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be created or is not a valid
    /// redb database.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = Database::create(path)?;
        info!(path = %path.display(), "redb document store opened");
        Ok(Self { db })
    }

    fn read_all(&self, collection: &str) -> anyhow::Result<Vec<Value>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(table(collection)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut documents = Vec::new();
        for entry in table.iter()? {
            let (_, bytes) = entry?;
            documents.push(serde_json::from_slice(bytes.value())?);
        }
        Ok(documents)
    }
}

#[async_trait]
impl DocumentStore for RedbDocumentStore {
    async fn store(&self, collection: &str, mut document: Value) -> anyhow::Result<String> {
        let id = ensure_document_id(&mut document);
        let bytes = serde_json::to_vec(&document)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table(collection))?;
            table.insert(id.as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> anyhow::Result<Option<Value>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(table(collection)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match table.get(id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn find(&self, collection: &str, query: &Value) -> anyhow::Result<Vec<Value>> {
        let documents = self.read_all(collection)?;
        Ok(documents
            .into_iter()
            .filter(|doc| matches_query(doc, query))
            .collect())
    }

    async fn remove(&self, collection: &str, id: &str) -> anyhow::Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table(collection))?;
            table.remove(id)?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn all(&self, collection: &str) -> anyhow::Result<Vec<Value>> {
        self.read_all(collection)
    }

    async fn load(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save(&self) -> anyhow::Result<()> {
        // Every write commits its own transaction; nothing to flush.
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn open_temp() -> (tempfile::TempDir, RedbDocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbDocumentStore::open(&dir.path().join("store.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn store_and_get_roundtrip() {
        let (_dir, store) = open_temp();
        let id = store
            .store("messages", json!({ "uuid": "abc", "address": "x" }))
            .await
            .unwrap();
        assert_eq!(id, "abc");

        let doc = store.get("messages", "abc").await.unwrap().unwrap();
        assert_eq!(doc["address"], json!("x"));
    }

    #[tokio::test]
    async fn get_from_missing_collection_is_none() {
        let (_dir, store) = open_temp();
        assert!(store.get("nothing", "x").await.unwrap().is_none());
        assert!(store.all("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_filters_by_equality() {
        let (_dir, store) = open_temp();
        store
            .store("messages", json!({ "id": "1", "kind": "a" }))
            .await
            .unwrap();
        store
            .store("messages", json!({ "id": "2", "kind": "b" }))
            .await
            .unwrap();

        let found = store.find("messages", &json!({ "kind": "b" })).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!("2"));
    }

    #[tokio::test]
    async fn remove_then_get_is_none() {
        let (_dir, store) = open_temp();
        store
            .store("messages", json!({ "id": "1" }))
            .await
            .unwrap();
        store.remove("messages", "1").await.unwrap();
        assert!(store.get("messages", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");

        {
            let store = RedbDocumentStore::open(&path).unwrap();
            store
                .store("modules", json!({ "id": "m-1", "serviceClass": "archive" }))
                .await
                .unwrap();
            store.close().await.unwrap();
        }

        let store = RedbDocumentStore::open(&path).unwrap();
        let doc = store.get("modules", "m-1").await.unwrap().unwrap();
        assert_eq!(doc["serviceClass"], json!("archive"));
    }
}
