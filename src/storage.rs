//! Generic keyed storage for gateway records
//!
//! Connections and subscriptions are persisted through [`Storage`], a small
//! async CRUD+scan interface over records identified by a string id. The
//! in-memory [`MemoryTable`] is the default backing store; hosted table
//! services can implement the same trait.
//!
//! `scan` materializes the whole table; [`Storage::scan_batches`] streams
//! batches so callers iterating a large table never need to hold all of it
//! in memory. A consumer stops a batch scan early by dropping the stream.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Default number of records per batch yielded by [`MemoryTable::scan_batches`].
const DEFAULT_BATCH_SIZE: usize = 64;

/// A record that can be persisted in a [`Storage`] table.
pub trait TableRecord:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Stable identifier of the record within its table.
    fn id(&self) -> &str;
}

/// Async CRUD+scan interface over keyed records.
///
/// Implementations must provide per-id atomicity for insert/delete: a
/// concurrent insert and delete of the same id resolves last-write-wins
/// with no partial record observable.
#[async_trait]
pub trait Storage<T: TableRecord>: Send + Sync {
    /// Get a single record by id.
    async fn get(&self, id: &str) -> Result<Option<T>>;

    /// Add a record, replacing any record with the same id.
    async fn insert(&self, record: T) -> Result<()>;

    /// Merge the fields of `patch` (a JSON object) into the record with the
    /// given id, upserting if absent. An upsert whose merged fields do not
    /// form a complete record is a storage error.
    async fn update(&self, id: &str, patch: Value) -> Result<()>;

    /// Delete a record by id. Deleting an absent id is a no-op.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Materialize every record in the table.
    async fn scan(&self) -> Result<Vec<T>>;

    /// Stream the table in batches. Dropping the stream stops the scan.
    fn scan_batches(&self) -> BoxStream<'_, Result<Vec<T>>>;
}

/// In-memory [`Storage`] implementation backed by a `BTreeMap`.
pub struct MemoryTable<T> {
    records: RwLock<BTreeMap<String, T>>,
    batch_size: usize,
}

impl<T: TableRecord> MemoryTable<T> {
    pub fn new() -> Self {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            batch_size: batch_size.max(1),
        }
    }

    /// Number of records currently stored.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl<T: TableRecord> Default for MemoryTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: TableRecord> Storage<T> for MemoryTable<T> {
    async fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn insert(&self, record: T) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.id().to_string(), record);
        Ok(())
    }

    async fn update(&self, id: &str, patch: Value) -> Result<()> {
        let fields = match patch {
            Value::Object(fields) => fields,
            other => {
                return Err(Error::Storage(format!(
                    "update patch must be a JSON object, got {other}"
                )))
            }
        };
        let mut records = self.records.write().await;
        let mut merged = match records.get(id) {
            Some(existing) => serde_json::to_value(existing)?,
            None => serde_json::json!({ "id": id }),
        };
        let target = merged
            .as_object_mut()
            .expect("serialized record is always a JSON object");
        for (key, value) in fields {
            target.insert(key, value);
        }
        let updated: T = serde_json::from_value(merged).map_err(|e| {
            Error::Storage(format!("update of {id} does not form a valid record: {e}"))
        })?;
        records.insert(id.to_string(), updated);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<T>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    fn scan_batches(&self) -> BoxStream<'_, Result<Vec<T>>> {
        let batch_size = self.batch_size;
        futures::stream::once(async move {
            let snapshot: Vec<T> = self.records.read().await.values().cloned().collect();
            let batches: Vec<Result<Vec<T>>> = snapshot
                .chunks(batch_size)
                .map(|chunk| Ok(chunk.to_vec()))
                .collect();
            futures::stream::iter(batches)
        })
        .flatten()
        .boxed()
    }
}

/// Return every record in `storage` that matches `predicate`.
///
/// Runs over the batch scan so a large table is never materialized at once.
pub async fn filter_records<T, F>(storage: &dyn Storage<T>, predicate: F) -> Result<Vec<T>>
where
    T: TableRecord,
    F: Fn(&T) -> bool,
{
    let mut matches = Vec::new();
    let mut batches = storage.scan_batches();
    while let Some(batch) = batches.next().await {
        matches.extend(batch?.into_iter().filter(|record| predicate(record)));
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: String,
        label: String,
        count: u32,
    }

    impl TableRecord for Widget {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn widget(id: &str, label: &str, count: u32) -> Widget {
        Widget {
            id: id.to_string(),
            label: label.to_string(),
            count,
        }
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let table = MemoryTable::new();
        table.insert(widget("w1", "one", 1)).await.unwrap();

        let got = table.get("w1").await.unwrap();
        assert_eq!(got, Some(widget("w1", "one", 1)));

        table.delete("w1").await.unwrap();
        assert_eq!(table.get("w1").await.unwrap(), None);

        // deleting again is a no-op
        table.delete("w1").await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_replaces_same_id() {
        let table = MemoryTable::new();
        table.insert(widget("w1", "one", 1)).await.unwrap();
        table.insert(widget("w1", "uno", 2)).await.unwrap();

        assert_eq!(table.len().await, 1);
        assert_eq!(table.get("w1").await.unwrap().unwrap().label, "uno");
    }

    #[tokio::test]
    async fn test_update_merges_partial_fields() {
        let table = MemoryTable::new();
        table.insert(widget("w1", "one", 1)).await.unwrap();

        table
            .update("w1", serde_json::json!({ "count": 9 }))
            .await
            .unwrap();

        let got = table.get("w1").await.unwrap().unwrap();
        assert_eq!(got.label, "one");
        assert_eq!(got.count, 9);
    }

    #[tokio::test]
    async fn test_update_upserts_complete_patch() {
        let table: MemoryTable<Widget> = MemoryTable::new();
        table
            .update("w2", serde_json::json!({ "label": "two", "count": 2 }))
            .await
            .unwrap();

        assert_eq!(table.get("w2").await.unwrap(), Some(widget("w2", "two", 2)));
    }

    #[tokio::test]
    async fn test_update_incomplete_upsert_is_storage_error() {
        let table: MemoryTable<Widget> = MemoryTable::new();
        let err = table
            .update("w3", serde_json::json!({ "count": 3 }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_non_object_patch() {
        let table: MemoryTable<Widget> = MemoryTable::new();
        let err = table
            .update("w1", serde_json::json!("not an object"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_scan_materializes_all() {
        let table = MemoryTable::new();
        for i in 0..5 {
            table
                .insert(widget(&format!("w{i}"), "x", i))
                .await
                .unwrap();
        }
        assert_eq!(table.scan().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_scan_batches_respects_batch_size() {
        let table = MemoryTable::with_batch_size(2);
        for i in 0..5 {
            table
                .insert(widget(&format!("w{i}"), "x", i))
                .await
                .unwrap();
        }

        let mut sizes = Vec::new();
        let mut batches = table.scan_batches();
        while let Some(batch) = batches.next().await {
            sizes.push(batch.unwrap().len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_scan_batches_stops_when_dropped() {
        let table = MemoryTable::with_batch_size(1);
        for i in 0..10 {
            table
                .insert(widget(&format!("w{i}"), "x", i))
                .await
                .unwrap();
        }

        let mut batches = table.scan_batches();
        let first = batches.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        drop(batches);
    }

    #[tokio::test]
    async fn test_filter_records() {
        let table = MemoryTable::new();
        for i in 0..6 {
            table
                .insert(widget(&format!("w{i}"), "x", i))
                .await
                .unwrap();
        }

        let even = filter_records(&table, |w: &Widget| w.count % 2 == 0)
            .await
            .unwrap();
        assert_eq!(even.len(), 3);
    }
}
