//! In-process record store.
//!
//! Holds records in memory under TID record keys, so listing order is
//! creation order. Used for tests and for running the cache without a PDS.
//! Supports one-shot fault injection per operation and a fixed per-call
//! latency to exercise interleavings.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

use crate::{RecordRef, RecordStore, StoreError, StoredRecord, Tid};

/// Store operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    Create,
    Replace,
    Delete,
}

/// Kind of failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Behave as if the store could not be reached.
    Unavailable,
    /// Refuse the request.
    Rejected,
}

impl Fault {
    fn into_error(self, op: StoreOp) -> StoreError {
        match self {
            Fault::Unavailable => StoreError::Unavailable(format!("injected fault on {op:?}")),
            Fault::Rejected => StoreError::Xrpc {
                error: "InvalidRequest".to_string(),
                message: format!("injected fault on {op:?}"),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryRecord {
    cid: String,
    value: Value,
}

/// In-memory [`RecordStore`].
pub struct MemoryStore {
    repo: String,
    records: DashMap<RecordRef, MemoryRecord>,
    faults: DashMap<StoreOp, Fault>,
    latency: Option<Duration>,
}

impl MemoryStore {
    /// Create an empty store for the given repository DID.
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            records: DashMap::new(),
            faults: DashMap::new(),
            latency: None,
        }
    }

    /// Delay every operation by `latency` before it takes effect.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next call of `op` with `fault`.
    pub fn fail_next(&self, op: StoreOp, fault: Fault) {
        self.faults.insert(op, fault);
    }

    /// Number of records across all collections.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Read a record directly, bypassing faults and latency.
    pub fn get(&self, handle: &RecordRef) -> Option<Value> {
        self.records.get(handle).map(|r| r.value().value.clone())
    }

    /// Insert a record directly, bypassing faults and latency.
    pub fn insert(&self, collection: &str, value: Value) -> RecordRef {
        let handle = RecordRef::new(&self.repo, collection, Tid::now().to_string());
        self.records.insert(
            handle.clone(),
            MemoryRecord {
                cid: Tid::now().to_string(),
                value,
            },
        );
        handle
    }

    async fn enter(&self, op: StoreOp) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self.faults.remove(&op) {
            Some((_, fault)) => {
                trace!(?op, ?fault, "memory store: injected fault");
                Err(fault.into_error(op))
            }
            None => Ok(()),
        }
    }

    fn not_found(handle: &RecordRef) -> StoreError {
        StoreError::NotFound {
            collection: handle.collection().to_string(),
            rkey: handle.rkey().to_string(),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>, StoreError> {
        self.enter(StoreOp::List).await?;

        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.key().collection() == collection)
            .map(|r| StoredRecord {
                handle: r.key().clone(),
                cid: Some(r.value().cid.clone()),
                value: r.value().value.clone(),
            })
            .collect();
        // TIDs are time-ordered
        records.sort_by(|a, b| a.handle.rkey().cmp(b.handle.rkey()));

        trace!(collection, count = records.len(), "memory store: listed");
        Ok(records)
    }

    async fn create(&self, collection: &str, record: &Value) -> Result<StoredRecord, StoreError> {
        self.enter(StoreOp::Create).await?;

        let handle = self.insert(collection, record.clone());
        let cid = self.records.get(&handle).map(|r| r.value().cid.clone());
        trace!(handle = %handle, "memory store: created");

        Ok(StoredRecord {
            handle,
            cid,
            value: record.clone(),
        })
    }

    async fn replace(
        &self,
        handle: &RecordRef,
        record: &Value,
    ) -> Result<StoredRecord, StoreError> {
        self.enter(StoreOp::Replace).await?;

        let mut entry = self
            .records
            .get_mut(handle)
            .ok_or_else(|| Self::not_found(handle))?;
        let cid = Tid::now().to_string();
        *entry = MemoryRecord {
            cid: cid.clone(),
            value: record.clone(),
        };
        trace!(handle = %handle, "memory store: replaced");

        Ok(StoredRecord {
            handle: handle.clone(),
            cid: Some(cid),
            value: record.clone(),
        })
    }

    async fn delete(&self, handle: &RecordRef) -> Result<(), StoreError> {
        self.enter(StoreOp::Delete).await?;

        self.records
            .remove(handle)
            .map(|_| trace!(handle = %handle, "memory store: deleted"))
            .ok_or_else(|| Self::not_found(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COLLECTION: &str = "app.ideaboard.idea";

    #[tokio::test]
    async fn test_list_in_creation_order() {
        let store = MemoryStore::new("did:plc:test");
        for n in 0..5 {
            store.create(COLLECTION, &json!({ "n": n })).await.unwrap();
        }
        store.create("other.collection", &json!({})).await.unwrap();

        let records = store.list(COLLECTION).await.unwrap();
        let order: Vec<_> = records.iter().map(|r| r.value["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn test_replace_and_delete_missing() {
        let store = MemoryStore::new("did:plc:test");
        let ghost = RecordRef::new("did:plc:test", COLLECTION, "nope");

        let err = store.replace(&ghost, &json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let err = store.delete(&ghost).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_replace_changes_cid() {
        let store = MemoryStore::new("did:plc:test");
        let created = store.create(COLLECTION, &json!({ "v": 1 })).await.unwrap();
        let replaced = store.replace(&created.handle, &json!({ "v": 2 })).await.unwrap();

        assert_ne!(created.cid, replaced.cid);
        assert_eq!(store.get(&created.handle), Some(json!({ "v": 2 })));
    }

    #[tokio::test]
    async fn test_fault_fires_once() {
        let store = MemoryStore::new("did:plc:test");
        store.fail_next(StoreOp::List, Fault::Unavailable);

        let err = store.list(COLLECTION).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.list(COLLECTION).await.is_ok());

        store.fail_next(StoreOp::Create, Fault::Rejected);
        let err = store.create(COLLECTION, &json!({})).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(store.is_empty());
    }
}
