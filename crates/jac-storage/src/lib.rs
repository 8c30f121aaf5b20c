//! Persistence for consolidated records + hash-addressed archive of raw source snapshots.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use jac_core::{ConsolidatedRecord, MatchingKey};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

mod archive;
mod file_store;
mod postgres;

pub use archive::{ArchivedSnapshot, SnapshotArchive};
pub use file_store::JsonFileStore;
pub use postgres::PgConsolidatedStore;

pub const CRATE_NAME: &str = "jac-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding consolidated record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("timed out waiting for lock {0}")]
    Busy(PathBuf),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result of a write conditioned on the revision the caller read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Written { id: Uuid, revision: u64 },
    /// The stored copy moved on since the caller read it; nothing was written.
    Stale,
}

/// Id and revision for a conditional write over `stored`, or `None` when stale.
/// Revision 0 means the caller saw no stored copy.
pub(crate) fn next_write(
    stored: Option<(Uuid, u64)>,
    record: &ConsolidatedRecord,
) -> Option<(Uuid, u64)> {
    match stored {
        Some((id, revision)) if revision == record.revision => Some((id, revision + 1)),
        None if record.revision == 0 => Some((record.id, 1)),
        _ => None,
    }
}

/// Keyed storage the consolidator writes into. One record per matching key.
#[async_trait]
pub trait ConsolidatedStore: Send + Sync {
    /// Insert or replace the record stored under `record.matching_key`,
    /// whatever revision is stored. Returns the id the record is stored under.
    async fn upsert_consolidated(&self, record: &ConsolidatedRecord) -> Result<Uuid, StoreError>;

    /// Compare-and-swap on `record.revision`: writes only if the stored copy
    /// still carries that revision, bumping it by one.
    async fn upsert_if_current(
        &self,
        record: &ConsolidatedRecord,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get_by_key(&self, key: &MatchingKey) -> Result<Option<ConsolidatedRecord>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ConsolidatedRecord>, StoreError>;

    /// Records with at least one field awaiting arbitration, ordered by sale date.
    async fn list_pending_conflicts(&self) -> Result<Vec<ConsolidatedRecord>, StoreError>;

    /// All records ordered by sale date (undated last), then matching key.
    async fn list_all(&self, limit: usize, offset: usize)
        -> Result<Vec<ConsolidatedRecord>, StoreError>;
}

pub(crate) fn sort_by_sale_date(records: &mut [ConsolidatedRecord]) {
    records.sort_by(|a, b| {
        let by_date = match (a.sale_date, b.sale_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        by_date.then_with(|| a.matching_key.cmp(&b.matching_key))
    });
}

/// Process-local store, used by tests and single-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<MatchingKey, ConsolidatedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ConsolidatedStore for MemoryStore {
    async fn upsert_consolidated(&self, record: &ConsolidatedRecord) -> Result<Uuid, StoreError> {
        let mut map = self.records.write().await;
        let mut record = record.clone();
        record.revision = 1;
        if let Some(existing) = map.get(&record.matching_key) {
            record.id = existing.id;
            record.revision = existing.revision + 1;
        }
        let id = record.id;
        map.insert(record.matching_key.clone(), record);
        Ok(id)
    }

    async fn upsert_if_current(
        &self,
        record: &ConsolidatedRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut map = self.records.write().await;
        let stored = map
            .get(&record.matching_key)
            .map(|existing| (existing.id, existing.revision));
        let Some((id, revision)) = next_write(stored, record) else {
            return Ok(UpsertOutcome::Stale);
        };
        let mut record = record.clone();
        record.id = id;
        record.revision = revision;
        map.insert(record.matching_key.clone(), record);
        Ok(UpsertOutcome::Written { id, revision })
    }

    async fn get_by_key(
        &self,
        key: &MatchingKey,
    ) -> Result<Option<ConsolidatedRecord>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ConsolidatedRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn list_pending_conflicts(&self) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        let mut out = self
            .records
            .read()
            .await
            .values()
            .filter(|record| !record.pending_validation.is_empty())
            .cloned()
            .collect::<Vec<_>>();
        sort_by_sale_date(&mut out);
        Ok(out)
    }

    async fn list_all(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        let mut out = self.records.read().await.values().cloned().collect::<Vec<_>>();
        sort_by_sale_date(&mut out);
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::record;
    use super::*;

    #[tokio::test]
    async fn upsert_keeps_one_record_per_key() {
        let store = MemoryStore::new();
        let first = record("aaaa000000000001", Some(3), false);
        let id = store.upsert_consolidated(&first).await.expect("upsert");

        let mut second = first.clone();
        second.id = Uuid::nil();
        second.confidence_score = 42.0;
        let id_again = store.upsert_consolidated(&second).await.expect("upsert");

        assert_eq!(id, id_again);
        assert_eq!(store.len().await, 1);
        let stored = store.get_by_id(id).await.expect("get").expect("present");
        assert_eq!(stored.confidence_score, 42.0);
    }

    #[tokio::test]
    async fn pending_listing_filters_and_orders_by_sale_date() {
        let store = MemoryStore::new();
        for rec in [
            record("k3", None, true),
            record("k1", Some(20), true),
            record("k2", Some(2), true),
            record("k4", Some(1), false),
        ] {
            store.upsert_consolidated(&rec).await.expect("upsert");
        }

        let pending = store.list_pending_conflicts().await.expect("pending");
        let keys = pending
            .iter()
            .map(|r| r.matching_key.as_str())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["k2", "k1", "k3"]);

        let page = store.list_all(2, 1).await.expect("list");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].matching_key.as_str(), "k2");
    }

    #[tokio::test]
    async fn conditional_write_rejects_a_stale_revision() {
        let store = MemoryStore::new();
        let fresh = record("dddd000000000004", Some(5), true);
        let outcome = store.upsert_if_current(&fresh).await.expect("insert");
        assert_eq!(
            outcome,
            UpsertOutcome::Written {
                id: fresh.id,
                revision: 1
            }
        );
        // a second writer that also saw nothing stored loses
        assert_eq!(
            store.upsert_if_current(&fresh).await.expect("insert again"),
            UpsertOutcome::Stale
        );

        let read = store
            .get_by_key(&fresh.matching_key)
            .await
            .expect("get")
            .expect("present");
        let mut resolved = read.clone();
        resolved.pending_validation.clear();
        assert!(matches!(
            store.upsert_if_current(&resolved).await.expect("update"),
            UpsertOutcome::Written { revision: 2, .. }
        ));

        // a write derived from the earlier read must not clobber the update
        assert_eq!(
            store.upsert_if_current(&read).await.expect("stale update"),
            UpsertOutcome::Stale
        );
        let stored = store
            .get_by_key(&fresh.matching_key)
            .await
            .expect("get")
            .expect("present");
        assert!(stored.pending_validation.is_empty());
        assert_eq!(stored.revision, 2);
    }
}
