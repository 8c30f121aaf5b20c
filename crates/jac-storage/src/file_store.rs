use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use jac_core::{ConsolidatedRecord, MatchingKey};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::archive::write_atomically;
use crate::{next_write, sort_by_sale_date, ConsolidatedStore, StoreError, UpsertOutcome};

const LOCK_ATTEMPTS: u32 = 200;
const LOCK_RETRY: Duration = Duration::from_millis(25);

/// Exclusive hold on one key's document across processes: a `<key>.json.lock`
/// file created with `create_new` and removed on drop.
struct KeyLock {
    path: PathBuf,
}

impl KeyLock {
    async fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        for _ in 0..LOCK_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(err) => return Err(StoreError::io(&path, err)),
            }
        }
        Err(StoreError::Busy(path))
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "could not release record lock");
        }
    }
}

/// One pretty-printed JSON document per matching key under `root`.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &MatchingKey) -> PathBuf {
        self.root.join(format!("{}.json", key.as_str()))
    }

    fn lock_path_for(&self, key: &MatchingKey) -> PathBuf {
        self.root.join(format!("{}.json.lock", key.as_str()))
    }

    async fn read_existing(path: &Path) -> Result<Option<ConsolidatedRecord>, StoreError> {
        if !fs::try_exists(path).await.map_err(|e| StoreError::io(path, e))? {
            return Ok(None);
        }
        Self::read_record(path).await.map(Some)
    }

    async fn read_record(path: &Path) -> Result<ConsolidatedRecord, StoreError> {
        let bytes = fs::read(path).await.map_err(|e| StoreError::io(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn read_all(&self) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        if !fs::try_exists(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            out.push(Self::read_record(&path).await?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ConsolidatedStore for JsonFileStore {
    async fn upsert_consolidated(&self, record: &ConsolidatedRecord) -> Result<Uuid, StoreError> {
        let _guard = self.write_lock.lock().await;
        let _lock = KeyLock::acquire(self.lock_path_for(&record.matching_key)).await?;
        let path = self.path_for(&record.matching_key);

        let mut record = record.clone();
        record.revision = 1;
        if let Some(existing) = Self::read_existing(&path).await? {
            record.id = existing.id;
            record.revision = existing.revision + 1;
        }
        let bytes = serde_json::to_vec_pretty(&record)?;
        write_atomically(&path, &bytes, true).await?;
        Ok(record.id)
    }

    async fn upsert_if_current(
        &self,
        record: &ConsolidatedRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let _lock = KeyLock::acquire(self.lock_path_for(&record.matching_key)).await?;
        let path = self.path_for(&record.matching_key);

        let stored = Self::read_existing(&path)
            .await?
            .map(|existing| (existing.id, existing.revision));
        let Some((id, revision)) = next_write(stored, record) else {
            return Ok(UpsertOutcome::Stale);
        };
        let mut record = record.clone();
        record.id = id;
        record.revision = revision;
        let bytes = serde_json::to_vec_pretty(&record)?;
        write_atomically(&path, &bytes, true).await?;
        Ok(UpsertOutcome::Written { id, revision })
    }

    async fn get_by_key(
        &self,
        key: &MatchingKey,
    ) -> Result<Option<ConsolidatedRecord>, StoreError> {
        Self::read_existing(&self.path_for(key)).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ConsolidatedRecord>, StoreError> {
        Ok(self.read_all().await?.into_iter().find(|record| record.id == id))
    }

    async fn list_pending_conflicts(&self) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        let mut out = self
            .read_all()
            .await?
            .into_iter()
            .filter(|record| !record.pending_validation.is_empty())
            .collect::<Vec<_>>();
        sort_by_sale_date(&mut out);
        Ok(out)
    }

    async fn list_all(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        let mut out = self.read_all().await?;
        sort_by_sale_date(&mut out);
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::record;
    use tempfile::tempdir;

    #[tokio::test]
    async fn records_round_trip_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("consolidated"));

        assert!(store.list_all(10, 0).await.expect("empty list").is_empty());

        let rec = record("bbbb000000000002", Some(7), true);
        let id = store.upsert_consolidated(&rec).await.expect("upsert");

        let by_key = store
            .get_by_key(&rec.matching_key)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(by_key.revision, 1);
        assert_eq!(ConsolidatedRecord { revision: 0, ..by_key }, rec);
        assert_eq!(store.get_by_id(id).await.expect("get").map(|r| r.id), Some(id));
        assert_eq!(store.list_pending_conflicts().await.expect("pending").len(), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_in_place() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        let mut rec = record("cccc000000000003", None, true);
        store.upsert_consolidated(&rec).await.expect("first");
        rec.pending_validation.clear();
        store.upsert_consolidated(&rec).await.expect("second");

        assert_eq!(store.list_all(10, 0).await.expect("list").len(), 1);
        assert!(store.list_pending_conflicts().await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn conditional_write_sees_writes_from_another_handle() {
        let dir = tempdir().expect("tempdir");
        // two handles on one directory stand in for two processes
        let watcher = JsonFileStore::new(dir.path());
        let operator = JsonFileStore::new(dir.path());

        let rec = record("eeee000000000005", Some(9), true);
        watcher.upsert_if_current(&rec).await.expect("insert");
        let seen = watcher
            .get_by_key(&rec.matching_key)
            .await
            .expect("get")
            .expect("present");

        let mut resolved = seen.clone();
        resolved.pending_validation.clear();
        assert!(matches!(
            operator.upsert_if_current(&resolved).await.expect("resolve"),
            UpsertOutcome::Written { revision: 2, .. }
        ));
        assert_eq!(
            watcher.upsert_if_current(&seen).await.expect("stale"),
            UpsertOutcome::Stale
        );
        assert!(watcher.list_pending_conflicts().await.expect("pending").is_empty());
        // lock files never show up as records
        assert_eq!(watcher.list_all(10, 0).await.expect("list").len(), 1);
        assert!(!dir.path().join("eeee000000000005.json.lock").exists());
    }
}
