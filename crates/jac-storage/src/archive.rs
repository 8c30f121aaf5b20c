use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::StoreError;

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive of the snapshot bundles each run consumed, addressed by sha256.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path_for(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("{content_hash}.json"))
    }

    pub async fn archive_bundle(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        bytes: &[u8],
    ) -> Result<ArchivedSnapshot, StoreError> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let written = write_atomically(&absolute_path, bytes, false).await?;
        if !written {
            tracing::debug!(source_id, %content_hash, "snapshot already archived");
        }
        Ok(ArchivedSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: !written,
        })
    }
}

/// Writes through a temp file + rename so readers never observe a partial file.
/// With `replace == false` an existing target is left untouched and `false` is returned.
pub(crate) async fn write_atomically(
    path: &Path,
    bytes: &[u8],
    replace: bool,
) -> Result<bool, StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    if !replace && fs::try_exists(path).await.map_err(|e| StoreError::io(path, e))? {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.flush().await.map_err(|e| StoreError::io(&temp_path, e))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(true),
        Err(err) if !replace && err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(StoreError::io(path, err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::at;
    use tempfile::tempdir;

    #[test]
    fn snapshot_hashing_is_stable() {
        assert_eq!(
            SnapshotArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_bundles_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());

        let first = archive
            .archive_bundle(at(), "vench", br#"{"records":[]}"#)
            .await
            .expect("first archive");
        let second = archive
            .archive_bundle(at(), "vench", br#"{"records":[]}"#)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert!(first
            .relative_path
            .to_string_lossy()
            .starts_with("20260224_120000"));
    }
}
