use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use jac_core::FieldSchema;
use jac_storage::{ConsolidatedStore, JsonFileStore, MemoryStore, PgConsolidatedStore};
use serde::{Deserialize, Serialize};

use crate::grouping::SourceOrder;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// Lower sorts first; ties break on `source_id`.
    pub priority: u32,
    /// Snapshot bundle path, relative to the workspace root.
    pub snapshot: PathBuf,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> Vec<&SourceConfig> {
        let mut enabled = self.sources.iter().filter(|s| s.enabled).collect::<Vec<_>>();
        enabled.sort_by(|a, b| (a.priority, &a.source_id).cmp(&(b.priority, &b.source_id)));
        enabled
    }

    /// Fixed order over every registered source, disabled ones included, so
    /// records kept from earlier runs still rank consistently.
    pub fn source_order(&self) -> SourceOrder {
        let mut all = self.sources.iter().collect::<Vec<_>>();
        all.sort_by(|a, b| (a.priority, &a.source_id).cmp(&(b.priority, &b.source_id)));
        SourceOrder::new(all.into_iter().map(|s| s.source_id.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    JsonFiles(PathBuf),
    Postgres(String),
}

#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    pub workspace_root: PathBuf,
    pub store: StoreBackend,
    pub archive_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub bind: String,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl ConsolidationConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("JAC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let store_dir = std::env::var("JAC_STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/consolidated"));
        let store = match (
            std::env::var("JAC_STORE").ok().as_deref(),
            std::env::var("DATABASE_URL").ok(),
        ) {
            (Some("postgres"), Some(url)) => StoreBackend::Postgres(url),
            (Some("memory"), _) => StoreBackend::Memory,
            _ => StoreBackend::JsonFiles(store_dir),
        };
        Self {
            workspace_root,
            store,
            archive_dir: std::env::var("JAC_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/archive")),
            scheduler_enabled: env_flag("JAC_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("JAC_SYNC_CRON").unwrap_or_else(|_| "0 0 7 * * *".to_string()),
            bind: std::env::var("JAC_BIND").unwrap_or_else(|_| "127.0.0.1:8088".to_string()),
        }
    }

    /// Self-contained configuration rooted at `root`; used by tests and demos.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            store: StoreBackend::JsonFiles(root.join("data").join("consolidated")),
            archive_dir: root.join("data").join("archive"),
            workspace_root: root,
            scheduler_enabled: false,
            sync_cron: "0 0 7 * * *".to_string(),
            bind: "127.0.0.1:8088".to_string(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn schema_path(&self) -> PathBuf {
        self.workspace_root.join("schema.yaml")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

pub async fn open_store(backend: &StoreBackend) -> Result<Arc<dyn ConsolidatedStore>> {
    let store: Arc<dyn ConsolidatedStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::JsonFiles(dir) => Arc::new(JsonFileStore::new(dir.clone())),
        StoreBackend::Postgres(url) => Arc::new(
            PgConsolidatedStore::connect(url)
                .await
                .context("connecting to postgres and preparing consolidated_records")?,
        ),
    };
    Ok(store)
}

/// Reads `schema.yaml` when present, otherwise the built-in v1 schema.
pub async fn load_field_schema(path: &Path) -> Result<FieldSchema> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(FieldSchema::v1());
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let schema: FieldSchema =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if schema.is_empty() {
        bail!("{} declares no tracked fields", path.display());
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jac_core::{Normalization, TrackedField};

    const REGISTRY: &str = r#"
sources:
  - source_id: licitor
    display_name: Licitor
    enabled: true
    priority: 30
    snapshot: fixtures/licitor/snapshot.json
  - source_id: encheres_publiques
    display_name: Enchères Publiques
    enabled: true
    priority: 10
    snapshot: fixtures/encheres_publiques/snapshot.json
  - source_id: vench
    display_name: Vench
    enabled: false
    priority: 20
    snapshot: fixtures/vench/snapshot.json
"#;

    #[test]
    fn registry_priority_defines_source_order() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        assert_eq!(
            registry.source_order().as_slice(),
            ["encheres_publiques", "vench", "licitor"]
        );
        let enabled = registry
            .enabled()
            .into_iter()
            .map(|s| s.source_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(enabled, vec!["encheres_publiques", "licitor"]);
    }

    #[tokio::test]
    async fn schema_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.yaml");
        assert_eq!(load_field_schema(&path).await.unwrap(), FieldSchema::v1());

        std::fs::write(
            &path,
            "version: 2\n\
             fields:\n  \
             - field: surface\n    normalization: exact\n  \
             - field: city\n    normalization: case_insensitive\n",
        )
        .unwrap();
        let schema = load_field_schema(&path).await.unwrap();
        assert_eq!(schema.version, 2);
        assert_eq!(schema.len(), 2);
        assert!(schema.contains(TrackedField::City));
        assert_eq!(schema.fields[1].normalization, Normalization::CaseInsensitive);

        std::fs::write(&path, "version: 3\nfields: []\n").unwrap();
        assert!(load_field_schema(&path).await.is_err());
    }
}
