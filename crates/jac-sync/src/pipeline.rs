use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jac_adapters::{SnapshotFileFeed, SourceFeed};
use jac_core::{ConsolidatedRecord, GeoPoint, MatchingKey, RawRecord};
use jac_storage::{ConsolidatedStore, SnapshotArchive, UpsertOutcome};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{
    load_field_schema, open_store, ConsolidationConfig, SourceRegistry, StoreBackend,
};
use crate::ledger::MAX_WRITE_ATTEMPTS;
use crate::reconcile::{Consolidator, ReconcileOptions};
use crate::report::{export_parquet_snapshot, write_run_reports, RunRecord};

/// Resolves coordinates for records none of the sources located.
pub trait GeocodeHook: Send + Sync {
    fn locate(&self, record: &ConsolidatedRecord) -> Result<Option<GeoPoint>>;
}

#[derive(Default)]
pub struct NoopGeocodeHook;

impl GeocodeHook for NoopGeocodeHook {
    fn locate(&self, _record: &ConsolidatedRecord) -> Result<Option<GeoPoint>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<String>,
    pub raw_records: usize,
    pub archived_snapshots: usize,
    pub consolidated: usize,
    pub unmatched: usize,
    pub pending_validation: usize,
    pub attempted_writes: usize,
    pub succeeded_writes: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

pub struct ConsolidationPipeline {
    config: ConsolidationConfig,
    store: Arc<dyn ConsolidatedStore>,
    archive: SnapshotArchive,
    geocoder: Box<dyn GeocodeHook>,
    options: ReconcileOptions,
    extra_feeds: Vec<Arc<dyn SourceFeed>>,
}

impl ConsolidationPipeline {
    pub fn new(config: ConsolidationConfig, store: Arc<dyn ConsolidatedStore>) -> Self {
        let archive = SnapshotArchive::new(config.archive_dir.clone());
        Self {
            config,
            store,
            archive,
            geocoder: Box::<NoopGeocodeHook>::default(),
            options: ReconcileOptions::default(),
            extra_feeds: Vec::new(),
        }
    }

    /// Adds a feed read on every run after the registry's snapshot files.
    pub fn with_feed(mut self, feed: impl SourceFeed + 'static) -> Self {
        self.extra_feeds.push(Arc::new(feed));
        self
    }

    pub fn with_geocoder(mut self, geocoder: Box<dyn GeocodeHook>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ConsolidatedStore> {
        &self.store
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("consolidation_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let registry = SourceRegistry::load(&self.config.registry_path()).await?;
        let schema = load_field_schema(&self.config.schema_path()).await?;
        let consolidator =
            Consolidator::new(schema, registry.source_order()).with_options(self.options);

        let mut feeds: Vec<Arc<dyn SourceFeed>> = registry
            .enabled()
            .into_iter()
            .map(|source| -> Arc<dyn SourceFeed> {
                let path = self.config.workspace_root.join(&source.snapshot);
                Arc::new(SnapshotFileFeed::new(source.source_id.clone(), path))
            })
            .collect();
        feeds.extend(self.extra_feeds.iter().cloned());

        let mut input: BTreeMap<String, Vec<RawRecord>> = BTreeMap::new();
        let mut archived_snapshots = 0usize;
        for feed in &feeds {
            let batch = feed
                .load()
                .with_context(|| format!("loading feed {}", feed.source_id()))?;
            let mut content_hash = None;
            if let Some(payload) = &batch.payload {
                let archived = self
                    .archive
                    .archive_bundle(payload.fetched_at, &batch.source_id, &payload.bytes)
                    .await
                    .with_context(|| format!("archiving snapshot for {}", batch.source_id))?;
                if !archived.deduplicated {
                    archived_snapshots += 1;
                }
                content_hash = Some(archived.content_hash);
            }
            tracing::info!(
                source_id = %batch.source_id,
                records = batch.records.len(),
                content_hash = content_hash.as_deref().unwrap_or("-"),
                "source feed loaded"
            );
            input.entry(batch.source_id).or_default().extend(batch.records);
        }
        let raw_records = input.values().map(Vec::len).sum::<usize>();

        let grouping = consolidator.group(&input);
        let at = Utc::now();
        let mut records = Vec::with_capacity(grouping.groups.len());
        let mut succeeded_writes = 0usize;
        for (key, group) in &grouping.groups {
            let previous = self.store.get_by_key(key).await?;
            let mut record = consolidator.merge_group(key, group, previous.as_ref(), at);
            self.geocode(&mut record);
            match self.persist(&consolidator, key, group, &mut record, at).await {
                Ok(()) => succeeded_writes += 1,
                Err(err) => tracing::warn!(
                    matching_key = %key,
                    error = %format!("{err:#}"),
                    "upsert failed; record skipped"
                ),
            }
            records.push(record);
        }

        let finished_at = Utc::now();
        let run = RunRecord {
            run_id,
            started_at,
            finished_at,
            sources: input.keys().cloned().collect(),
            raw_records,
            attempted_writes: records.len(),
            succeeded_writes,
            store: store_label(&self.config.store).to_string(),
        };
        let reports_dir = self.config.reports_root().join(run_id.to_string());
        write_run_reports(&reports_dir, &run, &records, &grouping.unmatched).await?;
        let manifest_path = export_parquet_snapshot(&reports_dir, &records)?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            sources: run.sources,
            raw_records,
            archived_snapshots,
            consolidated: records.len(),
            unmatched: grouping.unmatched.len(),
            pending_validation: records
                .iter()
                .filter(|r| !r.pending_validation.is_empty())
                .count(),
            attempted_writes: run.attempted_writes,
            succeeded_writes,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        tracing::info!(
            consolidated = summary.consolidated,
            unmatched = summary.unmatched,
            pending = summary.pending_validation,
            writes = %format!("{}/{}", succeeded_writes, summary.attempted_writes),
            "consolidation run finished"
        );
        Ok(summary)
    }

    /// Writes `record` unless the stored copy changed since it was read; then
    /// the group is merged again over the fresh copy so resolutions made in
    /// the meantime are kept.
    async fn persist(
        &self,
        consolidator: &Consolidator,
        key: &MatchingKey,
        group: &[RawRecord],
        record: &mut ConsolidatedRecord,
        at: DateTime<Utc>,
    ) -> Result<()> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self.store.upsert_if_current(record).await? {
                UpsertOutcome::Written { id, revision } => {
                    record.id = id;
                    record.revision = revision;
                    return Ok(());
                }
                UpsertOutcome::Stale => {
                    tracing::info!(
                        matching_key = %key,
                        attempt,
                        "record changed during the run; merging over the stored copy"
                    );
                    let current = self.store.get_by_key(key).await?;
                    *record = consolidator.merge_group(key, group, current.as_ref(), at);
                    self.geocode(record);
                }
            }
        }
        anyhow::bail!("record {key} kept changing during the run")
    }

    fn geocode(&self, record: &mut ConsolidatedRecord) {
        if record.location.is_some() {
            return;
        }
        match self.geocoder.locate(record) {
            Ok(Some(point)) => record.location = Some(point),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                matching_key = %record.matching_key,
                %err,
                "geocoding failed"
            ),
        }
    }

    pub fn reports_root(&self) -> PathBuf {
        self.config.reports_root()
    }
}

fn store_label(backend: &StoreBackend) -> &'static str {
    match backend {
        StoreBackend::Memory => "memory",
        StoreBackend::JsonFiles(_) => "json-files",
        StoreBackend::Postgres(_) => "postgres",
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = ConsolidationConfig::from_env();
    let store = open_store(&config.store).await?;
    ConsolidationPipeline::new(config, store).run_once().await
}

/// Cron-driven re-consolidation; `None` when the scheduler is disabled.
pub async fn build_scheduler(
    pipeline: Arc<ConsolidationPipeline>,
) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => {
                    tracing::info!(run_id = %summary.run_id, "scheduled consolidation finished")
                }
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "scheduled consolidation failed")
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
