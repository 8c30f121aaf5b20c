//! Run artifacts: markdown brief, JSON delta, parquet snapshot + manifest, stats.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use jac_core::ConsolidatedRecord;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::grouping::UnmatchedRecord;

pub const BRIEF_FILE: &str = "run_brief.md";
pub const DELTA_FILE: &str = "consolidated_delta.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationStats {
    pub total: usize,
    pub with_conflicts: usize,
    /// Number of records per contributing-source count.
    pub by_source_count: BTreeMap<usize, usize>,
    /// Mean confidence, rounded to one decimal.
    pub average_confidence: f64,
}

impl ConsolidationStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ConsolidatedRecord>) -> Self {
        let mut stats = Self::default();
        let mut confidence_sum = 0.0;
        for record in records {
            stats.total += 1;
            if record.has_unresolved_conflicts() {
                stats.with_conflicts += 1;
            }
            *stats.by_source_count.entry(record.sources.len()).or_default() += 1;
            confidence_sum += record.confidence_score;
        }
        if stats.total > 0 {
            stats.average_confidence = (confidence_sum / stats.total as f64 * 10.0).round() / 10.0;
        }
        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<String>,
    pub raw_records: usize,
    pub attempted_writes: usize,
    pub succeeded_writes: usize,
    pub store: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub async fn write_run_reports(
    reports_dir: &Path,
    run: &RunRecord,
    records: &[ConsolidatedRecord],
    unmatched: &[UnmatchedRecord],
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let stats = ConsolidationStats::from_records(records);
    let pending = records
        .iter()
        .filter(|r| !r.pending_validation.is_empty())
        .map(|r| {
            let fields = r
                .pending_validation
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "- `{}` {} ({}): {}",
                r.matching_key,
                r.sale_date.map(|d| d.to_string()).unwrap_or_else(|| "undated".into()),
                r.court.as_deref().unwrap_or("court unknown"),
                fields
            )
        })
        .collect::<Vec<_>>();

    let brief = format!(
        "# JAC Run Brief\n\n\
         - Run ID: `{}`\n\
         - Started: {}\n\
         - Finished: {}\n\
         - Sources: {}\n\
         - Raw records: {}\n\
         - Consolidated: {}\n\
         - Unmatched: {}\n\
         - Writes: {}/{}\n\
         - Average confidence: {:.1}\n\n\
         ## Pending Validation\n{}\n",
        run.run_id,
        run.started_at,
        run.finished_at,
        run.sources.join(", "),
        run.raw_records,
        stats.total,
        unmatched.len(),
        run.succeeded_writes,
        run.attempted_writes,
        stats.average_confidence,
        if pending.is_empty() {
            "- none".to_string()
        } else {
            pending.join("\n")
        }
    );
    fs::write(reports_dir.join(BRIEF_FILE), brief)
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    let delta = serde_json::to_vec_pretty(&serde_json::json!({
        "run": run,
        "stats": stats,
        "records": records,
        "unmatched": unmatched,
    }))
    .context("serializing consolidated delta")?;
    fs::write(reports_dir.join(DELTA_FILE), delta)
        .await
        .with_context(|| format!("writing {DELTA_FILE}"))?;
    Ok(())
}

/// Writes `snapshots/{consolidated,conflicts}.parquet` and a manifest with
/// the sha256 of each file. Returns the manifest path.
pub fn export_parquet_snapshot(
    reports_dir: &Path,
    records: &[ConsolidatedRecord],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let consolidated_path = snapshot_dir.join("consolidated.parquet");
    let conflicts_path = snapshot_dir.join("conflicts.parquet");
    write_consolidated_parquet(&consolidated_path, records)?;
    write_conflicts_parquet(&conflicts_path, records)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("consolidated", reports_dir, &consolidated_path)?,
            manifest_entry("conflicts", reports_dir, &conflicts_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_consolidated_parquet(path: &Path, records: &[ConsolidatedRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("matching_key", DataType::Utf8, false),
        ArrowField::new("sale_date", DataType::Utf8, true),
        ArrowField::new("court", DataType::Utf8, true),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("property_type", DataType::Utf8, false),
        ArrowField::new("starting_price", DataType::Float64, true),
        ArrowField::new("source_count", DataType::UInt32, false),
        ArrowField::new("pending_fields", DataType::UInt32, false),
        ArrowField::new("confidence_score", DataType::Float64, false),
    ]));

    let ids = StringArray::from(records.iter().map(|r| Some(r.id.to_string())).collect::<Vec<_>>());
    let keys = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.matching_key.as_str()))
            .collect::<Vec<_>>(),
    );
    let sale_dates = StringArray::from(
        records
            .iter()
            .map(|r| r.sale_date.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let courts = StringArray::from(records.iter().map(|r| r.court.as_deref()).collect::<Vec<_>>());
    let cities = StringArray::from(records.iter().map(|r| r.city.as_deref()).collect::<Vec<_>>());
    let property_types = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.property_type.tag()))
            .collect::<Vec<_>>(),
    );
    let prices = Float64Array::from(records.iter().map(|r| r.starting_price).collect::<Vec<_>>());
    let source_counts =
        UInt32Array::from(records.iter().map(|r| r.sources.len() as u32).collect::<Vec<_>>());
    let pending = UInt32Array::from(
        records
            .iter()
            .map(|r| r.pending_validation.len() as u32)
            .collect::<Vec<_>>(),
    );
    let confidence = Float64Array::from(
        records
            .iter()
            .map(|r| r.confidence_score)
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(keys),
            Arc::new(sale_dates),
            Arc::new(courts),
            Arc::new(cities),
            Arc::new(property_types),
            Arc::new(prices),
            Arc::new(source_counts),
            Arc::new(pending),
            Arc::new(confidence),
        ],
    )
    .context("building consolidated record batch")?;
    write_parquet(path, batch)
}

/// One row per (record, conflicting field, reporting source).
fn write_conflicts_parquet(path: &Path, records: &[ConsolidatedRecord]) -> Result<()> {
    let rows = records
        .iter()
        .flat_map(|r| {
            r.conflicts.values().flat_map(move |conflict| {
                conflict.values_by_source.iter().map(move |(source, value)| {
                    (
                        r.matching_key.as_str(),
                        conflict.field.name(),
                        source.as_str(),
                        value.to_string(),
                        conflict.resolved,
                        conflict.chosen_source.as_deref(),
                    )
                })
            })
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("matching_key", DataType::Utf8, false),
        ArrowField::new("field", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("value", DataType::Utf8, false),
        ArrowField::new("resolved", DataType::Boolean, false),
        ArrowField::new("chosen_source", DataType::Utf8, true),
    ]));
    let keys = StringArray::from(rows.iter().map(|row| Some(row.0)).collect::<Vec<_>>());
    let fields = StringArray::from(rows.iter().map(|row| Some(row.1)).collect::<Vec<_>>());
    let sources = StringArray::from(rows.iter().map(|row| Some(row.2)).collect::<Vec<_>>());
    let values = StringArray::from(rows.iter().map(|row| Some(row.3.as_str())).collect::<Vec<_>>());
    let resolved = BooleanArray::from(rows.iter().map(|row| row.4).collect::<Vec<_>>());
    let chosen = StringArray::from(rows.iter().map(|row| row.5).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(fields),
            Arc::new(sources),
            Arc::new(values),
            Arc::new(resolved),
            Arc::new(chosen),
        ],
    )
    .context("building conflicts record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the most recent `runs` report directories.
pub fn report_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path().join(DELTA_FILE);
            let text = std::fs::read_to_string(&path).ok()?;
            let delta: serde_json::Value = serde_json::from_str(&text).ok()?;
            Some((entry.path(), delta))
        })
        .collect::<Vec<_>>();
    // newest first; run ids are random so order by the recorded finish time
    dirs.sort_by(|(_, a), (_, b)| {
        let finished = |v: &serde_json::Value| {
            v.pointer("/run/finished_at")
                .and_then(|f| f.as_str())
                .map(ToString::to_string)
        };
        finished(b).cmp(&finished(a))
    });

    let mut lines = vec!["# JAC Consolidation Runs".to_string(), String::new()];
    for (dir, delta) in dirs.into_iter().take(runs.max(1)) {
        let run: Option<RunRecord> = delta
            .get("run")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        let stats: ConsolidationStats = delta
            .get("stats")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let unmatched = delta
            .get("unmatched")
            .and_then(|v| v.as_array())
            .map(Vec::len)
            .unwrap_or(0);

        let run_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        lines.push(format!("## Run `{run_id}`"));
        if let Some(run) = &run {
            lines.push(format!("- finished: {}", run.finished_at));
            lines.push(format!("- writes: {}/{}", run.succeeded_writes, run.attempted_writes));
            lines.push(format!("- store: `{}`", run.store));
        }
        lines.push(format!("- consolidated: {}", stats.total));
        lines.push(format!("- with open conflicts: {}", stats.with_conflicts));
        lines.push(format!("- unmatched: {unmatched}"));
        lines.push(format!("- average confidence: {:.1}", stats.average_confidence));
        let manifest_path = dir.join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jac_core::{FieldConflict, FieldValue, MatchingKey, TrackedField};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).single().unwrap()
    }

    fn record(key: &str, sources: &[&str], score: f64, open_conflict: bool) -> ConsolidatedRecord {
        let mut record = ConsolidatedRecord::new(MatchingKey::new(key), 1, at());
        record.sources = sources.iter().map(ToString::to_string).collect();
        record.confidence_score = score;
        if open_conflict {
            let values = sources
                .iter()
                .enumerate()
                .map(|(i, s)| (s.to_string(), FieldValue::Integer(i as i64 + 2)))
                .collect();
            record.conflicts.insert(
                TrackedField::Floor,
                FieldConflict::open(TrackedField::Floor, values, at()),
            );
            record.pending_validation.push(TrackedField::Floor);
        }
        record
    }

    #[test]
    fn stats_round_average_to_one_decimal() {
        let records = vec![
            record("a", &["licitor", "vench"], 90.0, true),
            record("b", &["licitor"], 100.0, false),
            record("c", &["licitor", "vench", "encheres_publiques"], 85.5, false),
        ];
        let stats = ConsolidationStats::from_records(&records);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.with_conflicts, 1);
        assert_eq!(stats.by_source_count.get(&2), Some(&1));
        assert_eq!(stats.by_source_count.get(&3), Some(&1));
        assert_eq!(stats.average_confidence, 91.8);
        assert_eq!(ConsolidationStats::from_records(&Vec::new()).average_confidence, 0.0);
    }

    #[tokio::test]
    async fn reports_and_parquet_land_in_run_directory() {
        let root = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let dir = root.path().join(run_id.to_string());
        let records = vec![
            record("a", &["licitor", "vench"], 90.0, true),
            record("b", &["licitor"], 100.0, false),
        ];
        let run = RunRecord {
            run_id,
            started_at: at(),
            finished_at: at(),
            sources: vec!["licitor".into(), "vench".into()],
            raw_records: 3,
            attempted_writes: 2,
            succeeded_writes: 2,
            store: "memory".into(),
        };

        write_run_reports(&dir, &run, &records, &[]).await.unwrap();
        let manifest_path = export_parquet_snapshot(&dir, &records).unwrap();

        let brief = std::fs::read_to_string(dir.join(BRIEF_FILE)).unwrap();
        assert!(brief.contains("- Writes: 2/2"));
        assert!(brief.contains("floor"));

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert!(manifest.files.iter().all(|f| f.sha256.len() == 64 && f.bytes > 0));

        let digest = report_runs_markdown(5, root.path()).unwrap();
        assert!(digest.contains(&run_id.to_string()));
        assert!(digest.contains("- with open conflicts: 1"));
    }
}
