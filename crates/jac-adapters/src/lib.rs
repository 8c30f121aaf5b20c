//! Source feed contracts + snapshot bundles written by the site scrapers.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use jac_core::{Document, GeoPoint, PropertyType, RawRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jac-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("snapshot for `{expected}` declares source `{found}`")]
    SourceMismatch { expected: String, found: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Bundle bytes exactly as the scraper wrote them.
#[derive(Debug, Clone)]
pub struct FeedPayload {
    pub fetched_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// One feed's contribution to a consolidation run.
#[derive(Debug, Clone)]
pub struct FeedBatch {
    pub source_id: String,
    /// Present when the feed read a serialized bundle worth archiving.
    pub payload: Option<FeedPayload>,
    pub records: Vec<RawRecord>,
}

/// Anything that can hand the consolidator one source's raw records.
pub trait SourceFeed: Send + Sync {
    fn source_id(&self) -> &str;

    fn load(&self) -> Result<FeedBatch, AdapterError>;

    fn load_records(&self) -> Result<Vec<RawRecord>, AdapterError> {
        Ok(self.load()?.records)
    }
}

/// One scraper run for one source, as persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub source_id: String,
    #[serde(default)]
    pub captured_from_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
    #[serde(default)]
    pub records: Vec<SnapshotRecord>,
}

/// Scraper output row. Every key is present; absent data is `null` or empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotRecord {
    pub source_record_id: String,
    pub url: String,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub department: Option<String>,
    pub surface: Option<f64>,
    pub rooms: Option<i64>,
    pub bedrooms: Option<i64>,
    pub floor: Option<i64>,
    pub property_type: Option<String>,
    pub starting_price: Option<f64>,
    pub occupancy: Option<String>,
    pub land_registry: Option<String>,
    pub attorney_name: Option<String>,
    pub attorney_phone: Option<String>,
    pub attorney_email: Option<String>,
    pub description: Option<String>,
    pub detailed_description: Option<String>,
    pub photos: Vec<String>,
    pub documents: Vec<Document>,
    pub sale_date: Option<NaiveDate>,
    pub sale_time: Option<String>,
    pub court: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

pub fn parse_snapshot_bundle(bytes: &[u8]) -> Result<SnapshotBundle> {
    serde_json::from_slice(bytes).context("parsing snapshot bundle")
}

pub fn load_snapshot_bundle(path: impl AsRef<Path>) -> Result<SnapshotBundle> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_snapshot_bundle(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn deterministic_snapshot_id(bundle: &SnapshotBundle) -> Uuid {
    let source = format!(
        "{}:{}:{}",
        bundle.source_id,
        bundle.extractor_version,
        bundle.fetched_at.to_rfc3339()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Converts scraper rows into raw records. Property-type tags are coerced onto
/// the closed enumeration here; unknown tags become `other`.
pub fn bundle_to_records(bundle: &SnapshotBundle) -> Vec<RawRecord> {
    bundle
        .records
        .iter()
        .map(|row| RawRecord {
            source: bundle.source_id.clone(),
            source_record_id: row.source_record_id.clone(),
            url: row.url.clone(),
            scraped_at: Some(bundle.fetched_at),
            address: trimmed(&row.address),
            postal_code: trimmed(&row.postal_code),
            city: trimmed(&row.city),
            department: trimmed(&row.department),
            surface: row.surface,
            rooms: row.rooms,
            bedrooms: row.bedrooms,
            floor: row.floor,
            property_type: row
                .property_type
                .as_deref()
                .map(PropertyType::coerce)
                .unwrap_or_default(),
            starting_price: row.starting_price,
            occupancy: trimmed(&row.occupancy),
            land_registry: trimmed(&row.land_registry),
            attorney_name: trimmed(&row.attorney_name),
            attorney_phone: trimmed(&row.attorney_phone),
            attorney_email: trimmed(&row.attorney_email),
            description: trimmed(&row.description),
            detailed_description: trimmed(&row.detailed_description),
            photos: row.photos.clone(),
            documents: row.documents.clone(),
            sale_date: row.sale_date,
            sale_time: trimmed(&row.sale_time),
            court: trimmed(&row.court),
            location: match (row.latitude, row.longitude) {
                (Some(latitude), Some(longitude)) => Some(GeoPoint {
                    latitude,
                    longitude,
                }),
                _ => None,
            },
        })
        .collect()
}

/// Parses bundle bytes that must belong to `expected_source`.
pub fn records_from_bundle_bytes(
    expected_source: &str,
    bytes: &[u8],
) -> Result<(SnapshotBundle, Vec<RawRecord>), AdapterError> {
    let bundle = parse_snapshot_bundle(bytes)?;
    if bundle.source_id != expected_source {
        return Err(AdapterError::SourceMismatch {
            expected: expected_source.to_string(),
            found: bundle.source_id,
        });
    }
    let records = bundle_to_records(&bundle);
    tracing::debug!(
        source_id = %expected_source,
        snapshot_id = %deterministic_snapshot_id(&bundle),
        records = records.len(),
        "loaded snapshot bundle"
    );
    Ok((bundle, records))
}

/// Feed backed by a snapshot bundle file on disk.
#[derive(Debug, Clone)]
pub struct SnapshotFileFeed {
    source_id: String,
    path: PathBuf,
}

impl SnapshotFileFeed {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceFeed for SnapshotFileFeed {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn load(&self) -> Result<FeedBatch, AdapterError> {
        let bytes = fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let (bundle, records) = records_from_bundle_bytes(&self.source_id, &bytes)?;
        Ok(FeedBatch {
            source_id: self.source_id.clone(),
            payload: Some(FeedPayload {
                fetched_at: bundle.fetched_at,
                bytes,
            }),
            records,
        })
    }
}

/// Feed over records already in memory.
#[derive(Debug, Clone)]
pub struct StaticFeed {
    source_id: String,
    records: Vec<RawRecord>,
}

impl StaticFeed {
    pub fn new(source_id: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            source_id: source_id.into(),
            records,
        }
    }
}

impl SourceFeed for StaticFeed {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn load(&self) -> Result<FeedBatch, AdapterError> {
        let records = self
            .records
            .iter()
            .cloned()
            .map(|mut record| {
                record.source = self.source_id.clone();
                record
            })
            .collect();
        Ok(FeedBatch {
            source_id: self.source_id.clone(),
            payload: None,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BUNDLE: &str = r#"{
        "source_id": "licitor",
        "captured_from_url": "https://www.licitor.com/ventes-immobilieres",
        "fetched_at": "2026-03-01T06:00:00Z",
        "extractor_version": "licitor-v3",
        "records": [
            {
                "source_record_id": "L-981",
                "url": "https://www.licitor.com/annonce/981.html",
                "address": " 14 boulevard Longchamp ",
                "postal_code": "13001",
                "city": "Marseille",
                "surface": 45.0,
                "property_type": "Appartements",
                "starting_price": 60000.0,
                "occupancy": "",
                "photos": [],
                "documents": [{
                    "url": "https://www.licitor.com/doc/981.pdf",
                    "label": "Cahier des conditions",
                    "kind": "ccv"
                }],
                "sale_date": "2026-04-09",
                "sale_time": "14h00",
                "court": "Tribunal Judiciaire de Marseille",
                "latitude": 43.3,
                "longitude": 5.39
            },
            {
                "source_record_id": "L-982",
                "url": "https://www.licitor.com/annonce/982.html",
                "property_type": "chateau"
            }
        ]
    }"#;

    #[test]
    fn bundle_rows_become_trimmed_raw_records() {
        let bundle = parse_snapshot_bundle(BUNDLE.as_bytes()).expect("parse");
        let records = bundle_to_records(&bundle);
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.source, "licitor");
        assert_eq!(first.address.as_deref(), Some("14 boulevard Longchamp"));
        assert_eq!(first.occupancy, None);
        assert_eq!(first.property_type, PropertyType::Apartment);
        assert_eq!(first.location.map(|p| p.latitude), Some(43.3));
        assert_eq!(first.documents[0].kind.as_deref(), Some("ccv"));

        assert_eq!(records[1].property_type, PropertyType::Other);
        assert_eq!(records[1].location, None);
    }

    #[test]
    fn file_feed_rejects_foreign_bundle() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bundle.json");
        std::fs::write(&path, BUNDLE).expect("write");

        let ok = SnapshotFileFeed::new("licitor", &path).load_records().expect("load");
        assert_eq!(ok.len(), 2);

        let err = SnapshotFileFeed::new("vench", &path).load_records().unwrap_err();
        assert!(matches!(err, AdapterError::SourceMismatch { .. }));
    }

    #[test]
    fn file_feed_carries_bytes_for_archiving() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bundle.json");
        std::fs::write(&path, BUNDLE).expect("write");

        let batch = SnapshotFileFeed::new("licitor", &path).load().expect("load");
        let payload = batch.payload.expect("file feeds keep their bytes");
        assert_eq!(payload.bytes, BUNDLE.as_bytes());
        assert_eq!(payload.fetched_at.to_rfc3339(), "2026-03-01T06:00:00+00:00");
        assert_eq!(batch.records.len(), 2);
    }

    #[test]
    fn static_feed_stamps_its_source() {
        let manual = RawRecord {
            source: "ignored".into(),
            source_record_id: "M-1".into(),
            ..Default::default()
        };
        let batch = StaticFeed::new("vench", vec![manual]).load().expect("load");
        assert!(batch.payload.is_none());
        assert_eq!(batch.source_id, "vench");
        assert_eq!(batch.records[0].source, "vench");
    }

    #[test]
    fn snapshot_id_is_deterministic() {
        let bundle = parse_snapshot_bundle(BUNDLE.as_bytes()).expect("parse");
        assert_eq!(deterministic_snapshot_id(&bundle), deterministic_snapshot_id(&bundle));
    }
}
