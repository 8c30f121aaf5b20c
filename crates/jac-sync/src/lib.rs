//! Multi-source consolidation: matching keys, grouping, field reconciliation,
//! media merge, confidence scoring, conflict resolution and the batch pipeline.

pub mod confidence;
pub mod config;
pub mod grouping;
pub mod ledger;
pub mod matching;
pub mod media;
pub mod pipeline;
pub mod reconcile;
pub mod report;

pub use confidence::{confidence_score, score_record};
pub use config::{
    load_field_schema, open_store, ConsolidationConfig, SourceConfig, SourceRegistry, StoreBackend,
};
pub use grouping::{group_records, Grouping, SourceOrder, UnmatchedRecord, DEFAULT_SOURCE_ORDER};
pub use ledger::{
    apply_resolution, ConflictLedger, LedgerError, Resolution, MAX_WRITE_ATTEMPTS,
};
pub use matching::{key_for_record, matching_key};
pub use media::{merge_documents, merge_photos, MAX_PHOTOS};
pub use pipeline::{
    build_scheduler, run_once_from_env, ConsolidationPipeline, GeocodeHook, NoopGeocodeHook,
    RunSummary,
};
pub use reconcile::{
    reconcile_field, ConsolidationOutput, Consolidator, FieldOutcome, ReconcileOptions,
};
pub use report::{report_runs_markdown, ConsolidationStats};

pub const CRATE_NAME: &str = "jac-sync";
