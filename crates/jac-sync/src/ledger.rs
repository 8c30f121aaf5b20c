//! Human arbitration of field conflicts on persisted records.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jac_core::{
    CoercionError, ConsolidatedRecord, FieldConflict, FieldValue, TrackedField, UserChoice,
    MANUAL_SOURCE,
};
use jac_storage::{ConsolidatedStore, StoreError, UpsertOutcome};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::confidence::score_record;

/// Conditional-write retries before a resolution gives up on a busy record.
pub const MAX_WRITE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("unknown record {0}")]
    UnknownRecord(Uuid),
    #[error("record {record_id} has no open conflict on {field}")]
    NoSuchConflict { record_id: Uuid, field: TrackedField },
    #[error("source {chosen_source} did not report {field}")]
    UnknownSource {
        field: TrackedField,
        chosen_source: String,
    },
    #[error("record {0} kept changing; resolution not applied")]
    Contended(Uuid),
    #[error(transparent)]
    Coercion(#[from] CoercionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub field: TrackedField,
    pub chosen_value: FieldValue,
    pub chosen_source: String,
    pub reason: Option<String>,
}

/// Applies a resolution to an in-memory record. Nothing is modified on error.
pub fn apply_resolution(
    record: &mut ConsolidatedRecord,
    resolution: &Resolution,
    total_fields: usize,
    at: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let field = resolution.field;
    let conflict = record
        .conflicts
        .get(&field)
        .filter(|c| !c.resolved)
        .ok_or(LedgerError::NoSuchConflict {
            record_id: record.id,
            field,
        })?;
    if resolution.chosen_source != MANUAL_SOURCE
        && !conflict.values_by_source.contains_key(&resolution.chosen_source)
    {
        return Err(LedgerError::UnknownSource {
            field,
            chosen_source: resolution.chosen_source.clone(),
        });
    }
    let value = resolution.chosen_value.clone().coerce_for(field)?;

    record.set_tracked_value(field, value.clone())?;
    if let Some(conflict) = record.conflicts.get_mut(&field) {
        conflict.resolved = true;
        conflict.chosen_value = Some(value.clone());
        conflict.chosen_source = Some(resolution.chosen_source.clone());
    }
    record.user_choices.entry(field).or_default().push(UserChoice {
        field,
        chosen_value: value,
        chosen_source: resolution.chosen_source.clone(),
        chosen_at: at,
        reason: resolution.reason.clone(),
    });
    record.pending_validation.retain(|pending| *pending != field);
    record.confidence_score = score_record(record, total_fields);
    record.last_consolidated = at;
    Ok(())
}

/// Resolution front door over a store. Resolutions on one record are serialized
/// within this value; across processes the store's conditional write decides.
pub struct ConflictLedger {
    store: Arc<dyn ConsolidatedStore>,
    total_fields: usize,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConflictLedger {
    pub fn new(store: Arc<dyn ConsolidatedStore>, total_fields: usize) -> Self {
        Self {
            store,
            total_fields,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConsolidatedStore> {
        &self.store
    }

    async fn record_lock(&self, record_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(record_id).or_default().clone()
    }

    /// Drops the map entry once the caller holds the last handle besides the map's.
    async fn release_lock(&self, record_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&record_id);
        }
    }

    async fn load(&self, record_id: Uuid) -> Result<ConsolidatedRecord, LedgerError> {
        self.store
            .get_by_id(record_id)
            .await?
            .ok_or(LedgerError::UnknownRecord(record_id))
    }

    pub async fn resolve(
        &self,
        record_id: Uuid,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) -> Result<ConsolidatedRecord, LedgerError> {
        let lock = self.record_lock(record_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.resolve_locked(record_id, &resolution, at).await
        };
        self.release_lock(record_id, lock).await;
        outcome
    }

    async fn resolve_locked(
        &self,
        record_id: Uuid,
        resolution: &Resolution,
        at: DateTime<Utc>,
    ) -> Result<ConsolidatedRecord, LedgerError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut record = self.load(record_id).await?;
            apply_resolution(&mut record, resolution, self.total_fields, at)?;
            match self.store.upsert_if_current(&record).await? {
                UpsertOutcome::Written { revision, .. } => {
                    record.revision = revision;
                    self.log_resolved(&record, resolution);
                    return Ok(record);
                }
                UpsertOutcome::Stale => tracing::debug!(
                    %record_id,
                    attempt,
                    "record changed while resolving; reloading"
                ),
            }
        }
        Err(LedgerError::Contended(record_id))
    }

    fn log_resolved(&self, record: &ConsolidatedRecord, resolution: &Resolution) {
        tracing::info!(
            record_id = %record.id,
            matching_key = %record.matching_key,
            field = %resolution.field,
            source = %resolution.chosen_source,
            remaining = record.pending_validation.len(),
            "conflict resolved"
        );
    }

    pub async fn get_unresolved_conflicts(
        &self,
        record_id: Uuid,
    ) -> Result<Vec<FieldConflict>, LedgerError> {
        let record = self.load(record_id).await?;
        Ok(record.unresolved_conflicts().into_iter().cloned().collect())
    }

    pub async fn get_field_comparison(
        &self,
        record_id: Uuid,
        field: TrackedField,
    ) -> Result<BTreeMap<String, Option<FieldValue>>, LedgerError> {
        Ok(self.load(record_id).await?.field_comparison(field))
    }
}
