//! Per-group merge: field consensus/conflict arbitration, first-non-null fields,
//! media, confidence.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use jac_core::{
    ConsolidatedRecord, FieldConflict, FieldSchema, FieldSpec, FieldValue, MatchingKey, RawRecord,
    SourceSnapshot,
};
use serde::Serialize;

use crate::confidence::score_record;
use crate::grouping::{group_records, Grouping, SourceOrder, UnmatchedRecord};
use crate::media::{merge_documents, merge_photos};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Recompute fields a human already resolved instead of keeping the decision.
    pub force_reevaluate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOutcome {
    NoData,
    Consensus(FieldValue),
    Conflict {
        values_by_source: BTreeMap<String, FieldValue>,
        provisional: FieldValue,
    },
}

/// Classifies one tracked field over a group. The group must already be in
/// source order; the first record of each source supplies that source's value.
pub fn reconcile_field(spec: &FieldSpec, group: &[RawRecord], order: &SourceOrder) -> FieldOutcome {
    let mut reported: Vec<(&str, FieldValue)> = Vec::new();
    for record in group {
        if reported.iter().any(|(source, _)| *source == record.source) {
            continue;
        }
        if let Some(value) = record.tracked_value(spec.field) {
            reported.push((record.source.as_str(), value));
        }
    }

    let distinct = reported
        .iter()
        .map(|(_, value)| value.normalized(spec.normalization))
        .collect::<BTreeSet<_>>();

    match distinct.len() {
        0 => FieldOutcome::NoData,
        1 => FieldOutcome::Consensus(reported[0].1.clone()),
        _ => {
            let (_, provisional) = reported
                .iter()
                .min_by(|(a, _), (b, _)| order.rank(a).cmp(&order.rank(b)))
                .cloned()
                .unwrap_or_else(|| reported[0].clone());
            FieldOutcome::Conflict {
                values_by_source: reported
                    .into_iter()
                    .map(|(source, value)| (source.to_string(), value))
                    .collect(),
                provisional,
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationOutput {
    pub records: Vec<ConsolidatedRecord>,
    pub unmatched: Vec<UnmatchedRecord>,
}

#[derive(Debug, Clone)]
pub struct Consolidator {
    schema: FieldSchema,
    order: SourceOrder,
    options: ReconcileOptions,
}

impl Consolidator {
    pub fn new(schema: FieldSchema, order: SourceOrder) -> Self {
        Self {
            schema,
            order,
            options: ReconcileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn order(&self) -> &SourceOrder {
        &self.order
    }

    pub fn group(&self, input: &BTreeMap<String, Vec<RawRecord>>) -> Grouping {
        group_records(input, &self.order)
    }

    /// Groups `input` and merges every group. `previous` holds already persisted
    /// records by key so human resolutions survive the re-run.
    pub fn consolidate(
        &self,
        input: &BTreeMap<String, Vec<RawRecord>>,
        previous: &BTreeMap<MatchingKey, ConsolidatedRecord>,
        at: DateTime<Utc>,
    ) -> ConsolidationOutput {
        let grouping = self.group(input);
        let records = grouping
            .groups
            .iter()
            .map(|(key, group)| self.merge_group(key, group, previous.get(key), at))
            .collect::<Vec<_>>();
        tracing::info!(
            consolidated = records.len(),
            unmatched = grouping.unmatched.len(),
            "consolidation pass complete"
        );
        ConsolidationOutput {
            records,
            unmatched: grouping.unmatched,
        }
    }

    pub fn merge_group(
        &self,
        key: &MatchingKey,
        group: &[RawRecord],
        previous: Option<&ConsolidatedRecord>,
        at: DateTime<Utc>,
    ) -> ConsolidatedRecord {
        let mut result = ConsolidatedRecord::new(key.clone(), self.schema.version, at);
        if let Some(previous) = previous {
            result.id = previous.id;
            result.revision = previous.revision;
            result.user_choices = previous.user_choices.clone();
        }

        for record in group {
            if !result.sources.contains(&record.source) {
                result.sources.push(record.source.clone());
            }
            if !record.url.is_empty() {
                result
                    .source_urls
                    .entry(record.source.clone())
                    .or_insert_with(|| record.url.clone());
            }
            if !record.source_record_id.is_empty() {
                result
                    .source_record_ids
                    .entry(record.source.clone())
                    .or_insert_with(|| record.source_record_id.clone());
            }
            result.snapshots.push(SourceSnapshot {
                source: record.source.clone(),
                url: record.url.clone(),
                scraped_at: record.scraped_at,
                record: record.clone(),
            });
        }

        for spec in &self.schema.fields {
            let prior = previous.and_then(|p| p.conflicts.get(&spec.field));
            let sticky = prior.filter(|c| c.resolved && !self.options.force_reevaluate);
            if let Some(resolved) = sticky {
                if self.keep_resolution(&mut result, resolved) {
                    continue;
                }
            }
            self.apply_outcome(&mut result, spec, group, prior, at);
        }

        merge_first_non_null(&mut result, group);
        result.photos = merge_photos(group);
        result.documents = merge_documents(group);
        result.confidence_score = score_record(&result, self.schema.len());
        result
    }

    fn keep_resolution(&self, result: &mut ConsolidatedRecord, resolved: &FieldConflict) -> bool {
        let Some(value) = resolved.chosen_value.clone() else {
            return false;
        };
        match result.set_tracked_value(resolved.field, value) {
            Ok(()) => {
                result.conflicts.insert(resolved.field, resolved.clone());
                true
            }
            Err(err) => {
                tracing::warn!(
                    field = %resolved.field,
                    %err,
                    "stored resolution no longer applies; re-evaluating"
                );
                false
            }
        }
    }

    fn apply_outcome(
        &self,
        result: &mut ConsolidatedRecord,
        spec: &FieldSpec,
        group: &[RawRecord],
        prior: Option<&FieldConflict>,
        at: DateTime<Utc>,
    ) {
        match reconcile_field(spec, group, &self.order) {
            FieldOutcome::NoData => {}
            FieldOutcome::Consensus(value) => {
                if let Err(err) = result.set_tracked_value(spec.field, value) {
                    tracing::warn!(field = %spec.field, %err, "consensus value rejected");
                }
            }
            FieldOutcome::Conflict {
                values_by_source,
                provisional,
            } => {
                tracing::debug!(
                    matching_key = %result.matching_key,
                    field = %spec.field,
                    sources = values_by_source.len(),
                    "field conflict detected"
                );
                let detected_at = prior
                    .filter(|c| !c.resolved)
                    .map(|c| c.detected_at)
                    .unwrap_or(at);
                if let Err(err) = result.set_tracked_value(spec.field, provisional) {
                    tracing::warn!(field = %spec.field, %err, "provisional value rejected");
                }
                result.conflicts.insert(
                    spec.field,
                    FieldConflict::open(spec.field, values_by_source, detected_at),
                );
                result.pending_validation.push(spec.field);
            }
        }
    }
}

fn first_text(slot: &mut Option<String>, value: &Option<String>) {
    if slot.is_none() {
        if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            *slot = Some(v.to_string());
        }
    }
}

/// Fields expected to agree by construction: taken from the first record that has them.
fn merge_first_non_null(result: &mut ConsolidatedRecord, group: &[RawRecord]) {
    for record in group {
        if result.sale_date.is_none() {
            result.sale_date = record.sale_date;
        }
        first_text(&mut result.sale_time, &record.sale_time);
        first_text(&mut result.court, &record.court);
        first_text(&mut result.department, &record.department);
        first_text(&mut result.description, &record.description);
        first_text(&mut result.detailed_description, &record.detailed_description);
        if result.location.is_none() {
            result.location = record.location;
        }
    }
}
