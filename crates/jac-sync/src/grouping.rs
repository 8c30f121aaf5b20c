use std::collections::BTreeMap;

use jac_core::{MatchingKey, RawRecord};
use serde::{Deserialize, Serialize};

use crate::matching::key_for_record;

/// Built-in order, most structured source first.
pub const DEFAULT_SOURCE_ORDER: [&str; 3] = ["encheres_publiques", "vench", "licitor"];

/// Fixed source ordering used both for iteration ("first source wins") and for
/// picking the provisional value of a conflicting field. Sources not listed
/// rank after listed ones, alphabetically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOrder {
    sources: Vec<String>,
}

impl SourceOrder {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for source in sources {
            let source = source.into();
            if !out.contains(&source) {
                out.push(source);
            }
        }
        Self { sources: out }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.sources
    }

    pub fn rank<'a>(&self, source: &'a str) -> (usize, &'a str) {
        let position = self
            .sources
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.sources.len());
        (position, source)
    }

    pub fn sorted<'a>(&self, sources: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        let mut out = sources.into_iter().collect::<Vec<_>>();
        out.sort_by(|a, b| self.rank(a).cmp(&self.rank(b)));
        out.dedup();
        out
    }
}

impl Default for SourceOrder {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_ORDER)
    }
}

/// A record that carried neither key basis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedRecord {
    pub reason: String,
    pub record: RawRecord,
}

#[derive(Debug, Clone, Default)]
pub struct Grouping {
    pub groups: BTreeMap<MatchingKey, Vec<RawRecord>>,
    pub unmatched: Vec<UnmatchedRecord>,
}

impl Grouping {
    pub fn record_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum::<usize>() + self.unmatched.len()
    }
}

/// Partitions every record into exactly one group or the unmatched bucket.
/// Within a group records follow `order`, then their input order per source.
/// The map key is authoritative for each record's source name.
pub fn group_records(input: &BTreeMap<String, Vec<RawRecord>>, order: &SourceOrder) -> Grouping {
    let mut grouping = Grouping::default();

    for source in order.sorted(input.keys().map(String::as_str)) {
        let Some(records) = input.get(source) else {
            continue;
        };
        for record in records {
            let mut record = record.clone();
            record.source = source.to_string();
            match key_for_record(&record) {
                Some(key) => grouping.groups.entry(key).or_default().push(record),
                None => {
                    tracing::warn!(
                        source,
                        source_record_id = %record.source_record_id,
                        "record has neither (sale date, court) nor (address, postal code); \
                         left unmatched"
                    );
                    grouping.unmatched.push(UnmatchedRecord {
                        reason: "missing sale date + court and address + postal code".to_string(),
                        record,
                    });
                }
            }
        }
    }

    tracing::info!(
        groups = grouping.groups.len(),
        unmatched = grouping.unmatched.len(),
        "grouped raw records"
    );
    grouping
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn raw(id: &str, court: Option<&str>) -> RawRecord {
        RawRecord {
            source_record_id: id.to_string(),
            sale_date: NaiveDate::from_ymd_opt(2026, 5, 12),
            court: court.map(ToString::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn unknown_sources_rank_after_known_ones() {
        let order = SourceOrder::default();
        assert_eq!(
            order.sorted(["zeta", "licitor", "alpha", "encheres_publiques"]),
            vec!["encheres_publiques", "licitor", "alpha", "zeta"]
        );
    }

    #[test]
    fn records_land_in_one_group_or_unmatched() {
        let mut input = BTreeMap::new();
        input.insert(
            "licitor".to_string(),
            vec![raw("L1", Some("TJ Toulon")), raw("L2", None)],
        );
        input.insert("vench".to_string(), vec![raw("V1", Some("tj toulon"))]);

        let grouping = group_records(&input, &SourceOrder::default());
        assert_eq!(grouping.record_count(), 3);
        assert_eq!(grouping.groups.len(), 1);
        assert_eq!(grouping.unmatched.len(), 1);
        assert_eq!(grouping.unmatched[0].record.source, "licitor");

        let group = grouping.groups.values().next().unwrap();
        let sources = group.iter().map(|r| r.source.as_str()).collect::<Vec<_>>();
        assert_eq!(sources, vec!["vench", "licitor"]);
    }
}
