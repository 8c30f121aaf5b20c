use jac_core::ConsolidatedRecord;

pub const UNRESOLVED_PENALTY: f64 = 5.0;

/// 0-100 trust score. Base is the share of tracked fields that never conflicted;
/// two sources add 5, three or more add 10 (capped at 100); every unresolved
/// conflict then costs 5.
pub fn confidence_score(
    total_fields: usize,
    conflicting_fields: usize,
    unresolved_conflicts: usize,
    source_count: usize,
) -> f64 {
    if total_fields == 0 {
        return 0.0;
    }
    let agreeing = total_fields.saturating_sub(conflicting_fields) as f64;
    let mut score = 100.0 * agreeing / total_fields as f64;

    score = match source_count {
        n if n >= 3 => (score + 10.0).min(100.0),
        2 => (score + 5.0).min(100.0),
        _ => score,
    };

    score -= unresolved_conflicts as f64 * UNRESOLVED_PENALTY;
    score.clamp(0.0, 100.0)
}

pub fn score_record(record: &ConsolidatedRecord, total_fields: usize) -> f64 {
    let unresolved = record.conflicts.values().filter(|c| !c.resolved).count();
    confidence_score(
        total_fields,
        record.conflicts.len(),
        unresolved,
        record.sources.len(),
    )
}
