//! Matching-key generation.
//!
//! Two bases, tried in order: (sale date, court) and then (address, postal code).
//! Both are normalized, joined with `|`, hashed with sha256 and truncated to 16
//! hex characters. A record with neither basis yields `None` and must not be grouped.

use chrono::NaiveDate;
use jac_core::{MatchingKey, RawRecord};
use sha2::{Digest, Sha256};

pub const KEY_HEX_LEN: usize = 16;

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

pub fn normalize_court(court: &str) -> String {
    court.trim().to_lowercase()
}

/// Lower-cases, turns commas and periods into spaces, collapses whitespace.
pub fn normalize_address(address: &str) -> String {
    address
        .to_lowercase()
        .replace([',', '.'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn fingerprint(basis: &str) -> MatchingKey {
    let mut hasher = Sha256::new();
    hasher.update(basis.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(KEY_HEX_LEN);
    MatchingKey::new(hex)
}

pub fn matching_key(
    sale_date: Option<NaiveDate>,
    court: Option<&str>,
    address: Option<&str>,
    postal_code: Option<&str>,
) -> Option<MatchingKey> {
    if let (Some(date), Some(court)) = (sale_date, present(court)) {
        let basis = format!("{}|{}", date.format("%Y-%m-%d"), normalize_court(court));
        return Some(fingerprint(&basis));
    }
    if let (Some(address), Some(postal)) = (present(address), present(postal_code)) {
        let basis = format!("{}|{}", normalize_address(address), postal);
        return Some(fingerprint(&basis));
    }
    None
}

pub fn key_for_record(record: &RawRecord) -> Option<MatchingKey> {
    matching_key(
        record.sale_date,
        record.court.as_deref(),
        record.address.as_deref(),
        record.postal_code.as_deref(),
    )
}
