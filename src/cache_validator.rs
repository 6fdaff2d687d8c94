//! Validates cached company records using SHA-256 checksums.
//!
//! A checksum over the provider payloads is stored with every record and
//! checked when the record is read back. A mismatch is treated as a cache
//! miss and the record is fetched again.

use crate::models::CompanyRecord;
use crate::providers::ProviderKind;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Computes the hex SHA-256 of a string.
fn compute_checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Checksum over the canonical JSON of the payloads.
///
/// Keys are ordered (`BTreeMap` and serde_json's default sorted maps), so the
/// same payloads always hash to the same value.
pub fn payload_checksum(payloads: &BTreeMap<ProviderKind, Value>) -> String {
    let canonical = serde_json::to_string(payloads).unwrap_or_default();
    compute_checksum(&canonical)
}

/// Returns true if the stored checksum matches the payloads.
pub fn is_record_valid(record: &CompanyRecord) -> bool {
    let computed = payload_checksum(&record.payloads);
    if computed == record.payload_checksum {
        return true;
    }
    tracing::warn!(
        "Cache validation failed for {}: checksum mismatch. Expected: {}, payloads: {}",
        record.cache_key,
        record.payload_checksum,
        record.payloads.len()
    );
    false
}
