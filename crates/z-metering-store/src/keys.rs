//! Key encoding utilities for `RocksDB`.
//!
//! Strings are length-prefixed (`u32` big-endian) so that concatenated
//! components never alias. Timestamps are microseconds since the epoch with the
//! sign bit flipped, which makes big-endian byte order match time order.

use chrono::{DateTime, Utc};

use z_metering_core::{RecordId, RecordKey, Scope};

use crate::error::{Result, StoreError};

/// Length of the `event_timestamp || record_id` suffix.
pub const RECORD_SUFFIX_LEN: usize = 8 + 16;

fn put_str(buf: &mut Vec<u8>, s: &str) {
    // Identifiers longer than u32::MAX bytes cannot be constructed in practice.
    #[allow(clippy::cast_possible_truncation)]
    let len = s.len() as u32;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Encode a timestamp so that byte order equals time order.
#[must_use]
pub fn encode_timestamp(at: DateTime<Utc>) -> [u8; 8] {
    #[allow(clippy::cast_sign_loss)]
    let biased = (at.timestamp_micros() as u64) ^ (1 << 63);
    biased.to_be_bytes()
}

/// Create the prefix shared by every key of a scope.
#[must_use]
pub fn scope_prefix(scope: &Scope) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + scope.tenant_id.len() + scope.environment_id.len());
    put_str(&mut key, &scope.tenant_id);
    put_str(&mut key, &scope.environment_id);
    key
}

/// Create the `event_timestamp || record_id` suffix.
#[must_use]
pub fn record_suffix(event_timestamp: DateTime<Utc>, id: &RecordId) -> [u8; RECORD_SUFFIX_LEN] {
    let mut suffix = [0u8; RECORD_SUFFIX_LEN];
    suffix[..8].copy_from_slice(&encode_timestamp(event_timestamp));
    suffix[8..].copy_from_slice(&id.to_bytes());
    suffix
}

/// Create a usage record key.
///
/// Format: `scope || event_timestamp (8 bytes) || record_id (16 bytes)`
#[must_use]
pub fn record_key(scope: &Scope, event_timestamp: DateTime<Utc>, id: &RecordId) -> Vec<u8> {
    let mut key = scope_prefix(scope);
    key.extend_from_slice(&record_suffix(event_timestamp, id));
    key
}

/// Create the first possible record key at or after `at` under `prefix`.
#[must_use]
pub fn time_bound(prefix: &[u8], at: DateTime<Utc>) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&encode_timestamp(at));
    key
}

/// Create the smallest key strictly greater than the record at
/// `(event_timestamp, id)` under `prefix`.
#[must_use]
pub fn after_bound(prefix: &[u8], event_timestamp: DateTime<Utc>, id: &RecordId) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&record_suffix(event_timestamp, id));
    key.push(0);
    key
}

/// Create the prefix for iterating records of one subscription.
#[must_use]
pub fn subscription_prefix(scope: &Scope, subscription_id: &str) -> Vec<u8> {
    let mut key = scope_prefix(scope);
    put_str(&mut key, subscription_id);
    key
}

/// Create a subscription index key.
///
/// Format: `scope || subscription_id || event_timestamp || record_id`
#[must_use]
pub fn subscription_index_key(
    scope: &Scope,
    subscription_id: &str,
    event_timestamp: DateTime<Utc>,
    id: &RecordId,
) -> Vec<u8> {
    let mut key = subscription_prefix(scope, subscription_id);
    key.extend_from_slice(&record_suffix(event_timestamp, id));
    key
}

/// Create a uniqueness index key.
///
/// Format: `scope || subscription_id || meter_id || period_id (8 bytes) || unique_hash`
#[must_use]
pub fn dedup_key(scope: &Scope, key: &RecordKey) -> Vec<u8> {
    let mut buf = scope_prefix(scope);
    put_str(&mut buf, &key.subscription_id);
    put_str(&mut buf, &key.meter_id);
    buf.extend_from_slice(&key.period_id.to_be_bytes());
    put_str(&mut buf, &key.unique_hash);
    buf
}

/// Take the trailing `event_timestamp || record_id` suffix of an index key.
///
/// # Errors
///
/// Returns `StoreError::CorruptKey` if the key is too short.
pub fn trailing_suffix(key: &[u8]) -> Result<&[u8]> {
    key.len()
        .checked_sub(RECORD_SUFFIX_LEN)
        .map(|start| &key[start..])
        .ok_or_else(|| StoreError::CorruptKey(format!("index key of {} bytes", key.len())))
}

/// Extract the record ID from an `event_timestamp || record_id` suffix.
///
/// # Errors
///
/// Returns `StoreError::CorruptKey` if the suffix has the wrong length.
pub fn record_id_from_suffix(suffix: &[u8]) -> Result<RecordId> {
    let bytes: [u8; 16] = suffix
        .get(8..RECORD_SUFFIX_LEN)
        .and_then(|b| b.try_into().ok())
        .filter(|_| suffix.len() == RECORD_SUFFIX_LEN)
        .ok_or_else(|| StoreError::CorruptKey(format!("record suffix of {} bytes", suffix.len())))?;
    Ok(RecordId::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(hash: &str) -> RecordKey {
        RecordKey {
            subscription_id: "sub".into(),
            meter_id: "meter".into(),
            period_id: 7,
            unique_hash: hash.into(),
        }
    }

    #[test]
    fn timestamp_encoding_preserves_order_across_epoch() {
        let before = Utc.with_ymd_and_hms(1960, 1, 1, 0, 0, 0).unwrap();
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(encode_timestamp(before) < encode_timestamp(epoch));
        assert!(encode_timestamp(epoch) < encode_timestamp(after));
    }

    #[test]
    fn scope_prefixes_do_not_alias() {
        let a = scope_prefix(&Scope::new("ab", "c"));
        let b = scope_prefix(&Scope::new("a", "bc"));
        assert_ne!(a, b);
        assert!(!a.starts_with(&b) && !b.starts_with(&a));
    }

    #[test]
    fn record_key_format() {
        let scope = Scope::new("t", "e");
        let id = RecordId::generate();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let k = record_key(&scope, at, &id);
        let prefix = scope_prefix(&scope);
        assert_eq!(k.len(), prefix.len() + RECORD_SUFFIX_LEN);
        assert_eq!(record_id_from_suffix(trailing_suffix(&k).unwrap()).unwrap(), id);
    }

    #[test]
    fn after_bound_sits_between_neighbours() {
        let scope = Scope::new("t", "e");
        let prefix = scope_prefix(&scope);
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let id = RecordId::generate();
        let current = record_key(&scope, at, &id);
        let later = at + chrono::Duration::microseconds(1);
        let next = record_key(&scope, later, &RecordId::generate());
        let bound = after_bound(&prefix, at, &id);
        assert!(current < bound && bound < next);
    }

    #[test]
    fn dedup_keys_differ_per_component() {
        let scope = Scope::new("t", "e");
        assert_eq!(dedup_key(&scope, &key("h")), dedup_key(&scope, &key("h")));
        assert_ne!(dedup_key(&scope, &key("h")), dedup_key(&scope, &key("h2")));
        let mut other_period = key("h");
        other_period.period_id = 8;
        assert_ne!(dedup_key(&scope, &key("h")), dedup_key(&scope, &other_period));
        assert_ne!(
            dedup_key(&scope, &key("h")),
            dedup_key(&Scope::new("t", "other"), &key("h"))
        );
    }

    #[test]
    fn short_keys_are_reported_as_corrupt() {
        assert!(matches!(trailing_suffix(&[1, 2, 3]), Err(StoreError::CorruptKey(_))));
        assert!(matches!(record_id_from_suffix(&[0; 5]), Err(StoreError::CorruptKey(_))));
    }
}
