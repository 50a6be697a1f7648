//! Column family layout.
//!
//! This module defines the column families used in `RocksDB` storage. Every key
//! starts with the length-prefixed scope so that tenants and environments never
//! share a key range.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Usage records, keyed by `scope || event_timestamp || record_id`.
    ///
    /// Iteration order is the stable export order.
    pub const USAGE_RECORDS: &str = "usage_records";

    /// Uniqueness index, keyed by `scope || subscription || meter || period || hash`.
    /// Value is the `event_timestamp || record_id` suffix of the record key.
    pub const USAGE_DEDUP: &str = "usage_dedup";

    /// Index: records by subscription, keyed by
    /// `scope || subscription || event_timestamp || record_id`.
    /// Value is empty (index only).
    pub const USAGE_BY_SUBSCRIPTION: &str = "usage_by_subscription";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::USAGE_RECORDS, cf::USAGE_DEDUP, cf::USAGE_BY_SUBSCRIPTION]
}
