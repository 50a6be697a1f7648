//! `RocksDB` storage layer for z-metering.
//!
//! This crate provides persistent storage for usage records using `RocksDB`
//! transactions for the uniqueness constraint and column families for
//! ordered scans.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `usage_records`: Records ordered by scope, event time and record ID
//! - `usage_dedup`: Uniqueness index on `(subscription, meter, period, hash)`
//! - `usage_by_subscription`: Index for scanning one subscription's records
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use rust_decimal::Decimal;
//! use z_metering_core::{NewUsageRecord, Scope, UsageRecord};
//! use z_metering_store::{RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/z-metering-db").unwrap();
//!
//! let scope = Scope::new("tenant", "production");
//! let new = NewUsageRecord::new(
//!     "sub_1", "meter_api", "cust_1", "api_calls", 1, Utc::now(), Decimal::ONE, "evt_1",
//! );
//! let record = UsageRecord::ingest(scope, new, Utc::now());
//! store.insert_record(&record).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;

use std::ops::ControlFlow;

use chrono::{DateTime, Utc};

pub use error::{Result, StoreError};
pub use rocks::{RocksStore, StoreOptions};

use z_metering_core::{ExportCursor, RecordId, RecordKey, Scope, UsageRecord};

/// Outcome of an insert against the uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// The record was stored.
    Inserted,
    /// A record with the same key already exists; nothing was written.
    Duplicate {
        /// Identifier of the record that holds the key.
        existing: RecordId,
    },
}

/// A range of records to scan, in `(event_timestamp, id)` order.
#[derive(Debug, Clone, Copy)]
pub struct ScanRange<'a> {
    /// Scope to read.
    pub scope: &'a Scope,
    /// Restrict to one subscription (uses the subscription index).
    pub subscription_id: Option<&'a str>,
    /// Inclusive lower bound on event time.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound on event time.
    pub end: DateTime<Utc>,
    /// Resume strictly after this position.
    pub after: Option<ExportCursor>,
}

impl<'a> ScanRange<'a> {
    /// Scan every record of `scope` with event time in `[start, end)`.
    #[must_use]
    pub const fn new(scope: &'a Scope, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            scope,
            subscription_id: None,
            start,
            end,
            after: None,
        }
    }

    /// Restrict to one subscription.
    #[must_use]
    pub fn subscription(mut self, subscription_id: &'a str) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    /// Resume after a cursor.
    #[must_use]
    pub fn after(mut self, cursor: Option<ExportCursor>) -> Self {
        self.after = cursor;
        self
    }
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// behind the metering engine.
pub trait Store: Send + Sync {
    /// Insert a record unless its key is already taken.
    ///
    /// The lookup and the write happen atomically: of several concurrent
    /// inserts of one key exactly one returns `Inserted`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn insert_record(&self, record: &UsageRecord) -> Result<InsertStatus>;

    /// Check whether a record with `key` exists in `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn contains_key(&self, scope: &Scope, key: &RecordKey) -> Result<bool>;

    /// Get the record holding `key` in `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_by_key(&self, scope: &Scope, key: &RecordKey) -> Result<Option<UsageRecord>>;

    /// Visit records of a range in `(event_timestamp, id)` order until the
    /// visitor breaks or the range is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn scan(
        &self,
        range: &ScanRange<'_>,
        visit: &mut dyn FnMut(UsageRecord) -> ControlFlow<()>,
    ) -> Result<()>;
}
