//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! Inserts run in pessimistic transactions: the uniqueness index entry is read
//! with `get_for_update`, which locks the key until commit, so concurrent
//! writers of one key serialize and the later one observes the earlier one.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, MultiThreaded, Options,
    TransactionDB, TransactionDBOptions,
};

use z_metering_core::{RecordKey, Scope, UsageRecord};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{InsertStatus, ScanRange, Store};

/// Default time a writer waits for a contended key lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: i64 = 1_000;

/// Tuning options for [`RocksStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// How long a transaction waits for a key lock before failing, in ms.
    pub lock_timeout_ms: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<TransactionDB<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open or create a database with explicit options.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open_with<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(options.lock_timeout_ms);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db =
            TransactionDB::open_cf_descriptors(&opts, &txn_opts, path.as_ref(), cf_descriptors)?;
        tracing::debug!(path = %path.as_ref().display(), "Opened usage store");

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Iterate keys of `cf_name` in `[lower, upper)`, feeding each entry to `f`.
    fn for_each_in(
        &self,
        cf_name: &str,
        lower: &[u8],
        upper: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<ControlFlow<()>>,
    ) -> Result<()> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(lower, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if key.as_ref() >= upper {
                break;
            }
            if f(&key, &value)?.is_break() {
                break;
            }
        }

        Ok(())
    }

    /// Compute `[lower, upper)` for a scan under `prefix`.
    fn bounds(prefix: &[u8], range: &ScanRange<'_>) -> (Vec<u8>, Vec<u8>) {
        let start = keys::time_bound(prefix, range.start);
        let lower = match range.after {
            Some(cursor) if cursor.event_timestamp >= range.start => {
                keys::after_bound(prefix, cursor.event_timestamp, &cursor.id)
            }
            _ => start,
        };
        (lower, keys::time_bound(prefix, range.end))
    }
}

impl Store for RocksStore {
    fn insert_record(&self, record: &UsageRecord) -> Result<InsertStatus> {
        let cf_records = self.cf(cf::USAGE_RECORDS)?;
        let cf_dedup = self.cf(cf::USAGE_DEDUP)?;
        let cf_by_sub = self.cf(cf::USAGE_BY_SUBSCRIPTION)?;

        let scope = &record.scope;
        let dedup_key = keys::dedup_key(scope, &record.key());
        let record_key = keys::record_key(scope, record.event_timestamp, &record.id);
        let index_key = keys::subscription_index_key(
            scope,
            &record.subscription_id,
            record.event_timestamp,
            &record.id,
        );
        let suffix = keys::record_suffix(record.event_timestamp, &record.id);
        let value = Self::serialize(record)?;

        let txn = self.db.transaction();

        // Locks the key until commit or rollback
        if let Some(existing) = txn.get_for_update_cf(&cf_dedup, &dedup_key, true)? {
            txn.rollback()?;
            let existing = keys::record_id_from_suffix(&existing)?;
            tracing::debug!(
                scope = %scope,
                key = %record.key(),
                existing = %existing,
                "Usage record already stored"
            );
            return Ok(InsertStatus::Duplicate { existing });
        }

        txn.put_cf(&cf_records, &record_key, &value)?;
        txn.put_cf(&cf_by_sub, &index_key, b"")?;
        txn.put_cf(&cf_dedup, &dedup_key, suffix)?;
        txn.commit()?;

        Ok(InsertStatus::Inserted)
    }

    fn contains_key(&self, scope: &Scope, key: &RecordKey) -> Result<bool> {
        let cf = self.cf(cf::USAGE_DEDUP)?;
        let exists = self.db.get_cf(&cf, keys::dedup_key(scope, key))?.is_some();
        Ok(exists)
    }

    fn find_by_key(&self, scope: &Scope, key: &RecordKey) -> Result<Option<UsageRecord>> {
        let cf_dedup = self.cf(cf::USAGE_DEDUP)?;
        let cf_records = self.cf(cf::USAGE_RECORDS)?;

        let Some(suffix) = self.db.get_cf(&cf_dedup, keys::dedup_key(scope, key))? else {
            return Ok(None);
        };

        let mut record_key = keys::scope_prefix(scope);
        record_key.extend_from_slice(&suffix);

        self.db
            .get_cf(&cf_records, record_key)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn scan(
        &self,
        range: &ScanRange<'_>,
        visit: &mut dyn FnMut(UsageRecord) -> ControlFlow<()>,
    ) -> Result<()> {
        if range.end <= range.start {
            return Ok(());
        }

        let Some(subscription_id) = range.subscription_id else {
            let prefix = keys::scope_prefix(range.scope);
            let (lower, upper) = Self::bounds(&prefix, range);
            return self.for_each_in(cf::USAGE_RECORDS, &lower, &upper, &mut |_, value| {
                Ok(visit(Self::deserialize(value)?))
            });
        };

        // Resolve index entries against the primary column family
        let cf_records = self.cf(cf::USAGE_RECORDS)?;
        let scope_prefix = keys::scope_prefix(range.scope);
        let prefix = keys::subscription_prefix(range.scope, subscription_id);
        let (lower, upper) = Self::bounds(&prefix, range);

        self.for_each_in(cf::USAGE_BY_SUBSCRIPTION, &lower, &upper, &mut |key, _| {
            let mut record_key = scope_prefix.clone();
            record_key.extend_from_slice(keys::trailing_suffix(key)?);

            let data = self.db.get_cf(&cf_records, &record_key)?.ok_or_else(|| {
                StoreError::CorruptKey(format!(
                    "subscription index entry without record ({subscription_id})"
                ))
            })?;
            Ok(visit(Self::deserialize(&data)?))
        })
    }
}
