//! Engine configuration.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use z_metering_core::{MeterError, Result};

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MeteringConfig {
    /// Path to `RocksDB` data directory (default: "/data/z-metering").
    pub data_dir: String,

    /// Offset in which bucket boundaries are aligned (default: UTC).
    pub bucket_utc_offset: FixedOffset,

    /// Property keys that analytics may group by.
    pub groupable_properties: BTreeSet<String>,

    /// Largest accepted ingestion batch.
    pub max_batch_size: usize,

    /// Records written per blocking task during batch ingestion.
    pub ingest_chunk_size: usize,

    /// Chunks written concurrently during batch ingestion.
    pub ingest_parallelism: usize,

    /// Largest accepted export page.
    pub max_export_batch_size: usize,

    /// Largest number of buckets one analytics query may produce.
    pub max_buckets: usize,

    /// Deadline applied to every operation; `None` disables it.
    pub operation_timeout: Option<Duration>,

    /// Reject records with a negative quantity.
    pub reject_negative_quantity: bool,

    /// How long a writer waits for a contended dedup key, in ms.
    pub lock_timeout_ms: i64,
}

impl MeteringConfig {
    /// Load configuration from `METER_*` environment variables.
    ///
    /// Unset or unparseable variables fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bucket_utc_offset = parsed::<i32>(&var, "METER_BUCKET_UTC_OFFSET_SECS")
            .and_then(|secs| {
                let offset = FixedOffset::east_opt(secs);
                if offset.is_none() {
                    tracing::warn!(secs, "Bucket offset out of range, using UTC");
                }
                offset
            })
            .unwrap_or(defaults.bucket_utc_offset);

        let groupable_properties = var("METER_GROUPABLE_PROPERTIES").map_or(
            defaults.groupable_properties,
            |list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            },
        );

        let operation_timeout = parsed::<u64>(&var, "METER_OPERATION_TIMEOUT_MS").map_or(
            defaults.operation_timeout,
            |ms| (ms > 0).then(|| Duration::from_millis(ms)),
        );

        Self {
            data_dir: var("METER_DATA_DIR").unwrap_or(defaults.data_dir),
            bucket_utc_offset,
            groupable_properties,
            max_batch_size: parsed(&var, "METER_MAX_BATCH_SIZE")
                .unwrap_or(defaults.max_batch_size),
            ingest_chunk_size: parsed(&var, "METER_INGEST_CHUNK_SIZE")
                .unwrap_or(defaults.ingest_chunk_size),
            ingest_parallelism: parsed(&var, "METER_INGEST_PARALLELISM")
                .unwrap_or(defaults.ingest_parallelism),
            max_export_batch_size: parsed(&var, "METER_MAX_EXPORT_BATCH_SIZE")
                .unwrap_or(defaults.max_export_batch_size),
            max_buckets: parsed(&var, "METER_MAX_BUCKETS").unwrap_or(defaults.max_buckets),
            operation_timeout,
            reject_negative_quantity: parsed(&var, "METER_REJECT_NEGATIVE_QUANTITY")
                .unwrap_or(defaults.reject_negative_quantity),
            lock_timeout_ms: parsed(&var, "METER_LOCK_TIMEOUT_MS")
                .unwrap_or(defaults.lock_timeout_ms),
        }
    }

    /// Check that every size and limit is usable.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Configuration` naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("max_batch_size", self.max_batch_size),
            ("ingest_chunk_size", self.ingest_chunk_size),
            ("ingest_parallelism", self.ingest_parallelism),
            ("max_export_batch_size", self.max_export_batch_size),
            ("max_buckets", self.max_buckets),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(MeterError::Configuration(format!("{name} must be positive")));
        }
        if self.lock_timeout_ms <= 0 {
            return Err(MeterError::Configuration(
                "lock_timeout_ms must be positive".into(),
            ));
        }
        if self.operation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(MeterError::Configuration(
                "operation_timeout must be positive when set".into(),
            ));
        }
        Ok(())
    }

    /// Set the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Set the bucket alignment offset.
    #[must_use]
    pub fn with_bucket_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.bucket_utc_offset = offset;
        self
    }

    /// Set the property keys analytics may group by.
    #[must_use]
    pub fn with_groupable_properties<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groupable_properties = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the largest accepted ingestion batch.
    #[must_use]
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set chunk size and parallelism of batch ingestion.
    #[must_use]
    pub fn with_ingest_chunks(mut self, chunk_size: usize, parallelism: usize) -> Self {
        self.ingest_chunk_size = chunk_size;
        self.ingest_parallelism = parallelism;
        self
    }

    /// Set the largest accepted export page.
    #[must_use]
    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size;
        self
    }

    /// Set the bucket ceiling of analytics queries.
    #[must_use]
    pub fn with_max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    /// Set or disable the per-operation deadline.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Reject or accept negative quantities.
    #[must_use]
    pub fn with_reject_negative_quantity(mut self, reject: bool) -> Self {
        self.reject_negative_quantity = reject;
        self
    }
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/z-metering".into(),
            bucket_utc_offset: Utc.fix(),
            groupable_properties: BTreeSet::new(),
            max_batch_size: 1_000,
            ingest_chunk_size: 100,
            ingest_parallelism: 4,
            max_export_batch_size: 10_000,
            max_buckets: 5_000,
            operation_timeout: Some(Duration::from_secs(30)),
            reject_negative_quantity: false,
            lock_timeout_ms: 1_000,
        }
    }
}

/// Read and parse one variable, warning about unparseable values.
fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = var(name)?;
    let value = raw.trim().parse().ok();
    if value.is_none() {
        tracing::warn!(var = name, value = %raw, "Ignoring unparseable setting");
    }
    value
}
