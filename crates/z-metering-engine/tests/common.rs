//! Common test utilities for z-metering integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use z_metering_core::{NewUsageRecord, Scope};
use z_metering_engine::{init_tracing, MeteringConfig, MeteringCore};

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The metering core under test.
    pub core: MeteringCore,
    /// Scope used by the test.
    pub scope: Scope,
    /// Temporary directory for the database (kept alive for test duration).
    pub _temp_dir: TempDir,
}

impl TestHarness {
    /// Create a new test harness with a fresh database.
    pub fn new() -> Self {
        Self::with_config(MeteringConfig::default().with_groupable_properties(["region", "tier"]))
    }

    /// Create a harness with custom configuration.
    pub fn with_config(config: MeteringConfig) -> Self {
        let _ = init_tracing();

        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = config.with_data_dir(temp_dir.path().to_string_lossy());
        let core = MeteringCore::open(config).expect("Failed to open metering core");

        Self {
            core,
            scope: Scope::new("tenant_1", "production"),
            _temp_dir: temp_dir,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// A fresh, never-cancelled token.
pub fn token() -> CancellationToken {
    CancellationToken::new()
}

/// 2024-01-01 at `hour:minute` UTC.
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
}

/// `days` after 2024-01-01 00:00 UTC.
pub fn day(days: i64) -> DateTime<Utc> {
    at(0, 0) + Duration::days(days)
}

/// A record of `sub1`/`meterX`/period 1 for feature `api_calls`.
pub fn usage(hash: &str, ts: DateTime<Utc>, quantity: i64) -> NewUsageRecord {
    NewUsageRecord::new(
        "sub1",
        "meterX",
        "cust1",
        "api_calls",
        1,
        ts,
        Decimal::from(quantity),
        hash,
    )
}

/// A record for an arbitrary subscription, meter and feature.
pub fn usage_for(
    subscription_id: &str,
    meter_id: &str,
    feature_id: &str,
    hash: &str,
    ts: DateTime<Utc>,
    quantity: i64,
) -> NewUsageRecord {
    NewUsageRecord::new(
        subscription_id,
        meter_id,
        "cust1",
        feature_id,
        1,
        ts,
        Decimal::from(quantity),
        hash,
    )
}
