//! Usage metering engine.
//!
//! Ties the storage layer to the three services of the metering core:
//!
//! - [`IngestionGate`]: idempotent single and batch ingestion
//! - [`AnalyticsEngine`]: bucketed analytics and per-feature totals
//! - [`ExportPager`]: paged export in a stable total order
//!
//! Every operation is scoped to one tenant environment, runs its storage
//! work on blocking threads, and stops early when its cancellation token
//! fires or the configured deadline passes.
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use rust_decimal::Decimal;
//! use tokio_util::sync::CancellationToken;
//! use z_metering_core::{NewUsageRecord, Scope};
//! use z_metering_engine::{MeteringConfig, MeteringCore};
//!
//! # async fn run() -> z_metering_core::Result<()> {
//! let core = MeteringCore::open(MeteringConfig::from_env())?;
//! let scope = Scope::new("tenant", "production");
//! let record = NewUsageRecord::new(
//!     "sub_1", "meter_api", "cust_1", "api_calls", 1, Utc::now(), Decimal::ONE, "evt_1",
//! );
//!
//! core.ingestion()
//!     .insert_one(&scope, record, &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod analytics;
pub mod config;
pub mod export;
pub mod ingest;
mod runtime;
pub mod telemetry;

use std::sync::Arc;

use z_metering_core::Result;
use z_metering_store::{RocksStore, Store, StoreOptions};

pub use analytics::{AnalyticsEngine, ProcessedRecords};
pub use config::MeteringConfig;
pub use export::ExportPager;
pub use ingest::{BatchResult, IngestionGate, InsertOutcome, RecordOutcome, RecordStatus};
pub use telemetry::init_tracing;

/// The metering core: one store shared by the three services.
#[derive(Clone)]
pub struct MeteringCore {
    ingestion: IngestionGate,
    analytics: AnalyticsEngine,
    export: ExportPager,
}

impl MeteringCore {
    /// Open the `RocksDB` store at `config.data_dir`.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Configuration` if the configuration is invalid
    /// and `MeterError::StoreUnavailable` if the store cannot be opened.
    pub fn open(config: MeteringConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(path = %config.data_dir, "Opening usage store");

        let options = StoreOptions {
            lock_timeout_ms: config.lock_timeout_ms,
        };
        let store = RocksStore::open_with(&config.data_dir, options)
            .map_err(|e| runtime::store_unavailable(&e, 0, None))?;

        Self::with_store(Arc::new(store), config)
    }

    /// Build the core over an already opened store.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Configuration` if the configuration is invalid.
    pub fn with_store(store: Arc<dyn Store>, config: MeteringConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            max_batch_size = config.max_batch_size,
            ingest_parallelism = config.ingest_parallelism,
            bucket_utc_offset = %config.bucket_utc_offset,
            "Metering core configured"
        );

        let config = Arc::new(config);
        Ok(Self {
            ingestion: IngestionGate::new(Arc::clone(&store), Arc::clone(&config)),
            analytics: AnalyticsEngine::new(Arc::clone(&store), Arc::clone(&config)),
            export: ExportPager::new(store, config),
        })
    }

    /// The ingestion gate.
    #[must_use]
    pub const fn ingestion(&self) -> &IngestionGate {
        &self.ingestion
    }

    /// The analytics engine.
    #[must_use]
    pub const fn analytics(&self) -> &AnalyticsEngine {
        &self.analytics
    }

    /// The export pager.
    #[must_use]
    pub const fn export(&self) -> &ExportPager {
        &self.export
    }
}
