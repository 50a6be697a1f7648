//! Export pager.
//!
//! Pages through every stored record of a time range in the stable
//! `(event_timestamp, id)` order. Offset paging is exact only while no record
//! is ingested behind the current position; [`ExportPager::export_after`]
//! resumes from a keyset cursor instead and is unaffected by such writes.

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use z_metering_core::{ExportCursor, ExportPage, MeterError, Result, Scope, TimeRange, UsageRecord};
use z_metering_store::{ScanRange, Store};

use crate::config::MeteringConfig;
use crate::runtime::{run_blocking, scan_cancellable, Deadline};

/// Pages stored records out for downstream billing.
#[derive(Clone)]
pub struct ExportPager {
    store: Arc<dyn Store>,
    config: Arc<MeteringConfig>,
}

impl ExportPager {
    /// Create a pager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: Arc<MeteringConfig>) -> Self {
        Self { store, config }
    }

    fn check_batch_size(&self, batch_size: usize) -> Result<()> {
        if batch_size == 0 || batch_size > self.config.max_export_batch_size {
            return Err(MeterError::query(
                format!("batch size must be in 1..={}", self.config.max_export_batch_size),
                batch_size,
            ));
        }
        Ok(())
    }

    /// Read records `offset..offset + batch_size` of the range.
    ///
    /// A page shorter than `batch_size` means the range is exhausted.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Query` for an empty range or a batch size outside
    /// `1..=max_export_batch_size`, plus the cancellation and store errors of
    /// every read.
    pub async fn get_feature_usage_for_export(
        &self,
        scope: &Scope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        batch_size: usize,
        offset: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<UsageRecord>> {
        scope.validate()?;
        let range = TimeRange::new(start, end)?;
        self.check_batch_size(batch_size)?;

        let records = self
            .read_page(scope, range, batch_size, offset, None, cancel)
            .await?;

        tracing::debug!(
            scope = %scope,
            offset,
            batch_size,
            returned = records.len(),
            "Export page read"
        );
        Ok(records)
    }

    /// Read up to `batch_size` records strictly after `after`.
    ///
    /// `next_cursor` is set while a full page was returned; pass it back to
    /// continue.
    ///
    /// # Errors
    ///
    /// Same as [`ExportPager::get_feature_usage_for_export`].
    pub async fn export_after(
        &self,
        scope: &Scope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        batch_size: usize,
        after: Option<ExportCursor>,
        cancel: &CancellationToken,
    ) -> Result<ExportPage> {
        scope.validate()?;
        let range = TimeRange::new(start, end)?;
        self.check_batch_size(batch_size)?;

        let records = self
            .read_page(scope, range, batch_size, 0, after, cancel)
            .await?;
        let next_cursor = records
            .last()
            .filter(|_| records.len() == batch_size)
            .map(ExportCursor::after);

        tracing::debug!(
            scope = %scope,
            after = ?after,
            returned = records.len(),
            "Export page read"
        );
        Ok(ExportPage {
            records,
            next_cursor,
        })
    }

    async fn read_page(
        &self,
        scope: &Scope,
        range: TimeRange,
        batch_size: usize,
        offset: usize,
        after: Option<ExportCursor>,
        cancel: &CancellationToken,
    ) -> Result<Vec<UsageRecord>> {
        let deadline = Deadline::new(cancel, self.config.operation_timeout);
        let token = deadline.token().clone();
        let store = Arc::clone(&self.store);
        let scope = scope.clone();

        run_blocking(move || {
            let mut records = Vec::with_capacity(batch_size.min(1024));
            let mut skipped = 0;
            let scan = ScanRange::new(&scope, range.start(), range.end()).after(after);

            scan_cancellable(store.as_ref(), &scan, &token, |record| {
                if skipped < offset {
                    skipped += 1;
                    return ControlFlow::Continue(());
                }
                records.push(record);
                if records.len() < batch_size {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            })?;

            Ok(records)
        })
        .await
    }
}
