//! Analytics engine.
//!
//! Streams stored records through per-series bucket reducers. Memory grows
//! with groups × features × buckets, never with the number of records.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use z_metering_core::{
    add_quantities, bucket_windows, AggregationPolicy, BucketSeries, BucketWindow,
    DetailedUsageAnalytic, Granularity, GroupKey, MaxBucketFeatures, MeterError,
    ProcessedRecordsParams, Result, Scope, TimeRange, UsageAnalytics, UsageAnalyticsParams,
    UsageByFeatureResult, UsageRecord,
};
use z_metering_store::{ScanRange, Store};

use crate::config::MeteringConfig;
use crate::runtime::{run_blocking, scan_cancellable, Deadline};

/// One series under construction.
struct SeriesAccumulator {
    series: BucketSeries,
    meter_ids: BTreeSet<String>,
}

/// Series keyed by (group, feature), in output order.
type SeriesMap = BTreeMap<(GroupKey, String), SeriesAccumulator>;

/// How each feature's buckets are reduced.
struct SeriesPlan {
    windows: Arc<[BucketWindow]>,
    offset: FixedOffset,
    granularity: Granularity,
    max_features: MaxBucketFeatures,
}

impl SeriesPlan {
    fn series_for(&self, feature_id: &str) -> BucketSeries {
        let windows = Arc::clone(&self.windows);
        match self.max_features.get(feature_id) {
            None => BucketSeries::new(windows, AggregationPolicy::Sum),
            Some(max) => match max.bucket_size {
                Some(sub) if sub < self.granularity => {
                    BucketSeries::bucketed_max(windows, sub, self.offset)
                }
                _ => BucketSeries::new(windows, AggregationPolicy::Max),
            },
        }
    }
}

/// Running totals of one feature.
struct FeatureTotals {
    meter_ids: BTreeSet<String>,
    sum_total: Decimal,
    max_total: Decimal,
    event_count: u64,
    latest_quantity: Decimal,
    first_event_at: DateTime<Utc>,
    last_event_at: DateTime<Utc>,
}

impl FeatureTotals {
    fn start(record: &UsageRecord) -> Self {
        Self {
            meter_ids: BTreeSet::new(),
            sum_total: Decimal::ZERO,
            max_total: record.quantity,
            event_count: 0,
            latest_quantity: record.quantity,
            first_event_at: record.event_timestamp,
            last_event_at: record.event_timestamp,
        }
    }

    // Records arrive in (timestamp, id) order, so the last one seen is latest.
    fn observe(&mut self, record: &UsageRecord) -> Result<()> {
        self.meter_ids.insert(record.meter_id.clone());
        self.sum_total = add_quantities(self.sum_total, record.quantity)?;
        self.max_total = self.max_total.max(record.quantity);
        self.event_count += 1;
        self.latest_quantity = record.quantity;
        self.last_event_at = record.event_timestamp;
        Ok(())
    }

    fn finish(self, feature_id: String) -> UsageByFeatureResult {
        UsageByFeatureResult {
            feature_id,
            meter_ids: self.meter_ids,
            sum_total: self.sum_total,
            max_total: self.max_total,
            event_count: self.event_count,
            latest_quantity: self.latest_quantity,
            first_event_at: self.first_event_at,
            last_event_at: self.last_event_at,
        }
    }
}

/// A page of stored records.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRecords {
    /// Matching records in (timestamp, id) order.
    pub records: Vec<UsageRecord>,
    /// Number of matching records in the range, when requested.
    pub total: Option<u64>,
}

/// Answers usage queries over stored records.
#[derive(Clone)]
pub struct AnalyticsEngine {
    store: Arc<dyn Store>,
    config: Arc<MeteringConfig>,
}

impl AnalyticsEngine {
    /// Create an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: Arc<MeteringConfig>) -> Self {
        Self { store, config }
    }

    fn check_group_by(&self, params: &UsageAnalyticsParams) -> Result<()> {
        let mut seen = BTreeSet::new();
        for key in &params.group_by {
            if !self.config.groupable_properties.contains(key) {
                return Err(MeterError::query(
                    format!("property {key:?} is not groupable"),
                    &params.group_by,
                ));
            }
            if !seen.insert(key) {
                return Err(MeterError::query(
                    format!("property {key:?} grouped twice"),
                    &params.group_by,
                ));
            }
        }
        Ok(())
    }

    fn offset_for(&self, params: &UsageAnalyticsParams) -> Result<FixedOffset> {
        params.utc_offset_secs.map_or(Ok(self.config.bucket_utc_offset), |secs| {
            FixedOffset::east_opt(secs)
                .ok_or_else(|| MeterError::query("utc offset out of range", secs))
        })
    }

    /// Bucketed usage per (group, feature) over a time range.
    ///
    /// Features listed in `max_bucket_features` are reduced with `Max`, all
    /// others with `Sum`. A series is returned for every (group, feature)
    /// with at least one matching record; its points cover every bucket.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Query` for an empty range, a non-groupable or
    /// repeated `group_by` key, an invalid offset, too many buckets, a range
    /// outside the supported calendar, or a bucket sum that overflows.
    /// Returns `MeterError::Cancelled` and `MeterError::StoreUnavailable` as
    /// the other operations do.
    pub async fn get_detailed_usage_analytics(
        &self,
        scope: &Scope,
        params: UsageAnalyticsParams,
        max_bucket_features: MaxBucketFeatures,
        cancel: &CancellationToken,
    ) -> Result<UsageAnalytics> {
        scope.validate()?;
        self.check_group_by(&params)?;
        let offset = self.offset_for(&params)?;
        let range = TimeRange::new(params.start_time, params.end_time)?;
        let windows = bucket_windows(&range, params.granularity, offset, self.config.max_buckets)?;
        let buckets = windows.len();

        let plan = SeriesPlan {
            windows: windows.into(),
            offset,
            granularity: params.granularity,
            max_features: max_bucket_features,
        };

        let deadline = Deadline::new(cancel, self.config.operation_timeout);
        let token = deadline.token().clone();
        let store = Arc::clone(&self.store);
        let scope_owned = scope.clone();

        let series = run_blocking(move || {
            let mut series = SeriesMap::new();
            let mut failure = None;
            let mut scan = ScanRange::new(&scope_owned, range.start(), range.end());
            if let [subscription_id] = params.subscription_ids.as_slice() {
                scan = scan.subscription(subscription_id);
            }

            scan_cancellable(store.as_ref(), &scan, &token, |record| {
                if !params.matches(&record) {
                    return ControlFlow::Continue(());
                }
                let group = GroupKey::of(&record, &params.group_by);
                let acc = series
                    .entry((group, record.feature_id.clone()))
                    .or_insert_with(|| SeriesAccumulator {
                        series: plan.series_for(&record.feature_id),
                        meter_ids: BTreeSet::new(),
                    });
                match acc.series.observe(record.event_timestamp, record.quantity) {
                    Ok(true) => {
                        acc.meter_ids.insert(record.meter_id);
                        ControlFlow::Continue(())
                    }
                    Ok(false) => ControlFlow::Continue(()),
                    Err(e) => {
                        failure = Some(e);
                        ControlFlow::Break(())
                    }
                }
            })?;

            failure.map_or(Ok(series), Err)
        })
        .await?;

        let analytics = UsageAnalytics {
            series: series
                .into_iter()
                .map(|((group, feature_id), acc)| -> Result<DetailedUsageAnalytic> {
                    Ok(DetailedUsageAnalytic {
                        group,
                        feature_id,
                        meter_ids: acc.meter_ids,
                        policy: acc.series.policy(),
                        total: acc.series.total()?,
                        event_count: acc.series.event_count(),
                        points: acc.series.points()?,
                    })
                })
                .collect::<Result<_>>()?,
        };

        tracing::debug!(
            scope = %scope,
            buckets,
            series = analytics.series.len(),
            "Detailed usage analytics computed"
        );
        Ok(analytics)
    }

    /// Per-feature totals of one subscription over a time range.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Query` for a blank subscription, an empty range or
    /// a feature sum that overflows, plus the cancellation and store errors of
    /// every read.
    pub async fn get_feature_usage_by_subscription(
        &self,
        scope: &Scope,
        subscription_id: &str,
        external_customer_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, UsageByFeatureResult>> {
        scope.validate()?;
        if subscription_id.trim().is_empty() {
            return Err(MeterError::query("subscription_id is required", subscription_id));
        }
        let range = TimeRange::new(start, end)?;

        let deadline = Deadline::new(cancel, self.config.operation_timeout);
        let token = deadline.token().clone();
        let store = Arc::clone(&self.store);
        let scope_owned = scope.clone();
        let subscription = subscription_id.to_string();
        let customer = external_customer_id.map(String::from);

        let totals = run_blocking(move || {
            let mut totals: BTreeMap<String, FeatureTotals> = BTreeMap::new();
            let mut failure = None;
            let scan = ScanRange::new(&scope_owned, range.start(), range.end())
                .subscription(&subscription);

            scan_cancellable(store.as_ref(), &scan, &token, |record| {
                if customer
                    .as_deref()
                    .is_some_and(|c| c != record.external_customer_id)
                {
                    return ControlFlow::Continue(());
                }
                let observed = totals
                    .entry(record.feature_id.clone())
                    .or_insert_with(|| FeatureTotals::start(&record))
                    .observe(&record);
                match observed {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        failure = Some(e);
                        ControlFlow::Break(())
                    }
                }
            })?;

            failure.map_or(Ok(totals), Err)
        })
        .await?;

        tracing::debug!(
            scope = %scope,
            subscription_id,
            features = totals.len(),
            "Feature usage computed"
        );

        Ok(totals
            .into_iter()
            .map(|(feature_id, t)| (feature_id.clone(), t.finish(feature_id)))
            .collect())
    }

    /// List stored records matching `params`, with optional total count.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Query` for an empty range or a `limit` outside
    /// `1..=max_export_batch_size`, plus the cancellation and store errors of
    /// every read.
    pub async fn get_processed_records(
        &self,
        scope: &Scope,
        params: ProcessedRecordsParams,
        cancel: &CancellationToken,
    ) -> Result<ProcessedRecords> {
        scope.validate()?;
        let range = TimeRange::new(params.start_time, params.end_time)?;
        if params.limit == 0 || params.limit > self.config.max_export_batch_size {
            return Err(MeterError::query(
                format!("limit must be in 1..={}", self.config.max_export_batch_size),
                params.limit,
            ));
        }

        let deadline = Deadline::new(cancel, self.config.operation_timeout);
        let token = deadline.token().clone();
        let store = Arc::clone(&self.store);
        let scope_owned = scope.clone();

        let page = run_blocking(move || {
            fn allowed(filter: Option<&str>, value: &str) -> bool {
                filter.map_or(true, |f| f == value)
            }

            let mut records = Vec::new();
            let mut matched: u64 = 0;
            let mut skipped = 0;
            let mut scan = ScanRange::new(&scope_owned, range.start(), range.end());
            if let Some(subscription_id) = &params.subscription_id {
                scan = scan.subscription(subscription_id);
            }

            scan_cancellable(store.as_ref(), &scan, &token, |record| {
                let wanted = allowed(
                    params.external_customer_id.as_deref(),
                    &record.external_customer_id,
                ) && allowed(params.meter_id.as_deref(), &record.meter_id)
                    && allowed(params.feature_id.as_deref(), &record.feature_id);
                if !wanted {
                    return ControlFlow::Continue(());
                }

                matched += 1;
                if skipped < params.offset {
                    skipped += 1;
                } else if records.len() < params.limit {
                    records.push(record);
                } else if !params.count_total {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            })?;

            Ok(ProcessedRecords {
                records,
                total: params.count_total.then_some(matched),
            })
        })
        .await?;

        tracing::debug!(
            scope = %scope,
            returned = page.records.len(),
            total = ?page.total,
            "Processed records listed"
        );
        Ok(page)
    }
}
