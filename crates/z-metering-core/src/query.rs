//! Query parameter and result types for analytics and export.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bucket::{AggregationPolicy, BucketPoint, BucketWindow, Granularity};
use crate::{PropertyValue, RecordId, UsageRecord};

/// Parameters of a detailed analytics query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAnalyticsParams {
    /// Restrict to one customer.
    #[serde(default)]
    pub external_customer_id: Option<String>,
    /// Restrict to these subscriptions (empty = all).
    #[serde(default)]
    pub subscription_ids: Vec<String>,
    /// Restrict to these meters (empty = all).
    #[serde(default)]
    pub meter_ids: Vec<String>,
    /// Restrict to these features (empty = all).
    #[serde(default)]
    pub feature_ids: Vec<String>,
    /// Restrict to these sources (empty = all).
    #[serde(default)]
    pub sources: Vec<String>,
    /// Property key to accepted values; a record must match every key.
    #[serde(default)]
    pub property_filters: BTreeMap<String, Vec<PropertyValue>>,
    /// Inclusive start of the range.
    pub start_time: DateTime<Utc>,
    /// Exclusive end of the range.
    pub end_time: DateTime<Utc>,
    /// Bucket size of the returned series.
    pub granularity: Granularity,
    /// Property keys to group by, in output order.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Offset east of UTC, in seconds, in which buckets are aligned.
    /// Defaults to the configured offset.
    #[serde(default)]
    pub utc_offset_secs: Option<i32>,
}

impl UsageAnalyticsParams {
    /// Parameters covering every record in `[start_time, end_time)`.
    #[must_use]
    pub fn new(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        granularity: Granularity,
    ) -> Self {
        Self {
            external_customer_id: None,
            subscription_ids: Vec::new(),
            meter_ids: Vec::new(),
            feature_ids: Vec::new(),
            sources: Vec::new(),
            property_filters: BTreeMap::new(),
            start_time,
            end_time,
            granularity,
            group_by: Vec::new(),
            utc_offset_secs: None,
        }
    }

    /// Group results by a property key.
    #[must_use]
    pub fn group_by(mut self, key: impl Into<String>) -> Self {
        self.group_by.push(key.into());
        self
    }

    /// Restrict to one subscription.
    #[must_use]
    pub fn for_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_ids.push(subscription_id.into());
        self
    }

    /// Restrict to one feature.
    #[must_use]
    pub fn for_feature(mut self, feature_id: impl Into<String>) -> Self {
        self.feature_ids.push(feature_id.into());
        self
    }

    /// Accept only records whose property `key` is one of `values`.
    #[must_use]
    pub fn with_property_filter(
        mut self,
        key: impl Into<String>,
        values: Vec<PropertyValue>,
    ) -> Self {
        self.property_filters.insert(key.into(), values);
        self
    }

    /// Whether `record` passes every filter except the time range.
    #[must_use]
    pub fn matches(&self, record: &UsageRecord) -> bool {
        fn allowed(filter: &[String], value: &str) -> bool {
            filter.is_empty() || filter.iter().any(|f| f == value)
        }

        if let Some(customer) = &self.external_customer_id {
            if &record.external_customer_id != customer {
                return false;
            }
        }

        allowed(&self.subscription_ids, &record.subscription_id)
            && allowed(&self.meter_ids, &record.meter_id)
            && allowed(&self.feature_ids, &record.feature_id)
            && (self.sources.is_empty()
                || record
                    .source
                    .as_deref()
                    .is_some_and(|s| allowed(&self.sources, s)))
            && self.property_filters.iter().all(|(key, values)| {
                record
                    .properties
                    .get(key)
                    .is_some_and(|v| values.contains(v))
            })
    }
}

/// Bucket-aggregation override for a gauge-style feature.
///
/// Presence of a feature in the override map switches it to `Max`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxBucketFeature {
    /// When finer than the query granularity, each bucket reports the sum of
    /// the peaks of its `bucket_size` sub-windows instead of a single peak.
    #[serde(default)]
    pub bucket_size: Option<Granularity>,
}

/// Map from feature identifier to its max-bucket override.
pub type MaxBucketFeatures = BTreeMap<String, MaxBucketFeature>;

/// Composite group key: requested dimensions with the record's value, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey(pub Vec<(String, Option<PropertyValue>)>);

impl GroupKey {
    /// The singleton group used when no dimensions are requested.
    #[must_use]
    pub const fn all() -> Self {
        Self(Vec::new())
    }

    /// Build the key of `record` for `dimensions`.
    #[must_use]
    pub fn of(record: &UsageRecord, dimensions: &[String]) -> Self {
        Self(
            dimensions
                .iter()
                .map(|d| (d.clone(), record.properties.get(d).cloned()))
                .collect(),
        )
    }

    /// Value of one dimension.
    #[must_use]
    pub fn get(&self, dimension: &str) -> Option<&PropertyValue> {
        self.0
            .iter()
            .find(|(d, _)| d == dimension)
            .and_then(|(_, v)| v.as_ref())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("*");
        }
        for (i, (dimension, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            match value {
                Some(v) => write!(f, "{dimension}={v}")?,
                None => write!(f, "{dimension}=∅")?,
            }
        }
        Ok(())
    }
}

/// One bucketed series: a (group, feature) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedUsageAnalytic {
    /// Group the series belongs to.
    pub group: GroupKey,
    /// Feature the series measures.
    pub feature_id: String,
    /// Meters that contributed records.
    pub meter_ids: BTreeSet<String>,
    /// Policy used to reduce each bucket.
    pub policy: AggregationPolicy,
    /// Value over the whole range.
    pub total: Option<Decimal>,
    /// Records that contributed.
    pub event_count: u64,
    /// One point per bucket, in time order.
    pub points: Vec<BucketPoint>,
}

/// Flattened analytics row: one per (group, feature, bucket).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyticRow<'a> {
    /// Group of the row.
    pub group: &'a GroupKey,
    /// Feature of the row.
    pub feature_id: &'a str,
    /// Bucket window.
    pub window: BucketWindow,
    /// Reduced value, `None` for an empty `Max` bucket.
    pub value: Option<Decimal>,
}

/// Result of a detailed analytics query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageAnalytics {
    /// Series ordered by group, then feature.
    pub series: Vec<DetailedUsageAnalytic>,
}

impl UsageAnalytics {
    /// Iterate one row per (group, feature, bucket) in output order.
    pub fn rows(&self) -> impl Iterator<Item = AnalyticRow<'_>> {
        self.series.iter().flat_map(|s| {
            s.points.iter().map(move |p| AnalyticRow {
                group: &s.group,
                feature_id: &s.feature_id,
                window: p.window,
                value: p.value,
            })
        })
    }

    /// Find the series of a feature within a group.
    #[must_use]
    pub fn find(&self, group: &GroupKey, feature_id: &str) -> Option<&DetailedUsageAnalytic> {
        self.series
            .iter()
            .find(|s| &s.group == group && s.feature_id == feature_id)
    }
}

/// Totals of one feature over a range, without sub-bucketing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageByFeatureResult {
    /// Feature identifier.
    pub feature_id: String,
    /// Meters that contributed records.
    pub meter_ids: BTreeSet<String>,
    /// Sum of all quantities.
    pub sum_total: Decimal,
    /// Largest single quantity.
    pub max_total: Decimal,
    /// Number of records.
    pub event_count: u64,
    /// Quantity of the last record in (timestamp, id) order.
    pub latest_quantity: Decimal,
    /// Timestamp of the first record.
    pub first_event_at: DateTime<Utc>,
    /// Timestamp of the last record.
    pub last_event_at: DateTime<Utc>,
}

/// Parameters for listing stored records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecordsParams {
    /// Restrict to one subscription.
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Restrict to one customer.
    #[serde(default)]
    pub external_customer_id: Option<String>,
    /// Restrict to one meter.
    #[serde(default)]
    pub meter_id: Option<String>,
    /// Restrict to one feature.
    #[serde(default)]
    pub feature_id: Option<String>,
    /// Inclusive start of the range.
    pub start_time: DateTime<Utc>,
    /// Exclusive end of the range.
    pub end_time: DateTime<Utc>,
    /// Maximum records returned.
    pub limit: usize,
    /// Matching records skipped before the first returned one.
    #[serde(default)]
    pub offset: usize,
    /// Also count every matching record.
    #[serde(default)]
    pub count_total: bool,
}

/// Keyset position in the export order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExportCursor {
    /// Event timestamp of the last exported record.
    pub event_timestamp: DateTime<Utc>,
    /// Identifier of the last exported record.
    pub id: RecordId,
}

impl ExportCursor {
    /// Cursor positioned just after `record`.
    #[must_use]
    pub fn after(record: &UsageRecord) -> Self {
        Self {
            event_timestamp: record.event_timestamp,
            id: record.id,
        }
    }
}

/// A page of keyset export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportPage {
    /// Records in (timestamp, id) order.
    pub records: Vec<UsageRecord>,
    /// Cursor for the following page; `None` once exhausted.
    pub next_cursor: Option<ExportCursor>,
}
