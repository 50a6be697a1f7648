//! Core types and the bucketing engine for z-metering.
//!
//! This crate provides the foundational types used throughout the metering core:
//!
//! - **Records**: `NewUsageRecord`, `UsageRecord`, `RecordKey`, `Scope`
//! - **Identifiers**: `RecordId`
//! - **Bucketing**: `Granularity`, `AggregationPolicy`, `TimeRange`, `BucketSeries`
//! - **Queries**: `UsageAnalyticsParams`, `UsageAnalytics`, `UsageByFeatureResult`
//!
//! # Deduplication
//!
//! `(subscription_id, meter_id, period_id, unique_hash)` identifies a usage fact
//! within a scope. Re-delivery of the same fact is an expected outcome, not an
//! error, so no error variant exists for it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bucket;
pub mod error;
pub mod ids;
pub mod query;
pub mod record;

pub use bucket::{
    add_quantities, bucket_windows, AggregationPolicy, BucketPoint, BucketSeries, BucketWindow,
    Granularity, TimeRange,
};
pub use error::{MeterError, Result, ValidationError};
pub use ids::{IdError, RecordId};
pub use query::{
    AnalyticRow, DetailedUsageAnalytic, ExportCursor, ExportPage, GroupKey, MaxBucketFeature,
    MaxBucketFeatures, ProcessedRecordsParams, UsageAnalytics, UsageAnalyticsParams,
    UsageByFeatureResult,
};
pub use record::{NewUsageRecord, PropertyValue, Properties, RecordKey, Scope, UsageRecord};
