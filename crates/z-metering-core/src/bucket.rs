//! Bucketing engine.
//!
//! Pure computation that splits a half-open time range into calendar-aligned
//! windows and reduces quantities into them under an [`AggregationPolicy`].
//!
//! Windows are aligned in a fixed UTC offset. The first window starts at the
//! range start and the last one is clipped to the range end, so the union of
//! the windows is exactly the requested range. Membership is start-inclusive
//! and end-exclusive.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Months, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MeterError, Result, ValidationError};

/// Calendar unit of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One hour.
    Hour,
    /// One calendar day.
    Day,
    /// One ISO week, starting Monday.
    Week,
    /// One calendar month.
    Month,
}

impl Granularity {
    /// Get the granularity name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// Start of the unit containing `local`.
    ///
    /// Returns `None` when the unit starts before the supported calendar.
    #[must_use]
    pub fn floor(self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        let date = local.date();
        let midnight = date.and_time(NaiveTime::default());
        match self {
            Self::Hour => midnight.checked_add_signed(Duration::hours(i64::from(local.hour()))),
            Self::Day => Some(midnight),
            Self::Week => midnight.checked_sub_signed(Duration::days(i64::from(
                date.weekday().num_days_from_monday(),
            ))),
            Self::Month => midnight.checked_sub_signed(Duration::days(i64::from(date.day0()))),
        }
    }

    /// Start of the unit following the aligned boundary `aligned`.
    ///
    /// Returns `None` when the result falls outside the supported calendar.
    #[must_use]
    pub fn advance(self, aligned: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Self::Hour => aligned.checked_add_signed(Duration::hours(1)),
            Self::Day => aligned.checked_add_signed(Duration::days(1)),
            Self::Week => aligned.checked_add_signed(Duration::days(7)),
            Self::Month => aligned.checked_add_months(Months::new(1)),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            _ => Err(ValidationError::UnknownGranularity(s.to_string())),
        }
    }
}

/// How quantities inside one bucket are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Arithmetic sum; an empty bucket is zero. For counter-style features.
    Sum,
    /// Peak value; an empty bucket has no value. For gauge-style features.
    Max,
}

impl AggregationPolicy {
    /// Reduce a set of quantities.
    ///
    /// The result does not depend on iteration order.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Query` if a sum leaves the range of `Decimal`.
    pub fn reduce<I: IntoIterator<Item = Decimal>>(self, values: I) -> Result<Option<Decimal>> {
        let mut values = values.into_iter();
        match self {
            Self::Sum => values.try_fold(Decimal::ZERO, add_quantities).map(Some),
            Self::Max => Ok(values.max()),
        }
    }
}

/// Add a quantity to a running total.
///
/// # Errors
///
/// Returns `MeterError::Query` if the sum leaves the range of `Decimal`.
pub fn add_quantities(total: Decimal, quantity: Decimal) -> Result<Decimal> {
    total
        .checked_add(quantity)
        .ok_or_else(|| MeterError::query("quantity sum overflows", (total, quantity)))
}

/// A validated half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a range.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Query` if `end <= start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(MeterError::query(
                "end time must be after start time",
                (start, end),
            ));
        }
        Ok(Self { start, end })
    }

    /// Inclusive start.
    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive end.
    #[must_use]
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether `at` lies inside the range.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// One bucket of a series, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

/// Convert a wall-clock time in `offset` to UTC.
fn to_utc(local: NaiveDateTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    local
        .checked_sub_signed(Duration::seconds(i64::from(offset.local_minus_utc())))
        .map(|utc| Utc.from_utc_datetime(&utc))
}

fn to_local(at: DateTime<Utc>, offset: FixedOffset) -> Option<NaiveDateTime> {
    at.naive_utc()
        .checked_add_signed(Duration::seconds(i64::from(offset.local_minus_utc())))
}

/// Split `range` into contiguous windows aligned to `granularity` in `offset`.
///
/// # Errors
///
/// Returns `MeterError::Query` if more than `max_buckets` windows would be
/// produced or the range leaves the supported calendar.
pub fn bucket_windows(
    range: &TimeRange,
    granularity: Granularity,
    offset: FixedOffset,
    max_buckets: usize,
) -> Result<Vec<BucketWindow>> {
    let mut windows = Vec::new();
    let mut cursor = range.start;
    let mut boundary = to_local(range.start, offset)
        .and_then(|local| granularity.floor(local))
        .ok_or_else(|| MeterError::query("time range exceeds supported calendar", range))?;

    while cursor < range.end {
        // A boundary past the end of the calendar is past the range end too
        let next = match granularity.advance(boundary) {
            Some(advanced) => {
                boundary = advanced;
                to_utc(advanced, offset).map_or(range.end, |at| at.min(range.end))
            }
            None => range.end,
        };
        windows.push(BucketWindow {
            start: cursor,
            end: next,
        });
        if windows.len() > max_buckets {
            return Err(MeterError::query(
                format!("query would produce more than {max_buckets} {granularity} buckets"),
                range,
            ));
        }
        cursor = next;
    }

    Ok(windows)
}

/// Value of one bucket after reduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPoint {
    /// The bucket's time window.
    pub window: BucketWindow,
    /// Reduced value; `None` only for an empty bucket under `Max`.
    pub value: Option<Decimal>,
    /// Number of records that fell in the bucket.
    pub event_count: u64,
}

#[derive(Debug, Clone)]
enum Cell {
    Sum(Decimal),
    Max(Option<Decimal>),
    // Peak per sub-window start; the bucket value is the sum of the peaks.
    // `None` holds the sub-window that starts outside the supported calendar.
    BucketedMax(BTreeMap<Option<NaiveDateTime>, Decimal>),
}

/// Incremental reducer of one series (one group and one feature).
#[derive(Debug, Clone)]
pub struct BucketSeries {
    windows: Arc<[BucketWindow]>,
    policy: AggregationPolicy,
    sub_bucket: Option<(Granularity, FixedOffset)>,
    cells: Vec<Cell>,
    counts: Vec<u64>,
}

impl BucketSeries {
    /// Create an empty series over `windows`.
    #[must_use]
    pub fn new(windows: Arc<[BucketWindow]>, policy: AggregationPolicy) -> Self {
        let cell = match policy {
            AggregationPolicy::Sum => Cell::Sum(Decimal::ZERO),
            AggregationPolicy::Max => Cell::Max(None),
        };
        Self {
            cells: vec![cell; windows.len()],
            counts: vec![0; windows.len()],
            windows,
            policy,
            sub_bucket: None,
        }
    }

    /// Create a `Max` series whose bucket value is the sum of the peaks of each
    /// `sub_bucket` window inside the bucket.
    #[must_use]
    pub fn bucketed_max(
        windows: Arc<[BucketWindow]>,
        sub_bucket: Granularity,
        offset: FixedOffset,
    ) -> Self {
        Self {
            cells: vec![Cell::BucketedMax(BTreeMap::new()); windows.len()],
            counts: vec![0; windows.len()],
            windows,
            policy: AggregationPolicy::Max,
            sub_bucket: Some((sub_bucket, offset)),
        }
    }

    /// The series' aggregation policy.
    #[must_use]
    pub const fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Add one observation. Returns `false` if `at` is outside every window.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Query` if a bucket sum overflows.
    pub fn observe(&mut self, at: DateTime<Utc>, quantity: Decimal) -> Result<bool> {
        let idx = self.windows.partition_point(|w| w.start <= at);
        if idx == 0 || at >= self.windows[idx - 1].end {
            return Ok(false);
        }
        let idx = idx - 1;
        self.counts[idx] += 1;

        match &mut self.cells[idx] {
            Cell::Sum(total) => *total = add_quantities(*total, quantity)?,
            Cell::Max(peak) => *peak = Some(peak.map_or(quantity, |p| p.max(quantity))),
            Cell::BucketedMax(peaks) => {
                if let Some((granularity, offset)) = self.sub_bucket {
                    let slot = to_local(at, offset).and_then(|local| granularity.floor(local));
                    peaks
                        .entry(slot)
                        .and_modify(|p| *p = (*p).max(quantity))
                        .or_insert(quantity);
                }
            }
        }
        Ok(true)
    }

    /// Total records observed.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Reduced value of every bucket, in window order.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Query` if the peaks of a bucketed max overflow.
    pub fn points(&self) -> Result<Vec<BucketPoint>> {
        self.windows
            .iter()
            .zip(&self.cells)
            .zip(&self.counts)
            .map(|((window, cell), &event_count)| -> Result<BucketPoint> {
                let value = match cell {
                    Cell::Sum(total) => Some(*total),
                    Cell::Max(peak) => *peak,
                    Cell::BucketedMax(peaks) if peaks.is_empty() => None,
                    Cell::BucketedMax(peaks) => {
                        AggregationPolicy::Sum.reduce(peaks.values().copied())?
                    }
                };
                Ok(BucketPoint {
                    window: *window,
                    value,
                    event_count,
                })
            })
            .collect()
    }

    /// Value of the whole series.
    ///
    /// `Sum` adds the buckets. `Max` takes the peak bucket, except for bucketed
    /// max where the per-bucket sums of sub-window peaks are added.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Query` if adding the buckets overflows.
    pub fn total(&self) -> Result<Option<Decimal>> {
        let values: Vec<_> = self.points()?.into_iter().filter_map(|p| p.value).collect();
        match (self.policy, self.sub_bucket) {
            (AggregationPolicy::Max, None) => AggregationPolicy::Max.reduce(values),
            (AggregationPolicy::Max, Some(_)) if values.is_empty() => Ok(None),
            _ => AggregationPolicy::Sum.reduce(values),
        }
    }
}
