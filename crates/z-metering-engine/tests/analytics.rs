//! Analytics engine integration tests.

mod common;

use chrono::FixedOffset;
use rust_decimal::Decimal;

use common::{at, day, token, usage, usage_for, TestHarness};
use z_metering_core::{
    AggregationPolicy, Granularity, GroupKey, MaxBucketFeature, MaxBucketFeatures, MeterError,
    ProcessedRecordsParams, Scope, UsageAnalyticsParams,
};

fn dec(value: i64) -> Decimal {
    Decimal::from(value)
}

fn max_features(features: &[&str]) -> MaxBucketFeatures {
    features
        .iter()
        .map(|f| ((*f).to_string(), MaxBucketFeature::default()))
        .collect()
}

// ============================================================================
// Detailed analytics
// ============================================================================

#[tokio::test]
async fn duplicate_is_not_counted_in_hourly_sum() {
    let harness = TestHarness::new();
    let gate = harness.core.ingestion();

    // A, then B with A's key, then C
    for record in [
        usage("hashA", at(10, 0), 5),
        usage("hashA", at(10, 0), 5),
        usage("hashC", at(10, 30), 3),
    ] {
        gate.insert_one(&harness.scope, record, &token()).await.unwrap();
    }

    let analytics = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(at(10, 0), at(11, 0), Granularity::Hour),
            MaxBucketFeatures::new(),
            &token(),
        )
        .await
        .unwrap();

    assert_eq!(analytics.series.len(), 1);
    let series = &analytics.series[0];
    assert_eq!(series.feature_id, "api_calls");
    assert_eq!(series.policy, AggregationPolicy::Sum);
    assert_eq!(series.event_count, 2);
    assert_eq!(series.points.len(), 1);
    assert_eq!(series.points[0].value, Some(dec(8)));
    assert_eq!(series.total, Some(dec(8)));
}

#[tokio::test]
async fn empty_buckets_are_zero_for_sum_and_absent_for_max() {
    let harness = TestHarness::new();
    let gate = harness.core.ingestion();

    // Only the first and third hour carry data
    for record in [
        usage_for("sub1", "m1", "requests", "r1", at(10, 15), 4),
        usage_for("sub1", "m1", "requests", "r2", at(12, 15), 6),
        usage_for("sub1", "m2", "seats", "s1", at(10, 15), 3),
        usage_for("sub1", "m2", "seats", "s2", at(10, 45), 7),
        usage_for("sub1", "m2", "seats", "s3", at(12, 15), 2),
    ] {
        gate.insert_one(&harness.scope, record, &token()).await.unwrap();
    }

    let analytics = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(at(10, 0), at(13, 0), Granularity::Hour),
            max_features(&["seats"]),
            &token(),
        )
        .await
        .unwrap();

    let all = GroupKey::all();
    let requests = analytics.find(&all, "requests").unwrap();
    let values: Vec<_> = requests.points.iter().map(|p| p.value).collect();
    assert_eq!(values, vec![Some(dec(4)), Some(dec(0)), Some(dec(6))]);
    assert_eq!(requests.total, Some(dec(10)));

    let seats = analytics.find(&all, "seats").unwrap();
    assert_eq!(seats.policy, AggregationPolicy::Max);
    let values: Vec<_> = seats.points.iter().map(|p| p.value).collect();
    assert_eq!(values, vec![Some(dec(7)), None, Some(dec(2))]);
    assert_eq!(seats.total, Some(dec(7)));

    assert_eq!(analytics.rows().count(), 6);
}

#[tokio::test]
async fn bucketed_max_sums_daily_peaks() {
    let harness = TestHarness::new();
    let gate = harness.core.ingestion();

    let peaks = [("a", 0, 9, 3), ("b", 0, 15, 5), ("c", 1, 9, 4), ("d", 3, 9, 1)];
    for (hash, days, hour, qty) in peaks {
        let ts = day(days) + chrono::Duration::hours(hour);
        gate.insert_one(
            &harness.scope,
            usage_for("sub1", "m1", "seats", hash, ts, qty),
            &token(),
        )
        .await
        .unwrap();
    }

    let features = MaxBucketFeatures::from([(
        "seats".to_string(),
        MaxBucketFeature {
            bucket_size: Some(Granularity::Day),
        },
    )]);

    let analytics = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            // 2024-01-01 is a Monday
            UsageAnalyticsParams::new(day(0), day(7), Granularity::Week),
            features,
            &token(),
        )
        .await
        .unwrap();

    let seats = analytics.find(&GroupKey::all(), "seats").unwrap();
    assert_eq!(seats.points.len(), 1);
    assert_eq!(seats.points[0].value, Some(dec(5 + 4 + 1)));
}

#[tokio::test]
async fn groups_by_configured_properties() {
    let harness = TestHarness::new();
    let gate = harness.core.ingestion();

    let regions = [
        ("a", Some("eu"), 2),
        ("b", Some("us"), 3),
        ("c", Some("eu"), 4),
        ("d", None, 1),
    ];
    for (hash, region, qty) in regions {
        let mut record = usage(hash, at(10, 0), qty);
        if let Some(region) = region {
            record = record.with_property("region", region);
        }
        gate.insert_one(&harness.scope, record, &token()).await.unwrap();
    }

    let analytics = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(at(0, 0), day(1), Granularity::Day).group_by("region"),
            MaxBucketFeatures::new(),
            &token(),
        )
        .await
        .unwrap();

    let rendered: Vec<_> = analytics
        .series
        .iter()
        .map(|s| (s.group.to_string(), s.total))
        .collect();
    assert_eq!(
        rendered,
        vec![
            ("region=∅".to_string(), Some(dec(1))),
            ("region=eu".to_string(), Some(dec(6))),
            ("region=us".to_string(), Some(dec(3))),
        ]
    );
}

#[tokio::test]
async fn non_groupable_property_is_a_query_error() {
    let harness = TestHarness::new();
    let err = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(at(0, 0), day(1), Granularity::Day).group_by("email"),
            MaxBucketFeatures::new(),
            &token(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::Query { .. }));
}

#[tokio::test]
async fn inverted_range_is_a_query_error() {
    let harness = TestHarness::new();
    let err = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(at(11, 0), at(10, 0), Granularity::Hour),
            MaxBucketFeatures::new(),
            &token(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::Query { .. }));
}

#[tokio::test]
async fn too_many_buckets_is_a_query_error() {
    let harness = TestHarness::with_config(
        z_metering_engine::MeteringConfig::default().with_max_buckets(24),
    );
    let err = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(day(0), day(2), Granularity::Hour),
            MaxBucketFeatures::new(),
            &token(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::Query { .. }));
}

#[tokio::test]
async fn offset_moves_day_boundaries() {
    let harness = TestHarness::new();
    // 23:30 UTC is already the next day at UTC+1
    harness
        .core
        .ingestion()
        .insert_one(&harness.scope, usage("late", at(23, 30), 1), &token())
        .await
        .unwrap();

    let start = day(0) - chrono::Duration::hours(1);
    let mut params = UsageAnalyticsParams::new(start, day(2), Granularity::Day);
    params.utc_offset_secs = Some(3600);

    let analytics = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(&harness.scope, params, MaxBucketFeatures::new(), &token())
        .await
        .unwrap();

    let offset = FixedOffset::east_opt(3600).unwrap();
    let series = &analytics.series[0];
    let hit = series.points.iter().find(|p| p.event_count == 1).unwrap();
    let local_start = hit.window.start.with_timezone(&offset);
    assert_eq!(local_start.format("%d %H:%M").to_string(), "02 00:00");
}

#[tokio::test]
async fn scopes_are_isolated() {
    let harness = TestHarness::new();
    let staging = Scope::new("tenant_1", "staging");

    harness
        .core
        .ingestion()
        .insert_one(&harness.scope, usage("a", at(10, 0), 5), &token())
        .await
        .unwrap();
    harness
        .core
        .ingestion()
        .insert_one(&staging, usage("a", at(10, 0), 100), &token())
        .await
        .unwrap();

    let analytics = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(at(0, 0), day(1), Granularity::Day),
            MaxBucketFeatures::new(),
            &token(),
        )
        .await
        .unwrap();
    assert_eq!(analytics.series[0].total, Some(dec(5)));
}

#[tokio::test]
async fn filters_narrow_the_records() {
    let harness = TestHarness::new();
    let gate = harness.core.ingestion();
    for record in [
        usage_for("sub1", "m1", "api_calls", "a", at(10, 0), 1),
        usage_for("sub2", "m1", "api_calls", "b", at(10, 0), 10),
        usage_for("sub1", "m1", "storage", "c", at(10, 0), 100),
    ] {
        gate.insert_one(&harness.scope, record, &token()).await.unwrap();
    }

    let analytics = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(at(0, 0), day(1), Granularity::Day)
                .for_subscription("sub1")
                .for_feature("api_calls"),
            MaxBucketFeatures::new(),
            &token(),
        )
        .await
        .unwrap();

    assert_eq!(analytics.series.len(), 1);
    assert_eq!(analytics.series[0].total, Some(dec(1)));
}

#[tokio::test]
async fn range_outside_calendar_is_a_query_error() {
    let harness = TestHarness::new();
    let all_time = UsageAnalyticsParams::new(
        chrono::DateTime::<chrono::Utc>::MIN_UTC,
        chrono::DateTime::<chrono::Utc>::MAX_UTC,
        Granularity::Week,
    );

    let err = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            all_time,
            MaxBucketFeatures::new(),
            &token(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::Query { .. }));
}

#[tokio::test]
async fn overflowing_sum_is_a_query_error() {
    let harness = TestHarness::new();
    let gate = harness.core.ingestion();
    for hash in ["a", "b"] {
        let mut record = usage(hash, at(10, 0), 0);
        record.quantity = Decimal::MAX;
        gate.insert_one(&harness.scope, record, &token()).await.unwrap();
    }

    let err = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(at(0, 0), day(1), Granularity::Day),
            MaxBucketFeatures::new(),
            &token(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::Query { .. }));

    let err = harness
        .core
        .analytics()
        .get_feature_usage_by_subscription(
            &harness.scope,
            "sub1",
            None,
            at(0, 0),
            day(1),
            &token(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::Query { .. }));
}

#[tokio::test]
async fn cancelled_query_fails() {
    let harness = TestHarness::new();
    let cancel = token();
    cancel.cancel();

    let err = harness
        .core
        .analytics()
        .get_detailed_usage_analytics(
            &harness.scope,
            UsageAnalyticsParams::new(at(0, 0), day(1), Granularity::Day),
            MaxBucketFeatures::new(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::Cancelled { committed: 0, .. }));
}

// ============================================================================
// Feature usage by subscription
// ============================================================================

#[tokio::test]
async fn feature_usage_totals() {
    let harness = TestHarness::new();
    let gate = harness.core.ingestion();
    for record in [
        usage_for("sub1", "m1", "api_calls", "a", at(10, 0), 5),
        usage_for("sub1", "m2", "api_calls", "b", at(11, 0), 9),
        usage_for("sub1", "m1", "api_calls", "c", at(12, 0), 2),
        usage_for("sub1", "m3", "storage", "d", at(10, 0), 40),
        usage_for("sub2", "m1", "api_calls", "e", at(10, 0), 1000),
    ] {
        gate.insert_one(&harness.scope, record, &token()).await.unwrap();
    }

    let usage = harness
        .core
        .analytics()
        .get_feature_usage_by_subscription(
            &harness.scope,
            "sub1",
            Some("cust1"),
            at(0, 0),
            day(1),
            &token(),
        )
        .await
        .unwrap();

    assert_eq!(usage.len(), 2);
    let api = &usage["api_calls"];
    assert_eq!(api.sum_total, dec(16));
    assert_eq!(api.max_total, dec(9));
    assert_eq!(api.event_count, 3);
    assert_eq!(api.latest_quantity, dec(2));
    assert_eq!(api.first_event_at, at(10, 0));
    assert_eq!(api.last_event_at, at(12, 0));
    assert_eq!(api.meter_ids.len(), 2);
    assert_eq!(usage["storage"].sum_total, dec(40));
}

#[tokio::test]
async fn feature_usage_of_other_customer_is_empty() {
    let harness = TestHarness::new();
    harness
        .core
        .ingestion()
        .insert_one(&harness.scope, usage("a", at(10, 0), 5), &token())
        .await
        .unwrap();

    let usage = harness
        .core
        .analytics()
        .get_feature_usage_by_subscription(
            &harness.scope,
            "sub1",
            Some("someone_else"),
            at(0, 0),
            day(1),
            &token(),
        )
        .await
        .unwrap();
    assert!(usage.is_empty());
}

// ============================================================================
// Processed records
// ============================================================================

#[tokio::test]
async fn processed_records_page_and_count() {
    let harness = TestHarness::new();
    let gate = harness.core.ingestion();
    for minute in 0..10 {
        let record = usage(&format!("h{minute}"), at(10, minute), 1);
        gate.insert_one(&harness.scope, record, &token()).await.unwrap();
    }
    gate.insert_one(
        &harness.scope,
        usage_for("sub1", "other_meter", "api_calls", "x", at(10, 5), 1),
        &token(),
    )
    .await
    .unwrap();

    let params = ProcessedRecordsParams {
        subscription_id: Some("sub1".into()),
        external_customer_id: None,
        meter_id: Some("meterX".into()),
        feature_id: None,
        start_time: at(0, 0),
        end_time: day(1),
        limit: 3,
        offset: 4,
        count_total: true,
    };

    let page = harness
        .core
        .analytics()
        .get_processed_records(&harness.scope, params, &token())
        .await
        .unwrap();

    let hashes: Vec<_> = page.records.iter().map(|r| r.unique_hash.as_str()).collect();
    assert_eq!(hashes, vec!["h4", "h5", "h6"]);
    assert_eq!(page.total, Some(10));
}
