//! Usage record model.
//!
//! A [`UsageRecord`] is the only entity persisted by z-metering. Callers submit
//! a [`NewUsageRecord`]; the ingestion gate assigns the identifier and the
//! ingestion timestamp and stores it at most once per [`RecordKey`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::RecordId;

/// Tenant and environment a call operates in.
///
/// Resolved by the caller before invoking the core; every record and every
/// query is confined to exactly one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    /// Tenant identifier.
    pub tenant_id: String,
    /// Environment identifier within the tenant.
    pub environment_id: String,
}

impl Scope {
    /// Create a new scope.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            environment_id: environment_id.into(),
        }
    }

    /// Check that both components are present.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingScope` if either component is blank.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tenant_id.trim().is_empty() {
            return Err(ValidationError::MissingScope { field: "tenant_id" });
        }
        if self.environment_id.trim().is_empty() {
            return Err(ValidationError::MissingScope {
                field: "environment_id",
            });
        }
        Ok(())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.environment_id)
    }
}

/// A scalar property value attached to a usage record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    /// Text value.
    String(String),
    /// Numeric value.
    Number(Decimal),
    /// Boolean value.
    Bool(bool),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Decimal> for PropertyValue {
    fn from(value: Decimal) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Number(Decimal::from(value))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Ordered property map used for group-by dimensions.
pub type Properties = BTreeMap<String, PropertyValue>;

/// The deduplication key of a usage record.
///
/// At most one record exists per key within a [`Scope`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Subscription the usage belongs to.
    pub subscription_id: String,
    /// Meter that measured the usage.
    pub meter_id: String,
    /// Billing period bucket, opaque to this crate.
    pub period_id: u64,
    /// Caller-supplied fingerprint of the source event.
    pub unique_hash: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subscription={} meter={} period={} hash={}",
            self.subscription_id, self.meter_id, self.period_id, self.unique_hash
        )
    }
}

/// A usage fact as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUsageRecord {
    /// Subscription the usage belongs to.
    pub subscription_id: String,
    /// Meter that measured the usage.
    pub meter_id: String,
    /// Customer identifier in the caller's system.
    pub external_customer_id: String,
    /// Feature the meter is attached to.
    pub feature_id: String,
    /// Billing period bucket.
    pub period_id: u64,
    /// When the usage occurred.
    pub event_timestamp: DateTime<Utc>,
    /// Measured value.
    pub quantity: Decimal,
    /// Dimensions usable for grouping and filtering.
    #[serde(default)]
    pub properties: Properties,
    /// Deduplication fingerprint.
    pub unique_hash: String,
    /// Name of the originating event, if known.
    #[serde(default)]
    pub event_name: Option<String>,
    /// Producer that emitted the originating event, if known.
    #[serde(default)]
    pub source: Option<String>,
}

impl NewUsageRecord {
    /// Build a record with the required fields and no properties.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscription_id: impl Into<String>,
        meter_id: impl Into<String>,
        external_customer_id: impl Into<String>,
        feature_id: impl Into<String>,
        period_id: u64,
        event_timestamp: DateTime<Utc>,
        quantity: Decimal,
        unique_hash: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            meter_id: meter_id.into(),
            external_customer_id: external_customer_id.into(),
            feature_id: feature_id.into(),
            period_id,
            event_timestamp,
            quantity,
            properties: Properties::new(),
            unique_hash: unique_hash.into(),
            event_name: None,
            source: None,
        }
    }

    /// Attach a property.
    #[must_use]
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the source producer.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the originating event name.
    #[must_use]
    pub fn with_event_name(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = Some(event_name.into());
        self
    }

    /// The deduplication key of this record.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            subscription_id: self.subscription_id.clone(),
            meter_id: self.meter_id.clone(),
            period_id: self.period_id,
            unique_hash: self.unique_hash.clone(),
        }
    }

    /// Check identity fields and, when enforced, the quantity sign.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` for a blank identity field and
    /// `ValidationError::NegativeQuantity` when `reject_negative` is set and the
    /// quantity is below zero.
    pub fn validate(&self, reject_negative: bool) -> Result<(), ValidationError> {
        let required = [
            ("subscription_id", &self.subscription_id),
            ("meter_id", &self.meter_id),
            ("external_customer_id", &self.external_customer_id),
            ("feature_id", &self.feature_id),
            ("unique_hash", &self.unique_hash),
        ];
        if let Some(&(field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ValidationError::MissingField {
                field,
                key: self.key(),
            });
        }

        if reject_negative && self.quantity.is_sign_negative() && !self.quantity.is_zero() {
            return Err(ValidationError::NegativeQuantity {
                key: self.key(),
                quantity: self.quantity,
            });
        }

        Ok(())
    }
}

/// A persisted usage fact. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Identifier assigned at ingestion.
    pub id: RecordId,
    /// Scope the record was ingested under.
    pub scope: Scope,
    /// Subscription the usage belongs to.
    pub subscription_id: String,
    /// Meter that measured the usage.
    pub meter_id: String,
    /// Customer identifier in the caller's system.
    pub external_customer_id: String,
    /// Feature the meter is attached to.
    pub feature_id: String,
    /// Billing period bucket.
    pub period_id: u64,
    /// When the usage occurred, truncated to microseconds.
    pub event_timestamp: DateTime<Utc>,
    /// Measured value.
    pub quantity: Decimal,
    /// Dimensions usable for grouping and filtering.
    pub properties: Properties,
    /// Deduplication fingerprint.
    pub unique_hash: String,
    /// Name of the originating event, if known.
    pub event_name: Option<String>,
    /// Producer that emitted the originating event, if known.
    pub source: Option<String>,
    /// When the record was accepted by the ingestion gate.
    pub ingested_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Materialize a submitted record, assigning its identity.
    ///
    /// The event timestamp is truncated to microseconds, the precision at which
    /// records are ordered in storage.
    #[must_use]
    pub fn ingest(scope: Scope, new: NewUsageRecord, ingested_at: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::generate(),
            scope,
            subscription_id: new.subscription_id,
            meter_id: new.meter_id,
            external_customer_id: new.external_customer_id,
            feature_id: new.feature_id,
            period_id: new.period_id,
            event_timestamp: new.event_timestamp.trunc_subsecs(6),
            quantity: new.quantity,
            properties: new.properties,
            unique_hash: new.unique_hash,
            event_name: new.event_name,
            source: new.source,
            ingested_at,
        }
    }

    /// The deduplication key of this record.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            subscription_id: self.subscription_id.clone(),
            meter_id: self.meter_id.clone(),
            period_id: self.period_id,
            unique_hash: self.unique_hash.clone(),
        }
    }

    /// Total order used by storage and export: event time, then identifier.
    #[must_use]
    pub fn sort_key(&self) -> (DateTime<Utc>, RecordId) {
        (self.event_timestamp, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> NewUsageRecord {
        NewUsageRecord::new(
            "sub1",
            "meterX",
            "cust1",
            "api_calls",
            1,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            Decimal::from(5),
            "hashA",
        )
    }

    #[test]
    fn valid_record_passes() {
        assert!(sample().validate(true).is_ok());
    }

    #[test]
    fn blank_identity_field_is_reported_with_key() {
        let mut record = sample();
        record.meter_id = "  ".into();
        let err = record.validate(false).unwrap_err();
        match err {
            ValidationError::MissingField { field, key } => {
                assert_eq!(field, "meter_id");
                assert_eq!(key.unique_hash, "hashA");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn negative_quantity_only_rejected_when_enforced() {
        let mut record = sample();
        record.quantity = Decimal::from(-2);
        assert!(record.validate(false).is_ok());
        assert!(matches!(
            record.validate(true),
            Err(ValidationError::NegativeQuantity { .. })
        ));
    }

    #[test]
    fn ingest_truncates_to_microseconds() {
        let mut record = sample();
        record.event_timestamp = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let stored = UsageRecord::ingest(Scope::new("t", "e"), record, Utc::now());
        assert_eq!(stored.event_timestamp.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn blank_scope_is_rejected() {
        assert!(Scope::new("tenant", "").validate().is_err());
        assert!(Scope::new("tenant", "prod").validate().is_ok());
    }

    #[test]
    fn property_values_roundtrip_through_json() {
        let record = sample()
            .with_property("region", "us-east")
            .with_property("seats", 4_i64)
            .with_property("trial", true);
        let json = serde_json::to_string(&record).unwrap();
        let parsed: NewUsageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
