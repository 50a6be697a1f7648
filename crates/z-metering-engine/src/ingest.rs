//! Ingestion gate.
//!
//! Validates submitted usage records and stores each one at most once per
//! [`RecordKey`]. The store resolves concurrent writers of one key under a
//! transaction lock, so a record reported `Inserted` here is the only stored
//! record for its key.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use z_metering_core::{
    MeterError, NewUsageRecord, RecordId, RecordKey, Result, Scope, UsageRecord, ValidationError,
};
use z_metering_store::{InsertStatus, Store, StoreError};

use crate::config::MeteringConfig;
use crate::runtime::{read_cancelled, run_blocking, store_unavailable, Deadline};

/// Result of inserting a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was stored under a new identifier.
    Inserted(RecordId),
    /// A record with the same key was already stored.
    Duplicate {
        /// Identifier of the stored record.
        existing: RecordId,
    },
}

impl InsertOutcome {
    /// Identifier of the record that now holds the key.
    #[must_use]
    pub const fn record_id(&self) -> RecordId {
        match self {
            Self::Inserted(id) | Self::Duplicate { existing: id } => *id,
        }
    }
}

impl From<(InsertStatus, RecordId)> for InsertOutcome {
    fn from((status, id): (InsertStatus, RecordId)) -> Self {
        match status {
            InsertStatus::Inserted => Self::Inserted(id),
            InsertStatus::Duplicate { existing } => Self::Duplicate { existing },
        }
    }
}

/// Per-record status within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    /// Stored under a new identifier.
    Inserted(RecordId),
    /// Already stored.
    Duplicate {
        /// Identifier of the stored record.
        existing: RecordId,
    },
    /// Rejected before reaching storage.
    Invalid(ValidationError),
}

/// Outcome of one input record of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Position of the record in the submitted batch.
    pub index: usize,
    /// Deduplication key of the record.
    pub key: RecordKey,
    /// What happened to it.
    pub status: RecordStatus,
}

/// Result of a batch insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// One outcome per input record, in input order.
    pub outcomes: Vec<RecordOutcome>,
    /// Records stored by this call.
    pub inserted: usize,
    /// Records whose key was already stored.
    pub duplicates: usize,
    /// Records rejected by validation.
    pub invalid: usize,
}

impl BatchResult {
    fn from_outcomes(mut outcomes: Vec<RecordOutcome>) -> Self {
        outcomes.sort_by_key(|o| o.index);
        let mut result = Self::default();
        for outcome in &outcomes {
            match outcome.status {
                RecordStatus::Inserted(_) => result.inserted += 1,
                RecordStatus::Duplicate { .. } => result.duplicates += 1,
                RecordStatus::Invalid(_) => result.invalid += 1,
            }
        }
        result.outcomes = outcomes;
        result
    }
}

/// What one blocking writer accomplished.
#[derive(Default)]
struct ChunkReport {
    outcomes: Vec<RecordOutcome>,
    pending: Vec<usize>,
    failure: Option<(StoreError, RecordKey)>,
}

/// Write one chunk sequentially, stopping at cancellation or the first
/// store failure.
fn write_chunk(
    store: &dyn Store,
    chunk: Vec<(usize, UsageRecord)>,
    token: &CancellationToken,
) -> ChunkReport {
    let mut report = ChunkReport::default();
    let mut records = chunk.into_iter();

    for (index, record) in records.by_ref() {
        if token.is_cancelled() {
            report.pending.push(index);
            break;
        }

        let key = record.key();
        match store.insert_record(&record) {
            Ok(status) => report.outcomes.push(RecordOutcome {
                index,
                key,
                status: match InsertOutcome::from((status, record.id)) {
                    InsertOutcome::Inserted(id) => RecordStatus::Inserted(id),
                    InsertOutcome::Duplicate { existing } => RecordStatus::Duplicate { existing },
                },
            }),
            Err(e) => {
                // Siblings stop at their next record
                token.cancel();
                report.pending.push(index);
                report.failure = Some((e, key));
                break;
            }
        }
    }

    report.pending.extend(records.map(|(index, _)| index));
    report
}

/// Validates and stores usage records.
#[derive(Clone)]
pub struct IngestionGate {
    store: Arc<dyn Store>,
    config: Arc<MeteringConfig>,
}

impl IngestionGate {
    /// Create a gate over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: Arc<MeteringConfig>) -> Self {
        Self { store, config }
    }

    fn prepare(
        &self,
        scope: &Scope,
        record: NewUsageRecord,
    ) -> std::result::Result<UsageRecord, ValidationError> {
        record.validate(self.config.reject_negative_quantity)?;
        Ok(UsageRecord::ingest(scope.clone(), record, Utc::now()))
    }

    /// Insert one record unless its key is already stored.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Validation` for a malformed record or scope,
    /// `MeterError::Cancelled` if `cancel` fired before the write, and
    /// `MeterError::StoreUnavailable` if the store failed.
    pub async fn insert_one(
        &self,
        scope: &Scope,
        record: NewUsageRecord,
        cancel: &CancellationToken,
    ) -> Result<InsertOutcome> {
        scope.validate()?;
        let record = self.prepare(scope, record)?;

        if cancel.is_cancelled() {
            return Err(MeterError::Cancelled {
                committed: 0,
                pending: vec![0],
            });
        }

        let store = Arc::clone(&self.store);
        let key = record.key();
        let outcome = run_blocking(move || {
            store
                .insert_record(&record)
                .map(|status| InsertOutcome::from((status, record.id)))
                .map_err(|e| store_unavailable(&e, 0, Some(record.key())))
        })
        .await?;

        tracing::debug!(scope = %scope, key = %key, ?outcome, "Usage record ingested");
        Ok(outcome)
    }

    /// Insert a batch of records, each independently.
    ///
    /// Invalid records are reported per record and do not fail the call.
    /// Records are written in chunks on up to `ingest_parallelism` blocking
    /// threads; no ordering between records is guaranteed.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Validation` if the batch exceeds `max_batch_size`
    /// or the scope is blank. Returns `MeterError::StoreUnavailable` on the
    /// first store failure and `MeterError::Cancelled` on cancellation or
    /// timeout; both report how many records were committed and the input
    /// indices that were not.
    pub async fn insert_batch(
        &self,
        scope: &Scope,
        records: Vec<NewUsageRecord>,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        scope.validate()?;
        if records.len() > self.config.max_batch_size {
            return Err(ValidationError::BatchTooLarge {
                size: records.len(),
                limit: self.config.max_batch_size,
            }
            .into());
        }

        let size = records.len();
        let deadline = Deadline::new(cancel, self.config.operation_timeout);
        let mut outcomes = Vec::with_capacity(size);
        let mut prepared = Vec::with_capacity(size);

        for (index, record) in records.into_iter().enumerate() {
            let key = record.key();
            match self.prepare(scope, record) {
                Ok(record) => prepared.push((index, record)),
                Err(e) => outcomes.push(RecordOutcome {
                    index,
                    key,
                    status: RecordStatus::Invalid(e),
                }),
            }
        }

        let mut chunks = Vec::new();
        let mut prepared = prepared.into_iter().peekable();
        while prepared.peek().is_some() {
            let chunk: Vec<_> = prepared.by_ref().take(self.config.ingest_chunk_size).collect();
            chunks.push(chunk);
        }

        let reports: Vec<_> = stream::iter(chunks)
            .map(|chunk| {
                let indices: Vec<usize> = chunk.iter().map(|(index, _)| *index).collect();
                let store = Arc::clone(&self.store);
                let token = deadline.token().clone();
                let worker = {
                    let token = token.clone();
                    tokio::task::spawn_blocking(move || write_chunk(store.as_ref(), chunk, &token))
                };
                async move {
                    worker.await.map_err(|e| {
                        token.cancel();
                        (e, indices)
                    })
                }
            })
            .buffer_unordered(self.config.ingest_parallelism)
            .collect()
            .await;

        let mut pending = Vec::new();
        let mut failure = None;
        let mut lost = None;
        for report in reports {
            match report {
                Ok(report) => {
                    outcomes.extend(report.outcomes);
                    pending.extend(report.pending);
                    if failure.is_none() {
                        failure = report.failure;
                    }
                }
                // Some of a lost chunk may be stored; resubmitting it is safe
                Err((e, indices)) => {
                    tracing::warn!(error = %e, records = indices.len(), "Ingestion worker failed");
                    pending.extend(indices);
                    lost.get_or_insert(e);
                }
            }
        }

        let result = BatchResult::from_outcomes(outcomes);
        pending.sort_unstable();

        let failure = match (failure, lost) {
            (Some((err, key)), _) => Some((err.to_string(), Some(key))),
            (None, Some(e)) => Some((format!("ingestion worker failed: {e}"), None)),
            (None, None) => None,
        };
        if let Some((message, key)) = failure {
            tracing::warn!(
                scope = %scope,
                error = %message,
                committed = result.inserted,
                pending = pending.len(),
                "Batch ingestion failed"
            );
            return Err(MeterError::StoreUnavailable {
                message,
                committed: result.inserted,
                key,
                pending,
            });
        }
        if !pending.is_empty() {
            tracing::warn!(
                scope = %scope,
                committed = result.inserted,
                pending = pending.len(),
                "Batch ingestion cancelled"
            );
            return Err(MeterError::Cancelled {
                committed: result.inserted,
                pending,
            });
        }

        tracing::info!(
            scope = %scope,
            size,
            inserted = result.inserted,
            duplicates = result.duplicates,
            invalid = result.invalid,
            "Batch ingested"
        );
        Ok(result)
    }

    /// Check whether a record with the given key is stored.
    ///
    /// The answer may be stale by the time it is used; insertion decides
    /// uniqueness on its own.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Cancelled` if `cancel` already fired and
    /// `MeterError::StoreUnavailable` if the store failed.
    pub async fn is_duplicate(
        &self,
        scope: &Scope,
        key: RecordKey,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        scope.validate()?;
        if cancel.is_cancelled() {
            return Err(read_cancelled());
        }

        let store = Arc::clone(&self.store);
        let scope = scope.clone();
        run_blocking(move || {
            store
                .contains_key(&scope, &key)
                .map_err(|e| store_unavailable(&e, 0, Some(key.clone())))
        })
        .await
    }

    /// Get the stored record holding `key`.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Cancelled` if `cancel` already fired and
    /// `MeterError::StoreUnavailable` if the store failed.
    pub async fn find(
        &self,
        scope: &Scope,
        key: RecordKey,
        cancel: &CancellationToken,
    ) -> Result<Option<UsageRecord>> {
        scope.validate()?;
        if cancel.is_cancelled() {
            return Err(read_cancelled());
        }

        let store = Arc::clone(&self.store);
        let scope = scope.clone();
        run_blocking(move || {
            store
                .find_by_key(&scope, &key)
                .map_err(|e| store_unavailable(&e, 0, Some(key.clone())))
        })
        .await
    }
}
