//! Blocking-task, deadline and cancellation plumbing shared by the engines.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use z_metering_core::{MeterError, RecordKey, Result, UsageRecord};
use z_metering_store::{ScanRange, Store, StoreError};

/// A child cancellation token that also fires when the operation deadline
/// passes. The timer is stopped when the deadline is dropped.
pub(crate) struct Deadline {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl Deadline {
    pub(crate) fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let timer = timeout.map(|timeout| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!(?timeout, "Operation deadline exceeded");
                token.cancel();
            })
        });
        Self { token, timer }
    }

    pub(crate) const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Map a storage failure to the engine error reported to callers.
pub(crate) fn store_unavailable(
    err: &StoreError,
    committed: usize,
    key: Option<RecordKey>,
) -> MeterError {
    tracing::warn!(error = %err, committed, "Store operation failed");
    MeterError::StoreUnavailable {
        message: err.to_string(),
        committed,
        key,
        pending: Vec::new(),
    }
}

/// The error for a read aborted by cancellation.
pub(crate) const fn read_cancelled() -> MeterError {
    MeterError::Cancelled {
        committed: 0,
        pending: Vec::new(),
    }
}

/// Run blocking store work off the async runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MeterError::StoreUnavailable {
            message: format!("blocking task failed: {e}"),
            committed: 0,
            key: None,
            pending: Vec::new(),
        })?
}

/// Scan `range`, checking `token` before every record.
///
/// # Errors
///
/// Returns `MeterError::Cancelled` if the token fired mid-scan and
/// `MeterError::StoreUnavailable` if the store failed.
pub(crate) fn scan_cancellable(
    store: &dyn Store,
    range: &ScanRange<'_>,
    token: &CancellationToken,
    mut visit: impl FnMut(UsageRecord) -> ControlFlow<()>,
) -> Result<()> {
    if token.is_cancelled() {
        return Err(read_cancelled());
    }

    let mut cancelled = false;
    store
        .scan(range, &mut |record| {
            if token.is_cancelled() {
                cancelled = true;
                return ControlFlow::Break(());
            }
            visit(record)
        })
        .map_err(|e| store_unavailable(&e, 0, None))?;

    if cancelled {
        tracing::warn!(scope = %range.scope, "Scan cancelled");
        return Err(read_cancelled());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_child_only() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, Some(Duration::from_millis(50)));
        assert!(!deadline.token().is_cancelled());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(deadline.token().is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, None);
        parent.cancel();
        assert!(deadline.token().is_cancelled());
    }

    #[tokio::test]
    async fn blocking_errors_pass_through() {
        let result: Result<()> =
            run_blocking(|| Err(MeterError::Configuration("boom".into()))).await;
        assert!(matches!(result, Err(MeterError::Configuration(_))));
    }
}
