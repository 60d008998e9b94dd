//! Deadline and cancellation wrapper used by every other component.
//!
//! [`with_timeout`] races an operation against a timer. When the timer wins
//! the operation is dropped, the optional cleanup callback runs exactly once
//! and a [`AppError::Timeout`] carrying the deadline and context is returned.
//! [`with_cancellation`] additionally hands the operation a
//! [`CancellationToken`] that is cancelled when the deadline fires, so work
//! the operation spawned can unwind on its own.

use crate::core::{AppError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

/// Largest deadline accepted, matching a signed 32-bit millisecond timer.
pub const MAX_TIMEOUT_MS: u64 = i32::MAX as u64;

pub type Cleanup = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Free-form context merged into the timeout error.
#[derive(Default)]
pub struct TimeoutContext {
    operation: Option<String>,
    details: BTreeMap<String, serde_json::Value>,
    cleanup: Option<Cleanup>,
}

impl TimeoutContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Self::default()
        }
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Callback run once if the deadline fires. Its failure is logged and
    /// otherwise ignored.
    pub fn cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    fn into_error(self, timeout_ms: u64) -> AppError {
        if let Some(cleanup) = self.cleanup {
            match catch_unwind(AssertUnwindSafe(cleanup)) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    event!(Level::WARN, error = %err, "timeout cleanup failed");
                }
                Err(_) => {
                    event!(Level::WARN, "timeout cleanup panicked");
                }
            }
        }

        AppError::Timeout {
            timeout_ms,
            operation: self.operation,
            details: self.details,
        }
    }
}

impl fmt::Debug for TimeoutContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutContext")
            .field("operation", &self.operation)
            .field("details", &self.details)
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// Reject zero and out-of-range deadlines.
pub fn validate_timeout(timeout_ms: u64) -> Result<Duration> {
    if timeout_ms == 0 {
        return Err(AppError::Configuration(
            "timeout must be a positive number of milliseconds".into(),
        ));
    }
    if timeout_ms > MAX_TIMEOUT_MS {
        return Err(AppError::Configuration(format!(
            "timeout must not exceed {}ms, got {}ms",
            MAX_TIMEOUT_MS, timeout_ms
        )));
    }
    Ok(Duration::from_millis(timeout_ms))
}

/// Run `operation` with a deadline of `timeout_ms` milliseconds.
pub async fn with_timeout<F, T>(operation: F, timeout_ms: u64, context: TimeoutContext) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let deadline = validate_timeout(timeout_ms)?;

    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => {
            event!(
                Level::DEBUG,
                timeout_ms,
                operation = context.operation.as_deref().unwrap_or("<anonymous>"),
                "operation timed out"
            );
            Err(context.into_error(timeout_ms))
        }
    }
}

/// Like [`with_timeout`], but the operation receives a token that is
/// cancelled when the deadline fires.
pub async fn with_cancellation<F, Fut, T>(
    operation: F,
    timeout_ms: u64,
    context: TimeoutContext,
) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = validate_timeout(timeout_ms)?;
    let token = CancellationToken::new();
    let future = operation(token.clone());

    match tokio::time::timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => {
            token.cancel();
            event!(
                Level::DEBUG,
                timeout_ms,
                operation = context.operation.as_deref().unwrap_or("<anonymous>"),
                "operation cancelled after timeout"
            );
            Err(context.into_error(timeout_ms))
        }
    }
}
