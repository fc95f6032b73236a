use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::{ChangeStream, CoordinationBackend};
use crate::error::{Error, Result};

/// Validate that an identifier is safe for use in key paths.
///
/// Identifiers (worker ids, cluster names, stream names) are interpolated
/// into key paths. Without validation, a name like `../../assignment/table`
/// could write to arbitrary keys.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::InvalidState(
            "identifier must be 1-128 characters".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidState(
            "identifier contains invalid characters (only alphanumeric, dash, underscore allowed)"
                .to_string(),
        ));
    }
    Ok(())
}

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Exponential backoff that doubles from `initial` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before retry number `attempt` (1-indexed). Attempt 0 is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(20);
        self.initial.saturating_mul(1u32 << shift).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Wait for the next change on `stream`, then keep draining changes that
/// arrive within `debounce` so a burst is handled as one.
///
/// Returns `Ok(false)` if cancelled, and an error if the watch ended.
pub async fn next_debounced_change(
    stream: &mut ChangeStream,
    debounce: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    // Wait for the first change
    tokio::select! {
        _ = cancel.cancelled() => return Ok(false),
        msg = stream.message() => {
            msg?.ok_or_else(|| Error::InvalidState("watch stream ended".to_string()))?;
        }
    }

    // Drain additional changes arriving within the debounce window
    let deadline = tokio::time::Instant::now() + debounce;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            _ = tokio::time::sleep_until(deadline) => return Ok(true),
            msg = stream.message() => {
                msg?.ok_or_else(|| Error::InvalidState("watch stream ended".to_string()))?;
            }
        }
    }
}

/// Re-establish a watch on `prefix`, retrying with `backoff` until it
/// succeeds. Returns `None` if cancelled first.
pub async fn rewatch(
    backend: &dyn CoordinationBackend,
    prefix: &str,
    backoff: Backoff,
    cancel: &CancellationToken,
) -> Option<ChangeStream> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(backoff.delay_for_attempt(attempt)) => {}
        }
        match backend.watch(prefix).await {
            Ok(stream) => return Some(stream),
            Err(e) => tracing::warn!(prefix, attempt, error = %e, "failed to re-establish watch"),
        }
    }
}
