//! Retry schedules shared by the context fetch and the storage upload.
//!
//! Both use a linear schedule: the wait before attempt `n + 1` is
//! `base * n`. The iterators plug straight into `tokio_retry::Retry`.

use std::time::Duration;

/// Delays between attempts for a bounded linear backoff.
///
/// `max_attempts` counts the first try, so the iterator yields
/// `max_attempts - 1` delays.
pub fn linear_backoff(base: Duration, max_attempts: u32) -> impl Iterator<Item = Duration> {
    (1..max_attempts.max(1)).map(move |attempt| base * attempt)
}
