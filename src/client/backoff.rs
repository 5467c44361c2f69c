//! Backoff policies for the retry engine.

use crate::config::BackoffType;
use http::HeaderMap;
use rand::Rng;
use std::time::Duration;

/// Parses an integer-seconds `Retry-After` header.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Computes the delay before retry number `attempt` (0-indexed), clamped to
/// `[wait_min, wait_max]`.
///
/// Exponential doubles the minimum wait per attempt; linear grows it by one
/// minimum wait per attempt. Both are jittered.
pub fn delay(kind: BackoffType, wait_min: Duration, wait_max: Duration, attempt: u32) -> Duration {
    let base_ms = wait_min.as_millis() as f64;
    let raw_ms = match kind {
        BackoffType::Exponential => base_ms * 2f64.powi(attempt.min(31) as i32),
        BackoffType::Linear => base_ms * f64::from(attempt + 1),
    };

    // Jitter: random factor between 0.5x and 1.5x.
    let jittered = raw_ms * rand::thread_rng().gen_range(0.5..1.5);
    let clamped = jittered
        .max(wait_min.as_millis() as f64)
        .min(wait_max.as_millis() as f64);

    Duration::from_millis(clamped as u64)
}
