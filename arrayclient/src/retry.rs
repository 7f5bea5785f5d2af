//! Retry/backoff policy (spec.md §4.B "Request pipeline" table, §7
//! "Transient transport").
//!
//! Grounded in `trident`'s `io_utils::http::retriable_request_sender`, but
//! driven by an explicit attempt counter and a per-status policy rather
//! than a fixed wall-clock timeout: the array's retry table distinguishes
//! idempotent and non-idempotent methods, which a bare deadline can't.

use std::time::Duration;

use reqwest::Method;

/// `retry_delay × attempt`, per spec.md's table. `attempt` is 1-based.
pub fn backoff_delay(retry_delay: Duration, attempt: u32) -> Duration {
    retry_delay * attempt.max(1)
}

/// A 5xx on a non-idempotent POST is never retried (spec.md §4.B table);
/// every other idempotent verb retries 429/5xx.
pub fn is_idempotent(method: &Method) -> bool {
    method != Method::POST
}

/// The number of attempts (including the first) the client makes before
/// giving up on a retryable status.
pub const MAX_ATTEMPTS: u32 = 4;

/// Base delay multiplied by the attempt number for backoff.
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// A 401 is retried at most once, per spec.md's table ("401 (once)").
pub const MAX_AUTH_RETRIES: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_scales_linearly_with_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(300));
    }

    #[test]
    fn post_is_not_idempotent_everything_else_is() {
        assert!(!is_idempotent(&Method::POST));
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::PATCH));
        assert!(is_idempotent(&Method::PUT));
        assert!(is_idempotent(&Method::DELETE));
    }
}
