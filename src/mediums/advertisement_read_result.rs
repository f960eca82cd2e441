//! BLE GATT-read retry backoff (§4.7): "BLE reads are retried with
//! exponential backoff... success resets the backoff; a `kRetry` fires only
//! after the backoff has elapsed since the last failure timestamp."

use std::time::{Duration, Instant};

/// What the caller should do about the next read attempt for one GATT
/// characteristic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadAction {
    /// Nothing has been attempted yet, or the backoff has elapsed: retry
    /// now.
    Retry,
    /// The backoff has not yet elapsed since the last failure.
    TooSoon,
    /// The previous attempt at this characteristic already succeeded;
    /// nothing to retry.
    PreviouslySucceeded,
}

/// Exponential backoff parameters (§4.7 defaults: base 1s, multiplier 2,
/// max 5 min).
#[derive(Clone, Copy, Debug)]
pub struct BackoffParams {
    pub base: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), multiplier: 2, max: Duration::from_secs(5 * 60) }
    }
}

impl BackoffParams {
    /// `base * multiplier^(failures-1)`, capped at `max` (§4.7).
    #[must_use]
    pub fn backoff_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures - 1;
        let multiplier = self.multiplier.saturating_pow(exponent);
        self.base.saturating_mul(multiplier).min(self.max)
    }
}

/// Per-characteristic read retry state.
#[derive(Debug)]
pub struct AdvertisementReadResult {
    params: BackoffParams,
    failures: u32,
    last_failure: Option<Instant>,
    succeeded: bool,
}

impl AdvertisementReadResult {
    #[must_use]
    pub fn new(params: BackoffParams) -> Self {
        Self { params, failures: 0, last_failure: None, succeeded: false }
    }

    /// Records a successful read: resets the backoff (§4.7).
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_failure = None;
        self.succeeded = true;
    }

    /// Records a failed read at `now`, incrementing the failure count.
    pub fn record_failure_at(&mut self, now: Instant) {
        self.failures += 1;
        self.last_failure = Some(now);
    }

    /// Decides what to do about the next attempt, evaluated at `now`.
    #[must_use]
    pub fn evaluate_at(&self, now: Instant) -> ReadAction {
        if self.succeeded {
            return ReadAction::PreviouslySucceeded;
        }
        match self.last_failure {
            None => ReadAction::Retry,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                let required = self.params.backoff_after(self.failures);
                if elapsed >= required {
                    ReadAction::Retry
                } else {
                    ReadAction::TooSoon
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let params = BackoffParams::default();
        assert_eq!(params.backoff_after(0), Duration::ZERO);
        assert_eq!(params.backoff_after(1), Duration::from_secs(1));
        assert_eq!(params.backoff_after(2), Duration::from_secs(2));
        assert_eq!(params.backoff_after(3), Duration::from_secs(4));
        assert_eq!(params.backoff_after(30), Duration::from_secs(5 * 60));
    }

    #[test]
    fn first_attempt_is_always_a_retry() {
        let result = AdvertisementReadResult::new(BackoffParams::default());
        assert_eq!(result.evaluate_at(Instant::now()), ReadAction::Retry);
    }

    #[test]
    fn failure_blocks_retry_until_backoff_elapses() {
        let mut result = AdvertisementReadResult::new(BackoffParams {
            base: Duration::from_millis(10),
            multiplier: 2,
            max: Duration::from_secs(5),
        });
        let t0 = Instant::now();
        result.record_failure_at(t0);
        assert_eq!(result.evaluate_at(t0), ReadAction::TooSoon);
        assert_eq!(result.evaluate_at(t0 + Duration::from_millis(20)), ReadAction::Retry);
    }

    #[test]
    fn success_resets_backoff_and_future_evaluations() {
        let mut result = AdvertisementReadResult::new(BackoffParams::default());
        result.record_failure_at(Instant::now());
        result.record_success();
        assert_eq!(result.evaluate_at(Instant::now()), ReadAction::PreviouslySucceeded);
    }
}
