//! Retry schedule for transient executor failures.

use std::time::Duration;

/// Exponential backoff with a hard attempt ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub base: Duration,
	pub cap: Duration,
	pub max_attempts: u32,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base: Duration::from_secs(1),
			cap: Duration::from_secs(300),
			max_attempts: 16,
		}
	}
}

impl RetryPolicy {
	/// Delay before attempt number `attempt` (1-based: the first retry
	/// waits the base delay).
	pub fn delay(&self, attempt: u32) -> Duration {
		let exp = attempt.saturating_sub(1).min(31);
		let delay = self.base.saturating_mul(2u32.saturating_pow(exp));
		delay.min(self.cap)
	}

	/// Whether a document with `errors` failures is out of attempts.
	pub fn exhausted(&self, errors: u32) -> bool {
		errors >= self.max_attempts
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn schedule_doubles_from_base_and_caps() {
		let policy = RetryPolicy::default();
		assert_eq!(policy.delay(1), Duration::from_secs(1));
		assert_eq!(policy.delay(2), Duration::from_secs(2));
		assert_eq!(policy.delay(3), Duration::from_secs(4));
		assert_eq!(policy.delay(9), Duration::from_secs(256));
		// Capped at five minutes from then on.
		assert_eq!(policy.delay(10), Duration::from_secs(300));
		assert_eq!(policy.delay(31), Duration::from_secs(300));
	}

	#[test]
	fn exhaustion_at_sixteen_attempts() {
		let policy = RetryPolicy::default();
		assert!(!policy.exhausted(15));
		assert!(policy.exhausted(16));
	}
}
