#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

/// Exponential delay for the `attempt`-th retry (1-based), clamped to `[min, max]`.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.saturating_sub(1).min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

/// Spread `delay` uniformly over `delay ± delay * ratio`.
pub fn with_jitter(delay: Duration, ratio: f64) -> Duration {
	let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
	let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
	let window = ((delay_ms as f64) * ratio) as u64;
	if window == 0 {
		return delay;
	}
	let offset = rand::rng().random_range(0..=window.saturating_mul(2));
	Duration::from_millis(delay_ms.saturating_sub(window).saturating_add(offset))
}

/// Jittered backoff that never exceeds `max`.
pub fn jittered_backoff(attempt: u32, min: Duration, max: Duration, ratio: f64) -> Duration {
	with_jitter(backoff_delay(attempt, min, max), ratio).min(max)
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn delay_doubles_until_capped() {
		let min = Duration::from_millis(500);
		let max = Duration::from_secs(30);
		assert_eq!(backoff_delay(1, min, max), Duration::from_millis(500));
		assert_eq!(backoff_delay(2, min, max), Duration::from_millis(1000));
		assert_eq!(backoff_delay(4, min, max), Duration::from_millis(4000));
		assert_eq!(backoff_delay(12, min, max), max);
		assert_eq!(backoff_delay(u32::MAX, min, max), max);
	}

	#[test]
	fn zero_ratio_disables_jitter() {
		let d = Duration::from_millis(1234);
		assert_eq!(with_jitter(d, 0.0), d);
		assert_eq!(with_jitter(d, f64::NAN), d);
	}

	proptest! {
		#[test]
		fn jittered_backoff_stays_within_bounds(attempt in 1u32..64, ratio in 0.0f64..1.0) {
			let min = Duration::from_millis(200);
			let max = Duration::from_secs(10);
			let base = backoff_delay(attempt, min, max);
			let d = jittered_backoff(attempt, min, max, ratio);
			prop_assert!(d <= max);
			let spread = Duration::from_millis(((base.as_millis() as f64) * ratio) as u64 + 1);
			prop_assert!(d + spread >= base);
		}
	}
}
