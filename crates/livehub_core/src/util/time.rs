#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	system_time_to_ms(SystemTime::now())
}

pub fn system_time_to_ms(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Inverse of [`system_time_to_ms`]; negative values clamp to the epoch.
pub fn ms_to_system_time(ms: i64) -> SystemTime {
	UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}
