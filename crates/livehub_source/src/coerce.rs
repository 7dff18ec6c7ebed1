#![forbid(unsafe_code)]

//! Lenient extraction of values from loosely-typed upstream JSON.
//!
//! Missing, negative, non-finite or unparseable numbers coerce to zero.

use std::time::{Duration, SystemTime};

use serde_json::Value;

/// First non-null value among `keys` in `obj`.
pub fn field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
	keys.iter().filter_map(|k| obj.get(*k)).find(|v| !v.is_null())
}

pub fn as_u64(v: Option<&Value>) -> u64 {
	match v {
		Some(Value::Number(n)) => {
			if let Some(u) = n.as_u64() {
				u
			} else if n.as_i64().is_some() {
				0
			} else {
				n.as_f64().map(float_to_u64).unwrap_or(0)
			}
		}
		Some(Value::String(s)) => parse_u64(s),
		_ => 0,
	}
}

pub fn as_bool(v: Option<&Value>) -> bool {
	match v {
		Some(Value::Bool(b)) => *b,
		Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
		Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
		_ => false,
	}
}

/// Non-empty trimmed string; numbers are stringified (upstream ids arrive both ways).
pub fn as_string(v: Option<&Value>) -> Option<String> {
	match v {
		Some(Value::String(s)) => {
			let s = s.trim();
			(!s.is_empty()).then(|| s.to_string())
		}
		Some(Value::Number(n)) => Some(n.to_string()),
		_ => None,
	}
}

/// Epoch seconds, epoch milliseconds (> 1e12) or RFC 3339.
pub fn as_timestamp(v: Option<&Value>) -> Option<SystemTime> {
	match v {
		Some(Value::Number(_)) => epoch_to_time(as_u64(v)),
		Some(Value::String(s)) => {
			let s = s.trim();
			if s.is_empty() {
				return None;
			}
			if s.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
				return epoch_to_time(parse_u64(s));
			}
			chrono::DateTime::parse_from_rfc3339(s)
				.ok()
				.and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
				.map(|ms| SystemTime::UNIX_EPOCH + Duration::from_millis(ms))
		}
		_ => None,
	}
}

fn epoch_to_time(raw: u64) -> Option<SystemTime> {
	if raw == 0 {
		return None;
	}
	let d = if raw > 1_000_000_000_000 {
		Duration::from_millis(raw)
	} else {
		Duration::from_secs(raw)
	};
	SystemTime::UNIX_EPOCH.checked_add(d)
}

fn parse_u64(s: &str) -> u64 {
	let s = s.trim();
	s.parse::<u64>()
		.ok()
		.or_else(|| s.parse::<f64>().ok().map(float_to_u64))
		.unwrap_or(0)
}

fn float_to_u64(f: f64) -> u64 {
	if f.is_finite() && f > 0.0 {
		// `as` saturates at u64::MAX.
		f as u64
	} else {
		0
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;
	use serde_json::json;

	use super::*;

	#[test]
	fn numbers_coerce_defensively() {
		assert_eq!(as_u64(Some(&json!(42))), 42);
		assert_eq!(as_u64(Some(&json!("17"))), 17);
		assert_eq!(as_u64(Some(&json!(" 3.9 "))), 3);
		assert_eq!(as_u64(Some(&json!(-5))), 0);
		assert_eq!(as_u64(Some(&json!("-5"))), 0);
		assert_eq!(as_u64(Some(&json!("NaN"))), 0);
		assert_eq!(as_u64(Some(&json!("inf"))), 0);
		assert_eq!(as_u64(Some(&json!("abc"))), 0);
		assert_eq!(as_u64(Some(&json!(true))), 0);
		assert_eq!(as_u64(None), 0);
	}

	#[test]
	fn field_skips_nulls_and_honours_alias_order() {
		let v = json!({"a": null, "b": 2, "c": 3});
		assert_eq!(field(&v, &["a", "b", "c"]), Some(&json!(2)));
		assert_eq!(field(&v, &["x"]), None);
	}

	#[test]
	fn timestamps_accept_seconds_millis_and_rfc3339() {
		let secs = as_timestamp(Some(&json!(1_700_000_000u64))).unwrap();
		let millis = as_timestamp(Some(&json!(1_700_000_000_000u64))).unwrap();
		let text = as_timestamp(Some(&json!("2023-11-14T22:13:20Z"))).unwrap();
		assert_eq!(secs, millis);
		assert_eq!(secs, text);
		assert_eq!(as_timestamp(Some(&json!(0))), None);
		assert_eq!(as_timestamp(Some(&json!("yesterday"))), None);
	}

	#[test]
	fn strings_and_bools() {
		assert_eq!(as_string(Some(&json!(  12345 ))), Some("12345".to_string()));
		assert_eq!(as_string(Some(&json!("  "))), None);
		assert!(as_bool(Some(&json!("true"))));
		assert!(as_bool(Some(&json!(1))));
		assert!(!as_bool(Some(&json!("nope"))));
	}

	proptest! {
		#[test]
		fn arbitrary_strings_never_panic(s in ".*") {
			let _ = as_u64(Some(&Value::String(s.clone())));
			let _ = as_timestamp(Some(&Value::String(s)));
		}

		#[test]
		fn floats_never_go_negative(f in any::<f64>()) {
			let v = serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
			let out = as_u64(Some(&v));
			if !(f.is_finite() && f > 0.0) {
				prop_assert_eq!(out, 0);
			}
		}
	}
}
