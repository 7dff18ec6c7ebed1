#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use livehub_domain::{Actor, EventKind};
use livehub_source::RawPayload;
use livehub_source::coerce::{as_bool, as_string, as_timestamp, as_u64, field};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::pipeline::event::{Event, EventDetail, GiftDetail};

pub const DEFAULT_SIGNATURE_BUCKET: Duration = Duration::from_secs(5);

/// Malformed upstream payload. Logged and dropped by the pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
	#[error("payload is not valid json: {0}")]
	InvalidJson(String),
	#[error("payload is not a json object")]
	NotAnObject,
	#[error("payload has no type")]
	MissingType,
	#[error("unknown event type: {0}")]
	UnknownType(String),
	#[error("payload has no actor id")]
	MissingActor,
}

impl NormalizeError {
	/// Short label for metrics.
	pub fn reason(&self) -> &'static str {
		match self {
			NormalizeError::InvalidJson(_) => "invalid_json",
			NormalizeError::NotAnObject => "not_object",
			NormalizeError::MissingType => "missing_type",
			NormalizeError::UnknownType(_) => "unknown_type",
			NormalizeError::MissingActor => "missing_actor",
		}
	}
}

/// Maps loosely-typed upstream JSON into canonical [`Event`]s.
#[derive(Debug, Clone)]
pub struct Normalizer {
	signature_bucket: Duration,
}

impl Default for Normalizer {
	fn default() -> Self {
		Self::new(DEFAULT_SIGNATURE_BUCKET)
	}
}

impl Normalizer {
	pub fn new(signature_bucket: Duration) -> Self {
		Self {
			signature_bucket: signature_bucket.max(Duration::from_millis(1)),
		}
	}

	pub fn normalize(&self, payload: &RawPayload) -> Result<Event, NormalizeError> {
		let raw: Value = serde_json::from_str(&payload.text).map_err(|e| NormalizeError::InvalidJson(e.to_string()))?;
		self.normalize_value(raw, payload.received_at)
	}

	pub fn normalize_value(&self, raw: Value, received_at: SystemTime) -> Result<Event, NormalizeError> {
		if !raw.is_object() {
			return Err(NormalizeError::NotAnObject);
		}

		let kind_str = as_string(field(&raw, &["type", "event"])).ok_or(NormalizeError::MissingType)?;
		let kind: EventKind = kind_str.parse().map_err(|_| NormalizeError::UnknownType(kind_str.clone()))?;

		let actor = extract_actor(&raw).ok_or(NormalizeError::MissingActor)?;
		let timestamp = as_timestamp(field(&raw, &["timestamp", "createTime", "create_time"])).unwrap_or(received_at);
		let msg_id = as_string(field(&raw, &["msgId", "msg_id", "messageId"]));

		let (detail, value, content) = match kind {
			EventKind::Chat => {
				let text = as_string(field(&raw, &["comment", "text", "content"])).unwrap_or_default();
				let content = text.to_lowercase();
				(EventDetail::Chat { text }, 0, content)
			}
			EventKind::Gift => {
				let gift = extract_gift(&raw);
				let value = gift.unit_value.saturating_mul(gift.repeat_count);
				let content = format!(
					"{}|{}|{}",
					gift.gift_id,
					gift.repeat_count,
					gift.streak_id.as_deref().unwrap_or_default()
				);
				(EventDetail::Gift(gift), value, content)
			}
			EventKind::Like => {
				let count = as_u64(field(&raw, &["likeCount", "like_count", "count"])).max(1);
				(EventDetail::Like { count }, 0, count.to_string())
			}
			EventKind::Follow => (EventDetail::Follow, 0, String::new()),
			EventKind::Share => (EventDetail::Share, 0, String::new()),
			EventKind::Join => (EventDetail::Join, 0, String::new()),
		};

		// Upstream message ids are the strongest identity when present.
		let content = match msg_id {
			Some(id) => format!("{content}|{id}"),
			None => content,
		};

		let signature = event_signature(kind, &actor.id, &content, timestamp, self.signature_bucket);

		Ok(Event {
			signature,
			kind,
			actor,
			value,
			detail,
			raw,
			timestamp,
		})
	}
}

/// Hex sha256 over `(actor, kind, sha256(content), timestamp bucket)`.
pub fn event_signature(kind: EventKind, actor_id: &str, content: &str, timestamp: SystemTime, bucket: Duration) -> String {
	let content_hash = Sha256::digest(content.as_bytes());
	let bucket_ms = bucket.as_millis().max(1);
	let ts_ms = timestamp.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis();

	let mut hasher = Sha256::new();
	hasher.update(actor_id.as_bytes());
	hasher.update(b"|");
	hasher.update(kind.as_str().as_bytes());
	hasher.update(b"|");
	hasher.update(content_hash);
	hasher.update(b"|");
	hasher.update((ts_ms / bucket_ms).to_be_bytes());
	to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
	use std::fmt::Write;

	let mut out = String::with_capacity(bytes.len() * 2);
	for b in bytes {
		let _ = write!(out, "{b:02x}");
	}
	out
}

fn extract_actor(raw: &Value) -> Option<Actor> {
	let user = field(raw, &["user", "author"]).filter(|u| u.is_object());
	let from = |keys: &[&str]| user.and_then(|u| as_string(field(u, keys))).or_else(|| as_string(field(raw, keys)));

	let unique_id = from(&["uniqueId", "unique_id", "login"]);
	let id = from(&["userId", "user_id", "id"]).or_else(|| unique_id.clone())?;
	let display_name = from(&["nickname", "displayName", "display_name"])
		.or(unique_id)
		.unwrap_or_else(|| id.clone());
	Some(Actor::new(id, display_name))
}

fn extract_gift(raw: &Value) -> GiftDetail {
	let gift = field(raw, &["gift"]).filter(|g| g.is_object());
	let from = |keys: &[&str]| gift.and_then(|g| field(g, keys)).or_else(|| field(raw, keys));

	let gift_id = as_string(from(&["giftId", "gift_id", "id"])).unwrap_or_default();
	let gift_name = as_string(from(&["giftName", "gift_name", "name"])).unwrap_or_else(|| "gift".to_string());
	let unit_value = as_u64(from(&["diamondCount", "diamond_count", "unitValue", "value"]));
	let repeat_count = as_u64(from(&["repeatCount", "repeat_count"])).max(1);
	let repeat_end = as_bool(from(&["repeatEnd", "repeat_end"]));
	let streakable = as_bool(from(&["streakable"])) || as_u64(from(&["giftType", "gift_type"])) == 1;
	let streak_id = as_string(from(&["streakId", "streak_id", "groupId", "group_id"]));

	GiftDetail {
		gift_id,
		gift_name,
		unit_value,
		repeat_count,
		streakable,
		repeat_end,
		streak_id,
		settled_before: 0,
	}
}
