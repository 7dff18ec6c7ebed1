#![forbid(unsafe_code)]

use std::time::SystemTime;

use livehub_domain::{Actor, BroadcastId, EventKind};
use serde::Serialize;

/// Canonical audience event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
	/// Deterministic identity used by the dedup gate.
	pub signature: String,
	pub kind: EventKind,
	pub actor: Actor,
	/// Currency units carried by the event (gifts only; zero otherwise).
	pub value: u64,
	pub detail: EventDetail,
	/// Upstream payload, untouched.
	pub raw: serde_json::Value,
	pub timestamp: SystemTime,
}

impl Event {
	pub fn gift(&self) -> Option<&GiftDetail> {
		match &self.detail {
			EventDetail::Gift(g) => Some(g),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetail {
	Chat { text: String },
	Gift(GiftDetail),
	Follow,
	Like { count: u64 },
	Share,
	Join,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GiftDetail {
	pub gift_id: String,
	pub gift_name: String,
	pub unit_value: u64,
	pub repeat_count: u64,
	/// Whether upstream reports this gift as a multi-update combo.
	pub streakable: bool,
	pub repeat_end: bool,
	pub streak_id: Option<String>,
	/// Part of `repeat_count` already delivered by an earlier settle of the same combo.
	pub settled_before: u64,
}

/// One broadcast session as tracked by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
	pub identity: BroadcastId,
	/// Set once per genuine session; a resumed connection never overwrites it.
	pub started_at: Option<SystemTime>,
	pub is_active: bool,
}
