#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::pipeline::event::{Event, EventDetail};

pub const DEFAULT_STREAK_IDLE_TIMEOUT: Duration = Duration::from_secs(4);

/// How long a settled streak keeps a tombstone for late updates.
const CLOSED_RETENTION: Duration = Duration::from_secs(60);

/// Per-streak state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakState {
	Open { last_count: u64 },
	Closed,
}

#[derive(Debug)]
struct OpenStreak {
	last: Event,
	last_update: Instant,
	settled_before: u64,
}

#[derive(Debug, Clone, Copy)]
struct ClosedStreak {
	at: Instant,
	settled_count: u64,
	/// Closed by an end-flagged update rather than the idle timeout.
	ended: bool,
}

/// Settles multi-update gift combos into one event carrying the final count.
///
/// A settled combo leaves a tombstone with the count already delivered. Later updates
/// at or below that count are dropped; higher counts only deliver the difference.
#[derive(Debug)]
pub struct StreakCoalescer {
	idle_timeout: Duration,
	open: HashMap<String, OpenStreak>,
	closed: HashMap<String, ClosedStreak>,
}

impl Default for StreakCoalescer {
	fn default() -> Self {
		Self::new(DEFAULT_STREAK_IDLE_TIMEOUT)
	}
}

impl StreakCoalescer {
	pub fn new(idle_timeout: Duration) -> Self {
		Self {
			idle_timeout,
			open: HashMap::new(),
			closed: HashMap::new(),
		}
	}

	/// Key that groups updates of one combo; `None` for events forwarded as-is.
	pub fn streak_key(event: &Event) -> Option<(String, bool)> {
		let gift = event.gift()?;
		if !gift.streakable {
			return None;
		}
		Some(match &gift.streak_id {
			Some(id) => (format!("{}:{id}", event.actor.id), true),
			None => (format!("{}:{}", event.actor.id, gift.gift_id), false),
		})
	}

	pub fn state(&self, key: &str) -> StreakState {
		match self.open.get(key) {
			Some(s) => StreakState::Open {
				last_count: s.last.gift().map(|g| g.repeat_count).unwrap_or(0),
			},
			None => StreakState::Closed,
		}
	}

	pub fn open_len(&self) -> usize {
		self.open.len()
	}

	/// Feed one event; returns it when it should be forwarded now.
	pub fn offer(&mut self, event: Event, now: Instant) -> Option<Event> {
		let Some((key, explicit)) = Self::streak_key(&event) else {
			return Some(event);
		};
		let (count, repeat_end) = event.gift().map(|g| (g.repeat_count, g.repeat_end)).unwrap_or((0, false));

		let settled_before = match self.open.get(&key) {
			Some(open) => open.settled_before,
			None => match self.closed.get(&key).copied() {
				None => 0,
				Some(closed) if count > closed.settled_count => {
					debug!(streak = %key, settled = closed.settled_count, count, "late continuation of settled streak");
					closed.settled_count
				}
				// Without an id, a lower count (or a repeat of an ended combo) starts a new combo.
				Some(closed) if !explicit && (count < closed.settled_count || closed.ended) => {
					self.closed.remove(&key);
					0
				}
				Some(_) => {
					debug!(streak = %key, count, "dropping update already settled");
					return None;
				}
			},
		};

		if repeat_end {
			self.open.remove(&key);
			self.closed.insert(
				key,
				ClosedStreak {
					at: now,
					settled_count: count,
					ended: true,
				},
			);
			return Some(settle(event, settled_before));
		}

		self.closed.remove(&key);
		self.open.insert(
			key,
			OpenStreak {
				last: event,
				last_update: now,
				settled_before,
			},
		);
		None
	}

	/// Close streaks idle for at least the timeout; their last update is final.
	pub fn flush_expired(&mut self, now: Instant) -> Vec<Event> {
		self.closed
			.retain(|_, closed| now.saturating_duration_since(closed.at) < CLOSED_RETENTION);

		let mut expired: Vec<(String, Instant)> = self
			.open
			.iter()
			.filter(|(_, s)| now.saturating_duration_since(s.last_update) >= self.idle_timeout)
			.map(|(k, s)| (k.clone(), s.last_update))
			.collect();
		expired.sort_by_key(|(_, at)| *at);

		let mut out = Vec::with_capacity(expired.len());
		for (key, _) in expired {
			if let Some(s) = self.open.remove(&key) {
				debug!(streak = %key, "streak idle; settling with last count");
				self.closed.insert(
					key,
					ClosedStreak {
						at: now,
						settled_count: s.last.gift().map(|g| g.repeat_count).unwrap_or(0),
						ended: false,
					},
				);
				out.push(settle(s.last, s.settled_before));
			}
		}
		out
	}

	/// Settle every open streak, oldest first, and forget closed ids.
	pub fn drain_all(&mut self) -> Vec<Event> {
		let mut open: Vec<OpenStreak> = self.open.drain().map(|(_, s)| s).collect();
		open.sort_by_key(|s| s.last_update);
		self.closed.clear();
		open.into_iter().map(|s| settle(s.last, s.settled_before)).collect()
	}
}

/// Trim a continuation down to the part not yet delivered.
fn settle(mut event: Event, settled_before: u64) -> Event {
	if settled_before == 0 {
		return event;
	}
	if let EventDetail::Gift(g) = &mut event.detail {
		g.settled_before = settled_before;
		event.value = g.unit_value.saturating_mul(g.repeat_count.saturating_sub(settled_before));
	}
	event
}
