#![forbid(unsafe_code)]

use livehub_domain::EventKind;
use livehub_source::RoomInfo;
use serde::{Deserialize, Serialize};

use crate::pipeline::event::{Event, EventDetail};
use crate::util::time::unix_ms_now;

/// Cumulative per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
	pub viewers: u64,
	pub likes: u64,
	pub total_value: u64,
	pub followers: u64,
	pub shares: u64,
	pub gifts: u64,
	pub updated_at_ms: i64,
}

/// Single owner of the running counters.
#[derive(Debug, Default)]
pub struct StatsAggregator {
	current: StatsSnapshot,
}

impl StatsAggregator {
	pub fn snapshot(&self) -> StatsSnapshot {
		self.current
	}

	/// Account one published (deduplicated, settled) event.
	pub fn record(&mut self, event: &Event) {
		let s = &mut self.current;
		match (&event.kind, &event.detail) {
			(EventKind::Like, EventDetail::Like { count }) => s.likes = s.likes.saturating_add(*count),
			(EventKind::Gift, detail) => {
				// A late continuation of a settled combo adds value, not another gift.
				if !matches!(detail, EventDetail::Gift(g) if g.settled_before > 0) {
					s.gifts = s.gifts.saturating_add(1);
				}
				s.total_value = s.total_value.saturating_add(event.value);
			}
			(EventKind::Follow, _) => s.followers = s.followers.saturating_add(1),
			(EventKind::Share, _) => s.shares = s.shares.saturating_add(1),
			_ => return,
		}
		s.updated_at_ms = unix_ms_now();
	}

	/// Viewers track the room; room-wide totals only ever raise our counters.
	pub fn apply_room_info(&mut self, info: &RoomInfo) {
		let s = &mut self.current;
		s.viewers = info.viewers;
		s.likes = s.likes.max(info.likes);
		s.total_value = s.total_value.max(info.coins);
		s.updated_at_ms = unix_ms_now();
	}

	/// New session: every counter back to zero.
	pub fn reset(&mut self) {
		self.current = StatsSnapshot {
			updated_at_ms: unix_ms_now(),
			..StatsSnapshot::default()
		};
	}

	/// Resumed session: adopt a previously persisted snapshot.
	pub fn restore(&mut self, snapshot: StatsSnapshot) {
		self.current = snapshot;
	}
}

#[cfg(test)]
mod tests {
	use std::time::SystemTime;

	use livehub_domain::Actor;

	use super::*;
	use crate::pipeline::event::GiftDetail;

	fn event(kind: EventKind, detail: EventDetail, value: u64) -> Event {
		Event {
			signature: "sig".to_string(),
			kind,
			actor: Actor::new("u1", "User"),
			value,
			detail,
			raw: serde_json::Value::Null,
			timestamp: SystemTime::now(),
		}
	}

	#[test]
	fn counters_follow_event_kinds() {
		let mut agg = StatsAggregator::default();
		agg.record(&event(EventKind::Like, EventDetail::Like { count: 15 }, 0));
		agg.record(&event(EventKind::Follow, EventDetail::Follow, 0));
		agg.record(&event(EventKind::Share, EventDetail::Share, 0));
		agg.record(&event(EventKind::Chat, EventDetail::Chat { text: "hi".into() }, 0));
		agg.record(&event(
			EventKind::Gift,
			EventDetail::Gift(GiftDetail {
				gift_id: "5655".into(),
				gift_name: "Rose".into(),
				unit_value: 50,
				repeat_count: 5,
				streakable: true,
				repeat_end: true,
				streak_id: None,
				settled_before: 0,
			}),
			250,
		));

		let s = agg.snapshot();
		assert_eq!((s.likes, s.followers, s.shares, s.gifts, s.total_value), (15, 1, 1, 1, 250));
		assert!(s.updated_at_ms > 0);
	}

	#[test]
	fn combo_continuation_adds_value_but_not_another_gift() {
		let mut agg = StatsAggregator::default();
		let rose = |repeat_count, settled_before| GiftDetail {
			gift_id: "5655".into(),
			gift_name: "Rose".into(),
			unit_value: 50,
			repeat_count,
			streakable: true,
			repeat_end: settled_before > 0,
			streak_id: None,
			settled_before,
		};
		agg.record(&event(EventKind::Gift, EventDetail::Gift(rose(2, 0)), 100));
		agg.record(&event(EventKind::Gift, EventDetail::Gift(rose(5, 2)), 150));

		let s = agg.snapshot();
		assert_eq!((s.gifts, s.total_value), (1, 250));
	}

	#[test]
	fn room_info_sets_viewers_and_never_lowers_totals() {
		let mut agg = StatsAggregator::default();
		agg.record(&event(EventKind::Like, EventDetail::Like { count: 40 }, 0));
		agg.apply_room_info(&RoomInfo {
			viewers: 12,
			likes: 10,
			coins: 300,
			..RoomInfo::default()
		});

		let s = agg.snapshot();
		assert_eq!(s.viewers, 12);
		assert_eq!(s.likes, 40);
		assert_eq!(s.total_value, 300);
	}

	#[test]
	fn reset_and_restore() {
		let mut agg = StatsAggregator::default();
		agg.record(&event(EventKind::Follow, EventDetail::Follow, 0));
		let saved = agg.snapshot();

		agg.reset();
		assert_eq!(agg.snapshot().followers, 0);

		agg.restore(saved);
		assert_eq!(agg.snapshot(), saved);
	}
}
