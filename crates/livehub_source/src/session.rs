#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use livehub_domain::BroadcastId;
use tracing::debug;

/// Outcome of a successful connect, as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
	/// New broadcast session: stats reset, dedup cleared.
	Changed {
		identity: BroadcastId,
		previous: Option<BroadcastId>,
		started_at: Option<SystemTime>,
	},

	/// Transient reconnect to the same session: state preserved.
	Resumed {
		identity: BroadcastId,
		started_at: Option<SystemTime>,
	},
}

impl SessionTransition {
	pub fn identity(&self) -> &BroadcastId {
		match self {
			SessionTransition::Changed { identity, .. } | SessionTransition::Resumed { identity, .. } => identity,
		}
	}

	pub fn started_at(&self) -> Option<SystemTime> {
		match self {
			SessionTransition::Changed { started_at, .. } | SessionTransition::Resumed { started_at, .. } => *started_at,
		}
	}

	/// Whether the pipeline must reset its per-session state.
	pub fn resets(&self) -> bool {
		matches!(self, SessionTransition::Changed { .. })
	}
}

#[derive(Debug, Clone)]
struct KnownSession {
	identity: BroadcastId,
	started_at: Option<SystemTime>,
	last_seen: SystemTime,
	connected: bool,
}

/// Decides whether a connect continues the previous session or starts a new one.
#[derive(Debug, Clone)]
pub struct SessionTracker {
	grace: Duration,
	start_tolerance: Duration,
	current: Option<KnownSession>,
}

impl SessionTracker {
	pub const DEFAULT_START_TOLERANCE: Duration = Duration::from_secs(60);

	pub fn new(grace: Duration) -> Self {
		Self {
			grace,
			start_tolerance: Self::DEFAULT_START_TOLERANCE,
			current: None,
		}
	}

	pub fn with_start_tolerance(mut self, tolerance: Duration) -> Self {
		self.start_tolerance = tolerance;
		self
	}

	/// Seed from a persisted session (process restart).
	pub fn restore(&mut self, identity: BroadcastId, started_at: Option<SystemTime>, last_seen: SystemTime) {
		self.current = Some(KnownSession {
			identity,
			started_at,
			last_seen,
			connected: false,
		});
	}

	pub fn current_identity(&self) -> Option<&BroadcastId> {
		self.current.as_ref().map(|s| &s.identity)
	}

	pub fn on_connected(
		&mut self,
		identity: BroadcastId,
		authoritative_start: Option<SystemTime>,
		now: SystemTime,
	) -> SessionTransition {
		let transition = match self.current.take() {
			None => SessionTransition::Changed {
				identity: identity.clone(),
				previous: None,
				started_at: authoritative_start,
			},
			Some(prev) if prev.identity != identity => SessionTransition::Changed {
				identity: identity.clone(),
				previous: Some(prev.identity),
				started_at: authoritative_start,
			},
			Some(prev) => {
				let gap = if prev.connected {
					Duration::ZERO
				} else {
					now.duration_since(prev.last_seen).unwrap_or(Duration::ZERO)
				};
				let restarted = match (prev.started_at, authoritative_start) {
					(Some(known), Some(reported)) => abs_diff(known, reported) > self.start_tolerance,
					_ => false,
				};

				if gap > self.grace || restarted {
					debug!(identity = %identity, gap_secs = gap.as_secs(), restarted, "same identity but new session");
					SessionTransition::Changed {
						identity: identity.clone(),
						previous: Some(prev.identity),
						started_at: authoritative_start,
					}
				} else {
					SessionTransition::Resumed {
						identity: identity.clone(),
						started_at: prev.started_at.or(authoritative_start),
					}
				}
			}
		};

		self.current = Some(KnownSession {
			identity,
			started_at: transition.started_at(),
			last_seen: now,
			connected: true,
		});
		transition
	}

	pub fn on_disconnected(&mut self, now: SystemTime) {
		if let Some(s) = &mut self.current {
			s.last_seen = now;
			s.connected = false;
		}
	}
}

fn abs_diff(a: SystemTime, b: SystemTime) -> Duration {
	a.duration_since(b).or_else(|_| b.duration_since(a)).unwrap_or(Duration::ZERO)
}
