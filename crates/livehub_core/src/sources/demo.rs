#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use livehub_domain::BroadcastId;
use livehub_source::{
	ConnectionState, LiveSource, RawPayload, RoomInfo, SessionTracker, SourceControl, SourceControlRx, SourceEvent,
	SourceEventTx, new_connection_id,
};
use serde_json::json;
use tokio::time::Interval;
use tracing::{debug, info, warn};

/// Offline source that synthesizes chat, likes, follows and gift combos.
pub struct DemoSource {
	emit_interval: Duration,
	session_grace: Duration,
}

impl Default for DemoSource {
	fn default() -> Self {
		Self::new()
	}
}

impl DemoSource {
	pub fn new() -> Self {
		Self {
			emit_interval: Duration::from_millis(250),
			session_grace: Duration::from_secs(15 * 60),
		}
	}

	/// Customize emit interval (useful for tests).
	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = interval;
		self
	}

	/// Payload emitted on tick `n`. Every 8 ticks form one gift combo (counts 1..=3, the last one end-flagged).
	pub fn payload_for_tick(identity: &BroadcastId, n: u64) -> String {
		let viewer = n % 5;
		let user = json!({
			"userId": format!("demo-{viewer}"),
			"uniqueId": format!("demo_viewer_{viewer}"),
			"nickname": format!("Demo Viewer {viewer}"),
		});
		let msg_id = format!("demo-{}-{n}", identity.as_str());

		let mut body = match n % 8 {
			0 | 3 => json!({"type": "chat", "comment": format!("demo message #{n} for {identity}")}),
			1 => json!({"type": "like", "likeCount": 5}),
			2 => json!({"type": "join"}),
			4..=6 => {
				let combo = n / 8;
				let repeat = n % 8 - 3;
				json!({
					"type": "gift",
					"giftId": "5655",
					"giftName": "Rose",
					"diamondCount": 1,
					"repeatCount": repeat,
					"repeatEnd": repeat == 3,
					"streakable": true,
					"streakId": format!("demo-combo-{combo}"),
				})
			}
			_ => json!({"type": "follow"}),
		};

		if let Some(obj) = body.as_object_mut() {
			obj.insert("user".to_string(), user);
			obj.insert("msgId".to_string(), json!(msg_id));
		}
		body.to_string()
	}

	async fn go_online(tracker: &mut SessionTracker, identity: &BroadcastId, events_tx: &SourceEventTx, now: SystemTime) {
		let _ = events_tx.send(SourceEvent::State(ConnectionState::Connecting)).await;
		let transition = tracker.on_connected(identity.clone(), None, now);
		let _ = events_tx.send(SourceEvent::Session(transition)).await;
		let _ = events_tx
			.send(SourceEvent::RoomInfo(RoomInfo {
				room_id: Some(format!("demo-room-{identity}")),
				started_at: Some(now),
				viewers: 5,
				..RoomInfo::default()
			}))
			.await;
		let _ = events_tx.send(SourceEvent::State(ConnectionState::Connected)).await;
	}
}

#[async_trait]
impl LiveSource for DemoSource {
	fn name(&self) -> &'static str {
		"demo"
	}

	async fn run(self: Box<Self>, mut control_rx: SourceControlRx, events_tx: SourceEventTx) -> anyhow::Result<()> {
		let connection_id = new_connection_id();
		let mut tracker = SessionTracker::new(self.session_grace);
		let mut target: Option<BroadcastId> = None;
		let mut tick: u64 = 0;

		let mut interval: Interval = tokio::time::interval(self.emit_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		info!(%connection_id, "demo source started");
		debug!(interval_ms = self.emit_interval.as_millis() as u64, "demo source tick interval configured");

		loop {
			tokio::select! {
				_ = interval.tick() => {
					let Some(identity) = &target else { continue };
					let payload = RawPayload::new(Self::payload_for_tick(identity, tick));
					tick += 1;
					if events_tx.try_send(SourceEvent::Payload(payload)).is_err() {
						warn!("demo source events channel full; dropping payload");
					}
				}

				cmd = control_rx.recv() => {
					let Some(cmd) = cmd else {
						info!("demo source control channel closed; shutting down");
						break;
					};

					match cmd {
						SourceControl::Connect { identity } => {
							if target.as_ref() == Some(&identity) {
								continue;
							}
							if target.is_some() {
								tracker.on_disconnected(SystemTime::now());
								let _ = events_tx.send(SourceEvent::State(ConnectionState::Disconnected)).await;
							}
							info!(identity = %identity, "demo source connected");
							Self::go_online(&mut tracker, &identity, &events_tx, SystemTime::now()).await;
							target = Some(identity);
						}
						SourceControl::Disconnect => {
							if target.take().is_some() {
								tracker.on_disconnected(SystemTime::now());
								let _ = events_tx.send(SourceEvent::State(ConnectionState::Disconnected)).await;
							}
						}
						SourceControl::RestoreSession { identity, started_at, last_seen } => {
							tracker.restore(identity, started_at, last_seen);
						}
						SourceControl::Shutdown => {
							info!("demo source received Shutdown");
							break;
						}
					}
				}
			}
		}

		if target.is_some() {
			let _ = events_tx.send(SourceEvent::State(ConnectionState::Disconnected)).await;
		}
		Ok(())
	}
}
