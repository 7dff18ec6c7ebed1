#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use livehub_domain::{BroadcastId, EventKind, PluginId, ProfileId};
use livehub_source::{
	LiveSource, RawPayload, RoomInfo, SessionTransition, SourceControl, SourceControlRx, SourceEvent, SourceEventTx,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

use crate::pipeline::event::Event;
use crate::pipeline::manager::{Pipeline, PipelineConfig, PipelineError, PipelineHandle};
use crate::pipeline::stats::StatsSnapshot;
use crate::pipeline::store::{BoxFuture, InMemoryStatsStore, PersistedStats, StatsStore, StoreOpener, in_memory_store_opener};

/// Forwards scripted events and records every control message it receives.
struct ScriptedSource {
	script: mpsc::UnboundedReceiver<SourceEvent>,
	controls: mpsc::UnboundedSender<SourceControl>,
}

#[async_trait]
impl LiveSource for ScriptedSource {
	fn name(&self) -> &'static str {
		"scripted"
	}

	async fn run(self: Box<Self>, mut control_rx: SourceControlRx, events_tx: SourceEventTx) -> anyhow::Result<()> {
		let ScriptedSource { mut script, controls } = *self;
		let mut script_open = true;
		loop {
			tokio::select! {
				ev = script.recv(), if script_open => match ev {
					Some(ev) => {
						if events_tx.send(ev).await.is_err() {
							break;
						}
					}
					None => script_open = false,
				},
				cmd = control_rx.recv() => match cmd {
					Some(SourceControl::Shutdown) | None => {
						let _ = controls.send(SourceControl::Shutdown);
						break;
					}
					Some(cmd) => {
						let _ = controls.send(cmd);
					}
				},
			}
		}
		Ok(())
	}
}

struct Harness {
	handle: PipelineHandle,
	script: mpsc::UnboundedSender<SourceEvent>,
	controls: mpsc::UnboundedReceiver<SourceControl>,
}

impl Harness {
	async fn start(cfg: PipelineConfig, store: Arc<dyn StatsStore>, opener: StoreOpener) -> Self {
		let (script_tx, script_rx) = mpsc::unbounded_channel();
		let (controls_tx, controls_rx) = mpsc::unbounded_channel();
		let source = ScriptedSource {
			script: script_rx,
			controls: controls_tx,
		};
		let handle = Pipeline::start(cfg, Box::new(source), store, opener).await;
		Self {
			handle,
			script: script_tx,
			controls: controls_rx,
		}
	}

	fn push(&self, ev: SourceEvent) {
		self.script.send(ev).expect("scripted source alive");
	}
}

fn test_config() -> PipelineConfig {
	PipelineConfig {
		streak_sweep_interval: Duration::from_millis(20),
		..PipelineConfig::default()
	}
}

fn bid(id: &str) -> BroadcastId {
	BroadcastId::new(id).expect("valid BroadcastId")
}

fn profile(id: &str) -> ProfileId {
	ProfileId::new(id).expect("valid ProfileId")
}

fn changed(id: &str) -> SourceEvent {
	SourceEvent::Session(SessionTransition::Changed {
		identity: bid(id),
		previous: None,
		started_at: Some(SystemTime::now()),
	})
}

fn resumed(id: &str) -> SourceEvent {
	SourceEvent::Session(SessionTransition::Resumed {
		identity: bid(id),
		started_at: None,
	})
}

fn payload(v: serde_json::Value) -> SourceEvent {
	SourceEvent::Payload(RawPayload::new(v.to_string()))
}

fn like(user: &str, count: u64, msg_id: &str) -> SourceEvent {
	payload(json!({"type": "like", "likeCount": count, "msgId": msg_id, "user": {"userId": user}}))
}

fn gift_update(user: &str, count: u64, end: bool) -> SourceEvent {
	payload(json!({
		"type": "gift",
		"giftId": "5655",
		"giftName": "Rose",
		"diamondCount": 50,
		"repeatCount": count,
		"repeatEnd": end,
		"streakable": true,
		"user": {"userId": user},
	}))
}

fn stored(likes: u64, identity: &str) -> PersistedStats {
	PersistedStats {
		snapshot: StatsSnapshot {
			likes,
			updated_at_ms: crate::util::time::unix_ms_now(),
			..StatsSnapshot::default()
		},
		identity: Some(bid(identity)),
		started_at_ms: None,
		last_seen_ms: crate::util::time::unix_ms_now(),
	}
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(2);
	while !cond() {
		assert!(Instant::now() < deadline, "timed out waiting for {what}");
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

async fn stored_eventually(store: &dyn StatsStore, cond: impl Fn(&PersistedStats) -> bool) -> PersistedStats {
	let deadline = Instant::now() + Duration::from_secs(2);
	loop {
		if let Some(record) = store.load().await.expect("load")
			&& cond(&record)
		{
			return record;
		}
		assert!(Instant::now() < deadline, "timed out waiting for persisted stats");
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

#[tokio::test]
async fn stored_session_seeds_source_before_connect() {
	let store = Arc::new(InMemoryStatsStore::with_record(stored(25, "streamer")));
	let cfg = PipelineConfig {
		identity: Some(bid("@Streamer")),
		..test_config()
	};
	let mut h = Harness::start(cfg, store, in_memory_store_opener()).await;

	let first = timeout(Duration::from_secs(1), h.controls.recv())
		.await
		.expect("control in time")
		.expect("control");
	assert!(
		matches!(&first, SourceControl::RestoreSession { identity, .. } if identity.as_str() == "streamer"),
		"unexpected first control: {first:?}"
	);

	let second = timeout(Duration::from_secs(1), h.controls.recv())
		.await
		.expect("control in time")
		.expect("control");
	assert!(matches!(second, SourceControl::Connect { .. }), "unexpected control: {second:?}");

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn resume_after_restart_restores_persisted_stats() {
	let store = Arc::new(InMemoryStatsStore::with_record(stored(25, "streamer")));
	let h = Harness::start(test_config(), store, in_memory_store_opener()).await;

	h.push(resumed("streamer"));
	h.push(like("u1", 5, "m1"));

	let stats = h.handle.watch_stats();
	eventually("likes to build on restored total", || stats.borrow().likes == 30).await;
	assert_eq!(h.handle.session().map(|s| s.identity), Some(bid("streamer")));

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn resume_of_unknown_identity_starts_from_zero() {
	let store = Arc::new(InMemoryStatsStore::with_record(stored(25, "someone_else")));
	let h = Harness::start(test_config(), store, in_memory_store_opener()).await;

	h.push(resumed("streamer"));
	h.push(like("u1", 5, "m1"));

	let stats = h.handle.watch_stats();
	eventually("fresh counters", || stats.borrow().likes == 5).await;

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn malformed_payloads_are_dropped() {
	let store = Arc::new(InMemoryStatsStore::default());
	let h = Harness::start(test_config(), store, in_memory_store_opener()).await;

	h.push(changed("streamer"));
	h.push(SourceEvent::Payload(RawPayload::new("not json at all")));
	h.push(payload(json!({"type": "dance", "user": {"userId": "1"}})));
	h.push(payload(json!({"type": "follow"})));
	h.push(payload(json!({"type": "follow", "user": {"userId": "1"}})));

	let stats = h.handle.watch_stats();
	eventually("valid follow after garbage", || stats.borrow().followers == 1).await;

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn room_info_sets_viewers_and_fills_missing_start() {
	let store = Arc::new(InMemoryStatsStore::default());
	let h = Harness::start(test_config(), store, in_memory_store_opener()).await;

	let started = SystemTime::now() - Duration::from_secs(600);
	h.push(SourceEvent::Session(SessionTransition::Changed {
		identity: bid("streamer"),
		previous: None,
		started_at: None,
	}));
	h.push(SourceEvent::RoomInfo(RoomInfo {
		started_at: Some(started),
		viewers: 321,
		..RoomInfo::default()
	}));

	let stats = h.handle.watch_stats();
	eventually("viewers from room info", || stats.borrow().viewers == 321).await;
	assert_eq!(h.handle.session().and_then(|s| s.started_at), Some(started));

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn disconnect_persists_and_marks_session_inactive() {
	let store = Arc::new(InMemoryStatsStore::default());
	let h = Harness::start(test_config(), store.clone(), in_memory_store_opener()).await;

	h.push(changed("streamer"));
	h.push(SourceEvent::State(livehub_source::ConnectionState::Connected));
	h.push(like("u1", 7, "m1"));
	h.push(SourceEvent::State(livehub_source::ConnectionState::Disconnected));

	let session = h.handle.clone();
	eventually("inactive session", || session.session().is_some_and(|s| !s.is_active)).await;

	let record = stored_eventually(store.as_ref(), |r| r.snapshot.likes == 7).await;
	assert_eq!(record.identity, Some(bid("streamer")));

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn quiet_stream_persists_disconnect_time_as_last_seen() {
	let store = Arc::new(InMemoryStatsStore::default());
	let h = Harness::start(test_config(), store.clone(), in_memory_store_opener()).await;

	h.push(changed("streamer"));
	h.push(like("u1", 1, "m1"));
	let stats = h.handle.watch_stats();
	eventually("like counted", || stats.borrow().likes == 1).await;

	tokio::time::sleep(Duration::from_millis(300)).await;
	let before_disconnect = crate::util::time::unix_ms_now();
	h.push(SourceEvent::State(livehub_source::ConnectionState::Disconnected));

	let record = stored_eventually(store.as_ref(), |r| r.last_seen_ms >= before_disconnect).await;
	assert!(
		record.snapshot.updated_at_ms < before_disconnect,
		"counters were idle, only last_seen advances"
	);
	assert_eq!(record.last_seen(), crate::util::time::ms_to_system_time(record.last_seen_ms));

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn restore_session_carries_last_write_time_not_last_counter_change() {
	let mut record = stored(25, "streamer");
	record.snapshot.updated_at_ms -= 2 * 60 * 60 * 1000;
	let written = record.last_seen_ms;
	let store = Arc::new(InMemoryStatsStore::with_record(record));
	let mut h = Harness::start(test_config(), store, in_memory_store_opener()).await;

	let first = timeout(Duration::from_secs(1), h.controls.recv())
		.await
		.expect("control in time")
		.expect("control");
	match first {
		SourceControl::RestoreSession { last_seen, .. } => {
			assert_eq!(last_seen, crate::util::time::ms_to_system_time(written));
		}
		other => panic!("unexpected first control: {other:?}"),
	}

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shutdown_settles_open_streaks_and_persists() {
	let store = Arc::new(InMemoryStatsStore::default());
	let h = Harness::start(test_config(), store.clone(), in_memory_store_opener()).await;

	let gifts = Arc::new(AtomicU64::new(0));
	let seen = Arc::clone(&gifts);
	h.handle
		.subscribe(PluginId::new("gifts").expect("valid"), [EventKind::Gift], move |ev: Arc<Event>| {
			let seen = Arc::clone(&seen);
			async move {
				seen.fetch_add(ev.value, Ordering::SeqCst);
				Ok::<(), anyhow::Error>(())
			}
		})
		.await
		.expect("subscribe");

	h.push(changed("streamer"));
	h.push(gift_update("u1", 2, false));
	h.push(like("u1", 1, "m1"));

	let stats = h.handle.watch_stats();
	eventually("gift offered before like", || stats.borrow().likes == 1).await;
	assert_eq!(gifts.load(Ordering::SeqCst), 0, "open streak must not be delivered yet");

	h.handle.shutdown().await.expect("shutdown");

	assert_eq!(gifts.load(Ordering::SeqCst), 100);
	let record = store.load().await.expect("load").expect("persisted on shutdown");
	assert_eq!(record.snapshot.gifts, 1);
	assert_eq!(record.snapshot.total_value, 100);
	let late = h
		.handle
		.subscribe(PluginId::new("late").expect("valid"), Vec::new(), |_ev: Arc<Event>| async {
			Ok::<(), anyhow::Error>(())
		})
		.await;
	assert!(late.is_err(), "stopped pipeline must refuse subscriptions");
}

#[tokio::test]
async fn switch_profile_isolates_and_restores_stats() {
	let opener = in_memory_store_opener();
	let default_store = opener(profile("default")).await.expect("open default");
	let h = Harness::start(test_config(), default_store.clone(), opener.clone()).await;

	h.push(changed("streamer"));
	h.push(like("u1", 5, "m1"));
	let stats = h.handle.watch_stats();
	eventually("likes on default profile", || stats.borrow().likes == 5).await;

	h.handle.switch_profile(profile("alt")).await.expect("switch to alt");
	assert_eq!(h.handle.profile(), profile("alt"));
	assert_eq!(h.handle.stats().likes, 0, "alt profile starts empty");
	assert_eq!(
		default_store.load().await.expect("load").map(|r| r.snapshot.likes),
		Some(5),
		"old profile persisted before the swap"
	);

	h.push(like("u2", 2, "m2"));
	eventually("likes on alt profile", || stats.borrow().likes == 2).await;

	h.handle.switch_profile(profile("default")).await.expect("switch back");
	assert_eq!(h.handle.stats().likes, 5, "same broadcast resumes the profile's counters");

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failed_profile_switch_keeps_current_profile() {
	let opens = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&opens);
	let opener: StoreOpener = Arc::new(move |p: ProfileId| {
		counter.fetch_add(1, Ordering::SeqCst);
		Box::pin(async move {
			if p.as_str() == "broken" {
				anyhow::bail!("disk on fire");
			}
			Ok(Arc::new(InMemoryStatsStore::default()) as Arc<dyn StatsStore>)
		}) as BoxFuture<'static, anyhow::Result<Arc<dyn StatsStore>>>
	});

	let h = Harness::start(test_config(), Arc::new(InMemoryStatsStore::default()), opener).await;
	h.push(changed("streamer"));
	h.push(like("u1", 3, "m1"));
	let stats = h.handle.watch_stats();
	eventually("likes", || stats.borrow().likes == 3).await;

	let err = h.handle.switch_profile(profile("broken")).await.unwrap_err();
	assert!(matches!(err, PipelineError::ProfileSwitch(ref msg) if msg.contains("disk on fire")));
	assert_eq!(h.handle.profile(), profile("default"));
	assert_eq!(h.handle.stats().likes, 3);
	assert_eq!(opens.load(Ordering::SeqCst), 1);

	h.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn handle_reports_stopped_after_shutdown() {
	let h = Harness::start(test_config(), Arc::new(InMemoryStatsStore::default()), in_memory_store_opener()).await;
	h.handle.shutdown().await.expect("shutdown");

	assert!(matches!(h.handle.switch_profile(profile("x")).await, Err(PipelineError::Stopped)));
	assert_eq!(h.handle.connection_state(), livehub_source::ConnectionState::Disconnected);
}
