#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use livehub_domain::{BroadcastId, EventKind, PluginId, ProfileId};
use livehub_source::{
	ConnectionState, LiveSource, RoomInfo, SessionTransition, SourceControl, SourceControlTx, SourceEvent, SourceEventRx,
	bounded_source_channels,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::pipeline::bus::{EventBus, EventHandler, SubscriptionToken};
use crate::pipeline::dedup::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL, DedupCache};
use crate::pipeline::event::{Event, Session};
use crate::pipeline::normalizer::{DEFAULT_SIGNATURE_BUCKET, Normalizer};
use crate::pipeline::stats::{StatsAggregator, StatsSnapshot};
use crate::pipeline::store::{PersistedStats, Persister, StatsStore, StoreOpener};
use crate::pipeline::streak::{DEFAULT_STREAK_IDLE_TIMEOUT, StreakCoalescer};
use crate::util::time::{system_time_to_ms, unix_ms_now};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
	pub profile: ProfileId,
	/// Broadcast to connect to on start, if any.
	pub identity: Option<BroadcastId>,

	pub dedup_ttl: Duration,
	pub dedup_capacity: usize,
	pub signature_bucket: Duration,
	pub streak_idle_timeout: Duration,
	pub streak_sweep_interval: Duration,
	pub handler_timeout: Duration,
	pub persist_interval: Duration,

	pub control_channel_capacity: usize,
	pub source_control_capacity: usize,
	pub source_events_capacity: usize,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			profile: ProfileId::default(),
			identity: None,
			dedup_ttl: DEFAULT_DEDUP_TTL,
			dedup_capacity: DEFAULT_DEDUP_CAPACITY,
			signature_bucket: DEFAULT_SIGNATURE_BUCKET,
			streak_idle_timeout: DEFAULT_STREAK_IDLE_TIMEOUT,
			streak_sweep_interval: Duration::from_millis(500),
			handler_timeout: Duration::from_secs(2),
			persist_interval: Duration::from_secs(30),
			control_channel_capacity: 64,
			source_control_capacity: 16,
			source_events_capacity: 4_096,
		}
	}
}

#[derive(Debug, Error)]
pub enum PipelineError {
	#[error("pipeline is not running")]
	Stopped,
	#[error("profile switch failed: {0}")]
	ProfileSwitch(String),
}

enum PipelineControl {
	Subscribe {
		plugin_id: PluginId,
		kinds: Vec<EventKind>,
		handler: Arc<dyn EventHandler>,
		resp: oneshot::Sender<SubscriptionToken>,
	},
	Unsubscribe {
		token: SubscriptionToken,
		resp: oneshot::Sender<bool>,
	},
	UnsubscribePlugin {
		plugin_id: PluginId,
		resp: oneshot::Sender<usize>,
	},
	SwitchProfile {
		profile: ProfileId,
		resp: oneshot::Sender<Result<(), PipelineError>>,
	},
	Shutdown {
		resp: oneshot::Sender<()>,
	},
}

/// Cloneable handle to a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
	control_tx: mpsc::Sender<PipelineControl>,
	source_control_tx: SourceControlTx,
	stats_rx: watch::Receiver<StatsSnapshot>,
	state_rx: watch::Receiver<ConnectionState>,
	session_rx: watch::Receiver<Option<Session>>,
	profile_rx: watch::Receiver<ProfileId>,
}

impl PipelineHandle {
	pub async fn subscribe<H: EventHandler>(
		&self,
		plugin_id: PluginId,
		kinds: impl IntoIterator<Item = EventKind>,
		handler: H,
	) -> Result<SubscriptionToken, PipelineError> {
		let (resp, rx) = oneshot::channel();
		self.send(PipelineControl::Subscribe {
			plugin_id,
			kinds: kinds.into_iter().collect(),
			handler: Arc::new(handler),
			resp,
		})
		.await?;
		rx.await.map_err(|_| PipelineError::Stopped)
	}

	/// Returns once the pipeline no longer dispatches to `token`.
	pub async fn unsubscribe(&self, token: SubscriptionToken) -> Result<bool, PipelineError> {
		let (resp, rx) = oneshot::channel();
		self.send(PipelineControl::Unsubscribe { token, resp }).await?;
		rx.await.map_err(|_| PipelineError::Stopped)
	}

	pub async fn unsubscribe_plugin(&self, plugin_id: PluginId) -> Result<usize, PipelineError> {
		let (resp, rx) = oneshot::channel();
		self.send(PipelineControl::UnsubscribePlugin { plugin_id, resp }).await?;
		rx.await.map_err(|_| PipelineError::Stopped)
	}

	pub async fn switch_profile(&self, profile: ProfileId) -> Result<(), PipelineError> {
		let (resp, rx) = oneshot::channel();
		self.send(PipelineControl::SwitchProfile { profile, resp }).await?;
		rx.await.map_err(|_| PipelineError::Stopped)?
	}

	pub async fn connect(&self, identity: BroadcastId) -> Result<(), PipelineError> {
		self.source_control_tx
			.send(SourceControl::Connect { identity })
			.await
			.map_err(|_| PipelineError::Stopped)
	}

	pub async fn disconnect(&self) -> Result<(), PipelineError> {
		self.source_control_tx
			.send(SourceControl::Disconnect)
			.await
			.map_err(|_| PipelineError::Stopped)
	}

	/// Flush open streaks, persist, stop the source and the pipeline task.
	pub async fn shutdown(&self) -> Result<(), PipelineError> {
		let (resp, rx) = oneshot::channel();
		self.send(PipelineControl::Shutdown { resp }).await?;
		rx.await.map_err(|_| PipelineError::Stopped)
	}

	pub fn stats(&self) -> StatsSnapshot {
		*self.stats_rx.borrow()
	}

	pub fn watch_stats(&self) -> watch::Receiver<StatsSnapshot> {
		self.stats_rx.clone()
	}

	pub fn connection_state(&self) -> ConnectionState {
		*self.state_rx.borrow()
	}

	pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
		self.state_rx.clone()
	}

	pub fn session(&self) -> Option<Session> {
		self.session_rx.borrow().clone()
	}

	pub fn profile(&self) -> ProfileId {
		self.profile_rx.borrow().clone()
	}

	async fn send(&self, msg: PipelineControl) -> Result<(), PipelineError> {
		self.control_tx.send(msg).await.map_err(|_| PipelineError::Stopped)
	}
}

pub struct Pipeline;

impl Pipeline {
	/// Spawn the source and the pipeline task.
	///
	/// The store's last record seeds the source's session tracker so a restart
	/// that reconnects to the same broadcast within the grace window resumes.
	pub async fn start(
		cfg: PipelineConfig,
		source: Box<dyn LiveSource>,
		store: Arc<dyn StatsStore>,
		opener: StoreOpener,
	) -> PipelineHandle {
		let (source_control_tx, source_control_rx, source_events_tx, source_events_rx) =
			bounded_source_channels(cfg.source_control_capacity, cfg.source_events_capacity);

		let persisted = match store.load().await {
			Ok(r) => r,
			Err(e) => {
				warn!(profile = %cfg.profile, error = %format!("{e:#}"), "failed to load persisted stats");
				None
			}
		};
		if let Some(record) = &persisted
			&& let Some(identity) = &record.identity
		{
			let _ = source_control_tx
				.send(SourceControl::RestoreSession {
					identity: identity.clone(),
					started_at: record.started_at(),
					last_seen: record.last_seen(),
				})
				.await;
		}
		if let Some(identity) = &cfg.identity {
			let _ = source_control_tx
				.send(SourceControl::Connect {
					identity: identity.clone(),
				})
				.await;
		}

		let source_name = source.name();
		let source_task = tokio::spawn(async move {
			if let Err(e) = source.run(source_control_rx, source_events_tx).await {
				warn!(source = source_name, error = %format!("{e:#}"), "source task exited with error");
			}
		});

		let (control_tx, control_rx) = mpsc::channel(cfg.control_channel_capacity);
		let (stats_tx, stats_rx) = watch::channel(StatsSnapshot::default());
		let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
		let (session_tx, session_rx) = watch::channel(None);
		let (profile_tx, profile_rx) = watch::channel(cfg.profile.clone());

		info!(profile = %cfg.profile, source = source_name, "pipeline starting");

		let task = PipelineTask {
			normalizer: Normalizer::new(cfg.signature_bucket),
			streaks: StreakCoalescer::new(cfg.streak_idle_timeout),
			dedup: DedupCache::new(cfg.dedup_ttl, cfg.dedup_capacity),
			stats: StatsAggregator::default(),
			bus: EventBus::new(cfg.handler_timeout),
			persister: Persister::new(store),
			opener,
			profile: cfg.profile.clone(),
			persisted,
			session: None,
			connected: false,
			generation: 0,
			source_control_tx: source_control_tx.clone(),
			source_task: Some(source_task),
			stats_tx,
			state_tx,
			session_tx,
			profile_tx,
			cfg,
		};
		tokio::spawn(task.run(control_rx, source_events_rx));

		PipelineHandle {
			control_tx,
			source_control_tx,
			stats_rx,
			state_rx,
			session_rx,
			profile_rx,
		}
	}
}

/// Owns all mutable pipeline state; driven by a single task.
struct PipelineTask {
	cfg: PipelineConfig,
	normalizer: Normalizer,
	streaks: StreakCoalescer,
	dedup: DedupCache,
	stats: StatsAggregator,
	bus: EventBus,
	persister: Persister,
	opener: StoreOpener,
	profile: ProfileId,
	/// Last record loaded from (or written to) the current store.
	persisted: Option<PersistedStats>,
	session: Option<Session>,
	connected: bool,
	generation: u64,
	source_control_tx: SourceControlTx,
	source_task: Option<JoinHandle<()>>,
	stats_tx: watch::Sender<StatsSnapshot>,
	state_tx: watch::Sender<ConnectionState>,
	session_tx: watch::Sender<Option<Session>>,
	profile_tx: watch::Sender<ProfileId>,
}

impl PipelineTask {
	async fn run(mut self, mut control_rx: mpsc::Receiver<PipelineControl>, mut source_rx: SourceEventRx) {
		let mut sweep = interval(self.cfg.streak_sweep_interval.max(Duration::from_millis(10)));
		sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
		let mut persist = interval(self.cfg.persist_interval.max(Duration::from_millis(10)));
		persist.set_missed_tick_behavior(MissedTickBehavior::Skip);
		persist.reset();

		let mut source_open = true;

		loop {
			tokio::select! {
				ev = source_rx.recv(), if source_open => {
					match ev {
						Some(ev) => self.on_source_event(ev).await,
						None => {
							debug!("source events channel closed");
							source_open = false;
							if self.connected {
								self.on_state(ConnectionState::Disconnected).await;
							}
						}
					}
				}

				cmd = control_rx.recv() => {
					let Some(cmd) = cmd else {
						info!("all pipeline handles dropped; shutting down");
						self.shutdown().await;
						break;
					};
					if let Some(resp) = self.on_control(cmd).await {
						self.shutdown().await;
						let _ = resp.send(());
						break;
					}
				}

				_ = sweep.tick() => {
					for ev in self.streaks.flush_expired(Instant::now()) {
						self.deliver(ev).await;
					}
				}

				_ = persist.tick(), if self.connected => {
					self.persist_in_background();
				}
			}
		}

		info!(profile = %self.profile, "pipeline stopped");
	}

	async fn on_control(&mut self, cmd: PipelineControl) -> Option<oneshot::Sender<()>> {
		match cmd {
			PipelineControl::Subscribe {
				plugin_id,
				kinds,
				handler,
				resp,
			} => {
				let token = self.bus.registry_mut().subscribe(plugin_id, kinds, handler);
				metrics::gauge!("livehub_subscriptions").set(self.bus.registry().len() as f64);
				let _ = resp.send(token);
			}
			PipelineControl::Unsubscribe { token, resp } => {
				let removed = self.bus.registry_mut().unsubscribe(token);
				metrics::gauge!("livehub_subscriptions").set(self.bus.registry().len() as f64);
				let _ = resp.send(removed);
			}
			PipelineControl::UnsubscribePlugin { plugin_id, resp } => {
				let removed = self.bus.registry_mut().unsubscribe_plugin(&plugin_id);
				metrics::gauge!("livehub_subscriptions").set(self.bus.registry().len() as f64);
				let _ = resp.send(removed);
			}
			PipelineControl::SwitchProfile { profile, resp } => {
				let result = self.switch_profile(profile).await;
				let _ = resp.send(result);
			}
			PipelineControl::Shutdown { resp } => return Some(resp),
		}
		None
	}

	async fn on_source_event(&mut self, ev: SourceEvent) {
		match ev {
			SourceEvent::State(state) => self.on_state(state).await,
			SourceEvent::Session(transition) => self.on_session(transition).await,
			SourceEvent::RoomInfo(info) => self.on_room_info(info),
			SourceEvent::Payload(raw) => match self.normalizer.normalize(&raw) {
				Ok(event) => {
					self.note_first_event(event.timestamp);
					if let Some(event) = self.streaks.offer(event, Instant::now()) {
						self.deliver(event).await;
					}
				}
				Err(e) => {
					debug!(error = %e, "dropping malformed payload");
					metrics::counter!("livehub_malformed_events_total", "reason" => e.reason()).increment(1);
				}
			},
		}
	}

	async fn on_state(&mut self, state: ConnectionState) {
		let was_connected = self.connected;
		self.connected = state == ConnectionState::Connected;
		self.state_tx.send_replace(state);
		metrics::gauge!("livehub_connected").set(if self.connected { 1.0 } else { 0.0 });

		if was_connected && !self.connected {
			if let Some(session) = &mut self.session {
				session.is_active = false;
			}
			self.publish_session();
			self.persist_now().await;
		}
	}

	async fn on_session(&mut self, transition: SessionTransition) {
		let identity = transition.identity().clone();

		if transition.resets() {
			// Combos from the previous session settle into the previous session.
			for ev in self.streaks.drain_all() {
				self.deliver(ev).await;
			}
			self.dedup.clear();
			self.stats.reset();
			self.session = Some(Session {
				identity: identity.clone(),
				started_at: transition.started_at(),
				is_active: true,
			});
			info!(identity = %identity, "session changed; stats reset");
			metrics::counter!("livehub_session_changes_total").increment(1);
			self.publish_stats();
			self.publish_session();
			self.persist_now().await;
			return;
		}

		let same_in_memory = self.session.as_ref().is_some_and(|s| s.identity == identity);
		if !same_in_memory {
			// Process restart: fall back to the store's snapshot.
			let record = match self.persister.store().load().await {
				Ok(r) => r.or_else(|| self.persisted.clone()),
				Err(e) => {
					warn!(error = %format!("{e:#}"), "failed to load stats for resumed session");
					self.persisted.clone()
				}
			};
			match record {
				Some(r) if r.identity.as_ref() == Some(&identity) => self.stats.restore(r.snapshot),
				_ => self.stats.reset(),
			}
		}

		let started_at = self
			.session
			.as_ref()
			.filter(|s| s.identity == identity)
			.and_then(|s| s.started_at)
			.or(transition.started_at());
		self.session = Some(Session {
			identity: identity.clone(),
			started_at,
			is_active: true,
		});
		info!(identity = %identity, "session resumed");
		metrics::counter!("livehub_session_resumes_total").increment(1);
		self.publish_stats();
		self.publish_session();
	}

	fn on_room_info(&mut self, info: RoomInfo) {
		if let Some(session) = &mut self.session
			&& session.started_at.is_none()
			&& info.started_at.is_some()
		{
			session.started_at = info.started_at;
			self.publish_session();
		}
		self.stats.apply_room_info(&info);
		metrics::gauge!("livehub_viewers").set(info.viewers as f64);
		self.publish_stats();
	}

	/// Without an authoritative start time, the earliest event timestamp stands in.
	fn note_first_event(&mut self, at: SystemTime) {
		if let Some(session) = &mut self.session
			&& session.started_at.is_none()
		{
			session.started_at = Some(at);
			self.publish_session();
		}
	}

	async fn deliver(&mut self, event: Event) {
		if !self.dedup.should_process(&event.signature, Instant::now()) {
			metrics::counter!("livehub_duplicate_events_total").increment(1);
			return;
		}

		self.stats.record(&event);
		self.publish_stats();
		metrics::counter!("livehub_events_published_total", "kind" => event.kind.as_str()).increment(1);

		let report = self.bus.publish(Arc::new(event)).await;
		if !report.errors.is_empty() {
			debug!(delivered = report.delivered, failed = report.errors.len(), "publish finished with errors");
		}
	}

	async fn switch_profile(&mut self, profile: ProfileId) -> Result<(), PipelineError> {
		if profile == self.profile {
			return Ok(());
		}

		let store = (self.opener)(profile.clone())
			.await
			.map_err(|e| PipelineError::ProfileSwitch(format!("{e:#}")))?;

		for ev in self.streaks.drain_all() {
			self.deliver(ev).await;
		}
		self.persist_now().await;

		let record = match store.load().await {
			Ok(r) => r,
			Err(e) => {
				warn!(profile = %profile, error = %format!("{e:#}"), "failed to load profile stats");
				None
			}
		};

		self.persister = Persister::new(store);
		self.dedup.clear();
		let current = self.session.as_ref().map(|s| &s.identity);
		match &record {
			Some(r) if current.is_some() && r.identity.as_ref() == current => self.stats.restore(r.snapshot),
			_ => self.stats.reset(),
		}
		self.persisted = record;

		info!(from = %self.profile, to = %profile, "profile switched");
		self.profile = profile.clone();
		self.profile_tx.send_replace(profile);
		self.publish_stats();
		Ok(())
	}

	async fn shutdown(&mut self) {
		for ev in self.streaks.drain_all() {
			self.deliver(ev).await;
		}
		self.persist_now().await;

		let _ = self.source_control_tx.send(SourceControl::Shutdown).await;
		if let Some(task) = self.source_task.take()
			&& tokio::time::timeout(Duration::from_secs(5), task).await.is_err()
		{
			warn!("source task did not stop in time");
		}
		self.state_tx.send_replace(ConnectionState::Disconnected);
	}

	fn record(&mut self) -> (u64, PersistedStats) {
		self.generation = self.generation.saturating_add(1);
		let record = PersistedStats {
			snapshot: self.stats.snapshot(),
			identity: self.session.as_ref().map(|s| s.identity.clone()),
			started_at_ms: self.session.as_ref().and_then(|s| s.started_at).map(system_time_to_ms),
			last_seen_ms: unix_ms_now(),
		};
		self.persisted = Some(record.clone());
		(self.generation, record)
	}

	async fn persist_now(&mut self) {
		if self.session.is_none() {
			return;
		}
		let (generation, record) = self.record();
		if let Err(e) = self.persister.write(generation, record).await {
			warn!(profile = %self.profile, error = %format!("{e:#}"), "failed to persist stats");
			metrics::counter!("livehub_persist_failures_total").increment(1);
		}
	}

	fn persist_in_background(&mut self) {
		if self.session.is_none() {
			return;
		}
		let (generation, record) = self.record();
		let persister = self.persister.clone();
		let profile = self.profile.clone();
		tokio::spawn(async move {
			if let Err(e) = persister.write(generation, record).await {
				warn!(profile = %profile, error = %format!("{e:#}"), "periodic stats persist failed");
				metrics::counter!("livehub_persist_failures_total").increment(1);
			}
		});
	}

	fn publish_stats(&self) {
		self.stats_tx.send_replace(self.stats.snapshot());
	}

	fn publish_session(&self) {
		self.session_tx.send_replace(self.session.clone());
	}
}
