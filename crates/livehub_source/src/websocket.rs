#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use livehub_domain::BroadcastId;
use tokio::time::{Instant, interval_at, sleep, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::jittered_backoff;
use crate::room_info::{RoomInfo, RoomInfoClient};
use crate::session::SessionTracker;
use crate::{
	ConnectionState, LiveSource, RawPayload, SecretString, SourceControl, SourceControlRx, SourceEvent, SourceEventTx,
	TransportError, new_connection_id,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type LiveWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<LiveWs>> + Send + Sync>;

#[derive(Clone)]
pub struct WebSocketConfig {
	/// Websocket endpoint; `{identity}` is replaced with the url-encoded broadcast id.
	pub ws_url_template: String,
	/// Optional room lookup endpoint, same templating.
	pub room_info_url_template: Option<String>,
	pub session_token: Option<SecretString>,

	pub connect_timeout: Duration,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub jitter_ratio: f64,

	pub session_grace: Duration,
	pub start_time_tolerance: Duration,

	pub room_info_refresh: Duration,
	pub room_info_timeout: Duration,
	/// Reconnect when no frame (including pings) arrives for this long.
	pub keepalive_timeout: Duration,

	/// Test hook; defaults to `tokio_tungstenite::connect_async` with the session cookie.
	pub ws_connector: Option<WsConnector>,
}

impl WebSocketConfig {
	pub fn new(ws_url_template: impl Into<String>) -> Self {
		Self {
			ws_url_template: ws_url_template.into(),
			room_info_url_template: None,
			session_token: None,
			connect_timeout: Duration::from_secs(10),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			jitter_ratio: 0.1,
			session_grace: Duration::from_secs(15 * 60),
			start_time_tolerance: SessionTracker::DEFAULT_START_TOLERANCE,
			room_info_refresh: Duration::from_secs(30),
			room_info_timeout: Duration::from_secs(5),
			keepalive_timeout: Duration::from_secs(45),
			ws_connector: None,
		}
	}
}

impl fmt::Debug for WebSocketConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WebSocketConfig")
			.field("ws_url_template", &self.ws_url_template)
			.field("room_info_url_template", &self.room_info_url_template)
			.field("session_token", &self.session_token)
			.field("reconnect_min_delay", &self.reconnect_min_delay)
			.field("reconnect_max_delay", &self.reconnect_max_delay)
			.field("jitter_ratio", &self.jitter_ratio)
			.field("session_grace", &self.session_grace)
			.field("keepalive_timeout", &self.keepalive_timeout)
			.field("ws_connector", &self.ws_connector.as_ref().map(|_| "<custom>"))
			.finish_non_exhaustive()
	}
}

/// Upstream connector: one websocket per enabled broadcast, with reconnect.
pub struct WebSocketSource {
	cfg: WebSocketConfig,
	tracker: SessionTracker,
	room_info: Option<RoomInfoClient>,
	target: Option<BroadcastId>,
	attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
	Continue,
	Retarget,
	Shutdown,
}

enum Exit {
	Retarget,
	Shutdown,
	Failed(TransportError),
}

impl WebSocketSource {
	pub fn new(cfg: WebSocketConfig) -> Self {
		let tracker = SessionTracker::new(cfg.session_grace).with_start_tolerance(cfg.start_time_tolerance);
		let room_info = cfg
			.room_info_url_template
			.as_ref()
			.map(|t| RoomInfoClient::new(t.clone(), cfg.session_token.clone(), cfg.room_info_timeout));
		Self {
			cfg,
			tracker,
			room_info,
			target: None,
			attempt: 0,
		}
	}

	fn ws_url(&self, identity: &BroadcastId) -> Result<Url, TransportError> {
		let raw = self
			.cfg
			.ws_url_template
			.replace("{identity}", &urlencoding::encode(identity.as_str()));
		let url = Url::parse(&raw).map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))?;
		match url.scheme() {
			"ws" | "wss" => Ok(url),
			other => Err(TransportError::InvalidUrl(format!("{raw}: unsupported scheme {other}"))),
		}
	}

	fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}

		let token = self.cfg.session_token.clone();
		Arc::new(move |url: Url| {
			let token = token.clone();
			Box::pin(async move { Self::connect_default(url, token).await }) as BoxFuture<'static, anyhow::Result<LiveWs>>
		})
	}

	async fn connect_default(url: Url, token: Option<SecretString>) -> anyhow::Result<LiveWs> {
		let mut request = url.as_str().into_client_request().context("build websocket request")?;
		if let Some(token) = token {
			let value = HeaderValue::from_str(&format!("sessionid={}", token.expose())).context("session cookie header")?;
			request.headers_mut().insert(COOKIE, value);
		}
		let (ws, _resp) = tokio_tungstenite::connect_async(request).await.context("websocket connect")?;
		Ok(ws)
	}

	async fn connect_ws(&self, url: Url) -> Result<LiveWs, TransportError> {
		match timeout(self.cfg.connect_timeout, (self.ws_connector())(url)).await {
			Ok(Ok(ws)) => Ok(ws),
			Ok(Err(e)) => Err(TransportError::Connect(format!("{e:#}"))),
			Err(_) => Err(TransportError::Connect(format!("timed out after {:?}", self.cfg.connect_timeout))),
		}
	}

	async fn lookup_room_info(&self, identity: &BroadcastId) -> Option<RoomInfo> {
		let client = self.room_info.as_ref()?;
		match client.fetch(identity).await {
			Ok(info) => Some(info),
			Err(e) => {
				debug!(identity = %identity, error = %format!("{e:#}"), "room info lookup failed");
				metrics::counter!("livehub_source_room_info_failures_total").increment(1);
				None
			}
		}
	}

	async fn emit_state(&self, events_tx: &SourceEventTx, state: ConnectionState) {
		let _ = events_tx.send(SourceEvent::State(state)).await;
	}

	fn apply_control(&mut self, cmd: SourceControl) -> Flow {
		match cmd {
			SourceControl::Connect { identity } => {
				if self.target.as_ref() == Some(&identity) {
					return Flow::Continue;
				}
				info!(identity = %identity, "source enabled");
				self.target = Some(identity);
				self.attempt = 0;
				Flow::Retarget
			}
			SourceControl::Disconnect => {
				if self.target.take().is_none() {
					return Flow::Continue;
				}
				info!("source disabled");
				self.attempt = 0;
				Flow::Retarget
			}
			SourceControl::RestoreSession {
				identity,
				started_at,
				last_seen,
			} => {
				debug!(identity = %identity, "restoring persisted session");
				self.tracker.restore(identity, started_at, last_seen);
				Flow::Continue
			}
			SourceControl::Shutdown => Flow::Shutdown,
		}
	}

	async fn run_loop(mut self, mut control_rx: SourceControlRx, events_tx: SourceEventTx) -> anyhow::Result<()> {
		'outer: loop {
			let Some(identity) = self.target.clone() else {
				match control_rx.recv().await {
					Some(cmd) => {
						if self.apply_control(cmd) == Flow::Shutdown {
							break 'outer;
						}
						continue;
					}
					None => break 'outer,
				}
			};

			if self.attempt > 0 {
				let delay = jittered_backoff(
					self.attempt,
					self.cfg.reconnect_min_delay,
					self.cfg.reconnect_max_delay,
					self.cfg.jitter_ratio,
				);
				info!(identity = %identity, attempt = self.attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

				tokio::select! {
					_ = sleep(delay) => {}
					cmd = control_rx.recv() => {
						let Some(cmd) = cmd else { break 'outer };
						let had_target = self.target.is_some();
						match self.apply_control(cmd) {
							Flow::Shutdown => break 'outer,
							Flow::Retarget if had_target && self.target.is_none() => {
								self.emit_state(&events_tx, ConnectionState::Disconnected).await;
							}
							_ => {}
						}
						continue 'outer;
					}
				}
			}

			self.emit_state(&events_tx, ConnectionState::Connecting).await;

			let url = match self.ws_url(&identity) {
				Ok(u) => u,
				Err(e) => {
					warn!(identity = %identity, error = %e, "invalid websocket url");
					self.attempt = self.attempt.saturating_add(1);
					self.emit_state(&events_tx, ConnectionState::Disconnected).await;
					continue;
				}
			};

			let mut ws = match self.connect_ws(url).await {
				Ok(ws) => ws,
				Err(e) => {
					warn!(identity = %identity, attempt = self.attempt, error = %e, "websocket connect failed");
					metrics::counter!("livehub_source_connect_failures_total").increment(1);
					self.attempt = self.attempt.saturating_add(1);
					self.emit_state(&events_tx, ConnectionState::Disconnected).await;
					continue;
				}
			};

			self.attempt = 0;
			let connection_id = new_connection_id();
			let room = self.lookup_room_info(&identity).await;
			let transition =
				self.tracker
					.on_connected(identity.clone(), room.as_ref().and_then(|r| r.started_at), SystemTime::now());

			info!(
				identity = %identity,
				connection_id = %connection_id,
				reset = transition.resets(),
				"websocket connected"
			);
			metrics::counter!("livehub_source_connects_total").increment(1);

			let _ = events_tx.send(SourceEvent::Session(transition)).await;
			if let Some(room) = room {
				let _ = events_tx.send(SourceEvent::RoomInfo(room)).await;
			}
			self.emit_state(&events_tx, ConnectionState::Connected).await;

			let refresh_every = self.cfg.room_info_refresh.max(Duration::from_secs(1));
			let mut refresh = interval_at(Instant::now() + refresh_every, refresh_every);
			let keepalive = self.cfg.keepalive_timeout;
			let mut last_activity = Instant::now();

			let exit = loop {
				tokio::select! {
					cmd = control_rx.recv() => {
						let Some(cmd) = cmd else { break Exit::Shutdown };
						match self.apply_control(cmd) {
							Flow::Continue => {}
							Flow::Retarget => break Exit::Retarget,
							Flow::Shutdown => break Exit::Shutdown,
						}
					}

					msg = ws.next() => {
						let Some(msg) = msg else { break Exit::Failed(TransportError::Closed) };
						let msg = match msg {
							Ok(m) => m,
							Err(e) => break Exit::Failed(TransportError::Read(e.to_string())),
						};
						last_activity = Instant::now();

						match msg {
							Message::Text(t) => {
								if events_tx.send(SourceEvent::Payload(RawPayload::new(t.as_str()))).await.is_err() {
									break Exit::Shutdown;
								}
							}
							Message::Binary(b) => match std::str::from_utf8(&b) {
								Ok(text) => {
									if events_tx.send(SourceEvent::Payload(RawPayload::new(text))).await.is_err() {
										break Exit::Shutdown;
									}
								}
								Err(_) => debug!(len = b.len(), "dropping non-utf8 binary frame"),
							},
							Message::Ping(p) => {
								let _ = ws.send(Message::Pong(p)).await;
							}
							Message::Close(frame) => {
								debug!(?frame, "websocket closed by upstream");
								break Exit::Failed(TransportError::Closed);
							}
							_ => {}
						}
					}

					_ = refresh.tick(), if self.room_info.is_some() => {
						if let Some(room) = self.lookup_room_info(&identity).await {
							metrics::gauge!("livehub_source_viewers").set(room.viewers as f64);
							let _ = events_tx.send(SourceEvent::RoomInfo(room)).await;
						}
					}

					_ = sleep_until(last_activity + keepalive) => {
						break Exit::Failed(TransportError::KeepaliveTimeout(keepalive));
					}
				}
			};

			let _ = ws.close(None).await;
			self.tracker.on_disconnected(SystemTime::now());
			self.emit_state(&events_tx, ConnectionState::Disconnected).await;

			match exit {
				Exit::Shutdown => break 'outer,
				Exit::Retarget => {}
				Exit::Failed(e) => {
					warn!(identity = %identity, connection_id = %connection_id, error = %e, "websocket dropped");
					metrics::counter!("livehub_source_disconnects_total").increment(1);
					self.attempt = 1;
				}
			}
		}

		info!("websocket source stopped");
		Ok(())
	}
}

#[async_trait::async_trait]
impl LiveSource for WebSocketSource {
	fn name(&self) -> &'static str {
		"websocket"
	}

	async fn run(self: Box<Self>, control_rx: SourceControlRx, events_tx: SourceEventTx) -> anyhow::Result<()> {
		(*self).run_loop(control_rx, events_tx).await
	}
}
