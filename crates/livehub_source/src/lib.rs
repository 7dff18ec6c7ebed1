#![forbid(unsafe_code)]

pub mod backoff;
pub mod coerce;
pub mod room_info;
pub mod session;
pub mod websocket;


use std::fmt;
use std::time::{Duration, SystemTime};

use livehub_domain::BroadcastId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use room_info::{RoomInfo, RoomInfoClient};
pub use session::{SessionTracker, SessionTransition};
pub use websocket::{WebSocketConfig, WebSocketSource};

/// Pipeline → source control message.
#[derive(Debug)]
pub enum SourceControl {
	/// Enable the source and (re)connect to `identity`.
	Connect {
		identity: BroadcastId,
	},

	/// Explicit disconnect; terminal until the next `Connect`.
	Disconnect,

	/// Seed the session tracker with a session recovered from persistence.
	RestoreSession {
		identity: BroadcastId,
		started_at: Option<SystemTime>,
		last_seen: SystemTime,
	},

	/// Request a graceful shutdown.
	Shutdown,
}

/// Source → pipeline event message.
#[derive(Debug, Clone)]
pub enum SourceEvent {
	/// Connection state change.
	State(ConnectionState),

	/// Session boundary detected on a successful connect.
	Session(SessionTransition),

	/// Raw upstream payload, not yet normalized.
	Payload(RawPayload),

	/// Point-in-time room metadata.
	RoomInfo(RoomInfo),
}

/// User-visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	#[default]
	Disconnected,
	Connecting,
	Connected,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Raw upstream frame.
#[derive(Debug, Clone)]
pub struct RawPayload {
	pub text: String,

	/// Local receipt time (fallback when the payload carries no timestamp).
	pub received_at: SystemTime,
}

impl RawPayload {
	pub fn new(text: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			received_at: SystemTime::now(),
		}
	}
}

/// Transport-level failures. Retried with backoff while the source is enabled.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("invalid endpoint url: {0}")]
	InvalidUrl(String),
	#[error("connect failed: {0}")]
	Connect(String),
	#[error("read failed: {0}")]
	Read(String),
	#[error("no upstream traffic for {0:?}")]
	KeepaliveTimeout(Duration),
	#[error("stream closed by upstream")]
	Closed,
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Helper types for wiring sources.
pub type SourceControlTx = mpsc::Sender<SourceControl>;
pub type SourceControlRx = mpsc::Receiver<SourceControl>;
pub type SourceEventTx = mpsc::Sender<SourceEvent>;
pub type SourceEventRx = mpsc::Receiver<SourceEvent>;

/// Trait representing a runnable upstream source.
#[async_trait::async_trait]
pub trait LiveSource: Send + Sync + 'static {
	/// Short name used in logs.
	fn name(&self) -> &'static str;

	/// Run until shutdown or until the control channel closes.
	async fn run(self: Box<Self>, control_rx: SourceControlRx, events_tx: SourceEventTx) -> anyhow::Result<()>;
}

/// Build a standard bounded channel pair.
pub fn bounded_source_channels(
	control_capacity: usize,
	events_capacity: usize,
) -> (SourceControlTx, SourceControlRx, SourceEventTx, SourceEventRx) {
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	(control_tx, control_rx, events_tx, events_rx)
}

/// Generate an opaque connection id for log correlation.
pub fn new_connection_id() -> String {
	Uuid::new_v4().to_string()
}
