#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use livehub_domain::{BroadcastId, ProfileId};
use livehub_source::{SecretString, WebSocketConfig};
use serde::Deserialize;
use tracing::{info, warn};

use crate::pipeline::PipelineConfig;
use crate::pipeline::dedup::MAX_DEDUP_TTL;

/// Default config path: `~/.livehub/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(livehub_home()?.join("config.toml"))
}

fn livehub_home() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".livehub"))
}

/// Default per-profile store: `sqlite://~/.livehub/profiles/{profile}/stats.db`.
pub fn default_database_url_template() -> anyhow::Result<String> {
	let dir = livehub_home()?.join("profiles").join("{profile}").join("stats.db");
	Ok(format!("sqlite://{}?mode=rwc", dir.display()))
}

/// Load the config from TOML and env overrides.
pub fn load_config() -> anyhow::Result<LivehubConfig> {
	let path = default_config_path()?;
	load_config_from_path(&path)
}

/// Same as `load_config` but with an explicit config path.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<LivehubConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = LivehubConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.validate();
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct LivehubConfig {
	pub profile: ProfileId,
	pub source: SourceSettings,
	pub pipeline: PipelineSettings,
	pub persistence: PersistenceSettings,
	pub server: ServerSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
	/// Websocket endpoint template; `{identity}` is substituted.
	pub ws_url: Option<String>,
	pub room_info_url: Option<String>,
	/// Broadcast to connect to at startup.
	pub identity: Option<BroadcastId>,
	/// Upstream session cookie.
	pub session_token: Option<SecretString>,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub jitter_ratio: f64,
	pub session_grace: Duration,
	pub room_info_refresh: Duration,
	pub keepalive_timeout: Duration,
	/// Use the built-in demo source instead of the websocket.
	pub demo: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
	pub dedup_ttl: Duration,
	pub dedup_capacity: usize,
	pub signature_bucket: Duration,
	pub streak_idle_timeout: Duration,
	pub handler_timeout: Duration,
	pub persist_interval: Duration,
	pub source_events_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Use SQL stores; otherwise profiles live in memory.
	pub enabled: bool,
	/// Database URL template; `{profile}` is substituted.
	pub database_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

impl LivehubConfig {
	pub fn websocket_config(&self) -> Option<WebSocketConfig> {
		let url = self.source.ws_url.clone()?;
		let mut ws = WebSocketConfig::new(url);
		ws.room_info_url_template = self.source.room_info_url.clone();
		ws.session_token = self.source.session_token.clone();
		ws.reconnect_min_delay = self.source.reconnect_min_delay;
		ws.reconnect_max_delay = self.source.reconnect_max_delay;
		ws.jitter_ratio = self.source.jitter_ratio;
		ws.session_grace = self.source.session_grace;
		ws.room_info_refresh = self.source.room_info_refresh;
		ws.keepalive_timeout = self.source.keepalive_timeout;
		Some(ws)
	}

	pub fn pipeline_config(&self) -> PipelineConfig {
		PipelineConfig {
			profile: self.profile.clone(),
			identity: self.source.identity.clone(),
			dedup_ttl: self.pipeline.dedup_ttl,
			dedup_capacity: self.pipeline.dedup_capacity,
			signature_bucket: self.pipeline.signature_bucket,
			streak_idle_timeout: self.pipeline.streak_idle_timeout,
			handler_timeout: self.pipeline.handler_timeout,
			persist_interval: self.pipeline.persist_interval,
			source_events_capacity: self.pipeline.source_events_capacity,
			..PipelineConfig::default()
		}
	}

	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = PipelineConfig::default();
		let ws_defaults = WebSocketConfig::new("");

		let profile = match file.profile.filter(|s| !s.trim().is_empty()) {
			Some(p) => ProfileId::new(p).context("invalid profile")?,
			None => ProfileId::default(),
		};
		let identity = file
			.source
			.identity
			.filter(|s| !s.trim().is_empty())
			.map(BroadcastId::new)
			.transpose()
			.context("invalid source.identity")?;

		let database_url = match file.persistence.database_url.filter(|s| !s.trim().is_empty()) {
			Some(url) => url,
			None => default_database_url_template()?,
		};

		Ok(Self {
			profile,
			source: SourceSettings {
				ws_url: file.source.ws_url.filter(|s| !s.trim().is_empty()),
				room_info_url: file.source.room_info_url.filter(|s| !s.trim().is_empty()),
				identity,
				session_token: file
					.source
					.session_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				reconnect_min_delay: file
					.source
					.reconnect_min_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(ws_defaults.reconnect_min_delay),
				reconnect_max_delay: file
					.source
					.reconnect_max_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(ws_defaults.reconnect_max_delay),
				jitter_ratio: file.source.jitter_ratio.unwrap_or(ws_defaults.jitter_ratio),
				session_grace: file
					.source
					.session_grace_secs
					.map(Duration::from_secs)
					.unwrap_or(ws_defaults.session_grace),
				room_info_refresh: file
					.source
					.room_info_refresh_secs
					.map(Duration::from_secs)
					.unwrap_or(ws_defaults.room_info_refresh),
				keepalive_timeout: file
					.source
					.keepalive_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(ws_defaults.keepalive_timeout),
				demo: file.source.demo.unwrap_or(false),
			},
			pipeline: PipelineSettings {
				dedup_ttl: file
					.pipeline
					.dedup_ttl_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.dedup_ttl),
				dedup_capacity: file.pipeline.dedup_capacity.unwrap_or(defaults.dedup_capacity),
				signature_bucket: file
					.pipeline
					.signature_bucket_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.signature_bucket),
				streak_idle_timeout: file
					.pipeline
					.streak_idle_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.streak_idle_timeout),
				handler_timeout: file
					.pipeline
					.handler_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.handler_timeout),
				persist_interval: file
					.pipeline
					.persist_interval_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.persist_interval),
				source_events_capacity: file
					.pipeline
					.source_events_capacity
					.unwrap_or(defaults.source_events_capacity),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(true),
				database_url,
			},
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
		})
	}

	fn validate(&mut self) {
		if self.source.reconnect_min_delay > self.source.reconnect_max_delay {
			warn!(
				min_ms = self.source.reconnect_min_delay.as_millis() as u64,
				max_ms = self.source.reconnect_max_delay.as_millis() as u64,
				"source config: reconnect_min_delay > reconnect_max_delay; swapping"
			);
			std::mem::swap(&mut self.source.reconnect_min_delay, &mut self.source.reconnect_max_delay);
		}
		if !(0.0..=1.0).contains(&self.source.jitter_ratio) {
			warn!(jitter_ratio = self.source.jitter_ratio, "source config: jitter_ratio out of range; clamping");
			self.source.jitter_ratio = if self.source.jitter_ratio.is_finite() {
				self.source.jitter_ratio.clamp(0.0, 1.0)
			} else {
				0.0
			};
		}
		if self.pipeline.dedup_ttl > MAX_DEDUP_TTL {
			warn!(
				secs = self.pipeline.dedup_ttl.as_secs(),
				max_secs = MAX_DEDUP_TTL.as_secs(),
				"pipeline config: dedup_ttl too large; capping"
			);
			self.pipeline.dedup_ttl = MAX_DEDUP_TTL;
		}
		if self.pipeline.dedup_capacity == 0 {
			warn!("pipeline config: dedup_capacity must be positive; using 1");
			self.pipeline.dedup_capacity = 1;
		}
		if self.pipeline.source_events_capacity == 0 {
			self.pipeline.source_events_capacity = PipelineConfig::default().source_events_capacity;
		}
		if self.persistence.enabled && !self.persistence.database_url.contains("{profile}") {
			warn!("persistence: database_url has no {{profile}} placeholder; profiles will share one store");
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	profile: Option<String>,

	#[serde(default)]
	source: FileSourceSettings,

	#[serde(default)]
	pipeline: FilePipelineSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSourceSettings {
	ws_url: Option<String>,
	room_info_url: Option<String>,
	identity: Option<String>,
	session_token: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	jitter_ratio: Option<f64>,
	session_grace_secs: Option<u64>,
	room_info_refresh_secs: Option<u64>,
	keepalive_timeout_secs: Option<u64>,
	demo: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePipelineSettings {
	dedup_ttl_secs: Option<u64>,
	dedup_capacity: Option<usize>,
	signature_bucket_ms: Option<u64>,
	streak_idle_timeout_ms: Option<u64>,
	handler_timeout_ms: Option<u64>,
	persist_interval_secs: Option<u64>,
	source_events_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut LivehubConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("LIVEHUB_PROFILE") {
		match ProfileId::new(v) {
			Ok(p) => {
				cfg.profile = p;
				info!(profile = %cfg.profile, "config: profile overridden by env");
			}
			Err(e) => warn!(error = %e, "config: ignoring invalid LIVEHUB_PROFILE"),
		}
	}

	if let Some(v) = var("LIVEHUB_IDENTITY") {
		match BroadcastId::new(v) {
			Ok(id) => {
				info!(identity = %id, "source config: identity overridden by env");
				cfg.source.identity = Some(id);
			}
			Err(e) => warn!(error = %e, "source config: ignoring invalid LIVEHUB_IDENTITY"),
		}
	}

	if let Some(v) = var("LIVEHUB_WS_URL") {
		cfg.source.ws_url = Some(v);
		info!("source config: ws_url overridden by env");
	}

	if let Some(v) = var("LIVEHUB_ROOM_INFO_URL") {
		cfg.source.room_info_url = Some(v);
		info!("source config: room_info_url overridden by env");
	}

	if let Some(v) = var("LIVEHUB_SESSION_TOKEN") {
		cfg.source.session_token = Some(SecretString::new(v));
		info!("source config: session_token overridden by env");
	}

	if let Some(v) = var("LIVEHUB_RECONNECT_MIN_DELAY_MS")
		&& let Ok(min_ms) = v.parse::<u64>()
	{
		cfg.source.reconnect_min_delay = Duration::from_millis(min_ms);
		info!(min_ms, "source config: reconnect_min_delay overridden by env");
	}

	if let Some(v) = var("LIVEHUB_RECONNECT_MAX_DELAY_MS")
		&& let Ok(max_ms) = v.parse::<u64>()
	{
		cfg.source.reconnect_max_delay = Duration::from_millis(max_ms);
		info!(max_ms, "source config: reconnect_max_delay overridden by env");
	}

	if let Some(v) = var("LIVEHUB_SESSION_GRACE_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.source.session_grace = Duration::from_secs(secs);
		info!(secs, "source config: session_grace overridden by env");
	}

	if let Some(v) = var("LIVEHUB_ENABLE_DEMO_SOURCE")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.source.demo = enabled;
		info!(enabled, "source config: demo overridden by env");
	}

	if let Some(v) = var("LIVEHUB_DEDUP_TTL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.pipeline.dedup_ttl = Duration::from_secs(secs);
		info!(secs, "pipeline config: dedup_ttl overridden by env");
	}

	if let Some(v) = var("LIVEHUB_DEDUP_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
	{
		cfg.pipeline.dedup_capacity = capacity;
		info!(capacity, "pipeline config: dedup_capacity overridden by env");
	}

	if let Some(v) = var("LIVEHUB_STREAK_IDLE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.pipeline.streak_idle_timeout = Duration::from_millis(ms);
		info!(ms, "pipeline config: streak_idle_timeout overridden by env");
	}

	if let Some(v) = var("LIVEHUB_PERSIST_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.pipeline.persist_interval = Duration::from_secs(secs);
		info!(secs, "pipeline config: persist_interval overridden by env");
	}

	if let Some(v) = var("LIVEHUB_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = var("LIVEHUB_DATABASE_URL") {
		cfg.persistence.database_url = v;
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("LIVEHUB_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("LIVEHUB_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn config_from(toml_src: &str) -> LivehubConfig {
		LivehubConfig::from_file(parse_toml(toml_src).unwrap()).unwrap()
	}

	#[test]
	fn defaults_apply_to_empty_file() {
		let cfg = config_from("");
		assert_eq!(cfg.profile.as_str(), "default");
		assert_eq!(cfg.pipeline.dedup_ttl, Duration::from_secs(60));
		assert_eq!(cfg.pipeline.dedup_capacity, 1_000);
		assert_eq!(cfg.pipeline.streak_idle_timeout, Duration::from_secs(4));
		assert_eq!(cfg.pipeline.persist_interval, Duration::from_secs(30));
		assert!(cfg.persistence.enabled);
		assert!(cfg.persistence.database_url.contains("{profile}"));
		assert!(cfg.websocket_config().is_none());
	}

	#[test]
	fn file_values_are_typed() {
		let cfg = config_from(
			r#"
			profile = "night_show"

			[source]
			ws_url = "wss://upstream.test/ws/{identity}"
			identity = "@Streamer"
			session_token = "abc"
			reconnect_min_delay_ms = 250

			[pipeline]
			dedup_capacity = 50
			streak_idle_timeout_ms = 1500

			[persistence]
			database_url = "sqlite::memory:"

			[server]
			health_bind = "127.0.0.1:9000"
			"#,
		);

		assert_eq!(cfg.profile.as_str(), "night_show");
		assert_eq!(cfg.source.identity.as_ref().map(|i| i.as_str()), Some("streamer"));
		assert_eq!(format!("{:?}", cfg.source.session_token), "Some(SecretString(<redacted>))");
		assert_eq!(cfg.pipeline.dedup_capacity, 50);
		assert_eq!(cfg.pipeline.streak_idle_timeout, Duration::from_millis(1500));
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9000"));

		let ws = cfg.websocket_config().unwrap();
		assert_eq!(ws.reconnect_min_delay, Duration::from_millis(250));
		assert_eq!(cfg.pipeline_config().dedup_capacity, 50);
	}

	#[test]
	fn invalid_profile_is_rejected() {
		let file = parse_toml(r#"profile = "../escape""#).unwrap();
		assert!(LivehubConfig::from_file(file).is_err());
	}

	#[test]
	fn env_overrides_win_and_bad_values_are_ignored() {
		let mut cfg = config_from("");
		let env: HashMap<&str, &str> = HashMap::from([
			("LIVEHUB_PROFILE", "alt"),
			("LIVEHUB_IDENTITY", "  "),
			("LIVEHUB_DEDUP_CAPACITY", "2"),
			("LIVEHUB_PERSIST_INTERVAL_SECS", "soon"),
			("LIVEHUB_ENABLE_DEMO_SOURCE", "yes"),
			("LIVEHUB_PERSISTENCE_ENABLED", "off"),
		]);
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.profile.as_str(), "alt");
		assert!(cfg.source.identity.is_none());
		assert_eq!(cfg.pipeline.dedup_capacity, 2);
		assert_eq!(cfg.pipeline.persist_interval, Duration::from_secs(30));
		assert!(cfg.source.demo);
		assert!(!cfg.persistence.enabled);
	}

	#[test]
	fn validate_swaps_inverted_backoff() {
		let mut cfg = config_from(
			r#"
			[source]
			reconnect_min_delay_ms = 9000
			reconnect_max_delay_ms = 100
			jitter_ratio = 4.0
			"#,
		);
		cfg.validate();
		assert_eq!(cfg.source.reconnect_min_delay, Duration::from_millis(100));
		assert_eq!(cfg.source.reconnect_max_delay, Duration::from_millis(9000));
		assert_eq!(cfg.source.jitter_ratio, 1.0);
	}

	#[test]
	fn huge_dedup_ttl_from_env_is_capped() {
		let mut cfg = config_from("");
		apply_env_overrides(&mut cfg, |k| (k == "LIVEHUB_DEDUP_TTL_SECS").then(|| u64::MAX.to_string()));
		cfg.validate();
		assert_eq!(cfg.pipeline.dedup_ttl, MAX_DEDUP_TTL);
	}
}
