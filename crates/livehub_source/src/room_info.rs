#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use anyhow::{Context, anyhow};
use livehub_domain::BroadcastId;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, COOKIE, USER_AGENT};
use serde_json::Value;
use url::Url;

use crate::SecretString;
use crate::coerce::{as_string, as_timestamp, as_u64, field};

/// Point-in-time room metadata from the room lookup endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomInfo {
	pub room_id: Option<String>,
	pub started_at: Option<SystemTime>,
	pub viewers: u64,
	pub likes: u64,
	pub coins: u64,
	pub followers: u64,
}

impl RoomInfo {
	/// Parse a loosely shaped room document. Fields are looked up at the top
	/// level and under `data`, `stats` and `data.stats`.
	pub fn from_json(doc: &Value) -> Self {
		let data = doc.get("data").filter(|v| v.is_object());
		let mut scopes: Vec<&Value> = vec![doc];
		scopes.extend(data);
		scopes.extend(doc.get("stats").filter(|v| v.is_object()));
		scopes.extend(data.and_then(|d| d.get("stats")).filter(|v| v.is_object()));

		let lookup = |keys: &[&str]| scopes.iter().find_map(|s| field(s, keys));

		Self {
			room_id: as_string(lookup(&["room_id", "roomId", "id"])),
			started_at: as_timestamp(lookup(&["start_time", "startTime", "started_at", "create_time"])),
			viewers: as_u64(lookup(&["user_count", "viewerCount", "viewers"])),
			likes: as_u64(lookup(&["like_count", "likeCount", "likes"])),
			coins: as_u64(lookup(&["total_coins", "coins", "diamonds"])),
			followers: as_u64(lookup(&["follower_count", "followerCount", "followers"])),
		}
	}
}

/// HTTP client for the best-effort room lookup.
#[derive(Debug, Clone)]
pub struct RoomInfoClient {
	client: reqwest::Client,
	url_template: String,
	session_token: Option<SecretString>,
	timeout: Duration,
}

impl RoomInfoClient {
	pub fn new(url_template: impl Into<String>, session_token: Option<SecretString>, timeout: Duration) -> Self {
		Self {
			client: reqwest::Client::new(),
			url_template: url_template.into(),
			session_token,
			timeout,
		}
	}

	pub fn url_for(&self, identity: &BroadcastId) -> anyhow::Result<Url> {
		let raw = self
			.url_template
			.replace("{identity}", &urlencoding::encode(identity.as_str()));
		Url::parse(&raw).with_context(|| format!("invalid room info url: {raw}"))
	}

	pub async fn fetch(&self, identity: &BroadcastId) -> anyhow::Result<RoomInfo> {
		let url = self.url_for(identity)?;
		let mut request = self
			.client
			.get(url)
			.timeout(self.timeout)
			.header(ACCEPT, "application/json")
			.header(USER_AGENT, "livehub/0.1");
		if let Some(token) = &self.session_token {
			request = request.header(COOKIE, format!("sessionid={}", token.expose()));
		}

		let resp = request.send().await.context("room info request")?;
		if resp.status() == StatusCode::NOT_FOUND {
			return Err(anyhow!("room not found: {identity}"));
		}
		if !resp.status().is_success() {
			return Err(anyhow!("room info failed: status={}", resp.status()));
		}

		let body: Value = resp.json().await.context("parse room info response")?;
		Ok(RoomInfo::from_json(&body))
	}
}
