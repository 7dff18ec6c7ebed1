#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kinds of audience interaction carried by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Chat,
	Gift,
	Follow,
	Like,
	Share,
	Join,
}

impl EventKind {
	pub const ALL: [EventKind; 6] = [
		EventKind::Chat,
		EventKind::Gift,
		EventKind::Follow,
		EventKind::Like,
		EventKind::Share,
		EventKind::Join,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Chat => "chat",
			EventKind::Gift => "gift",
			EventKind::Follow => "follow",
			EventKind::Like => "like",
			EventKind::Share => "share",
			EventKind::Join => "join",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown event kind: {0}")]
	UnknownKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for EventKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"chat" | "comment" => Ok(EventKind::Chat),
			"gift" => Ok(EventKind::Gift),
			"follow" => Ok(EventKind::Follow),
			"like" => Ok(EventKind::Like),
			"share" => Ok(EventKind::Share),
			"join" | "member" => Ok(EventKind::Join),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Stable external key of a live broadcast (`@handle` or room key).
///
/// Leading `@` is stripped and ASCII is lowercased, so `@Streamer` and `streamer`
/// name the same broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcastId(String);

impl BroadcastId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let normalized = id.trim().trim_start_matches('@').to_ascii_lowercase();
		if normalized.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if normalized.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("broadcast id must not contain whitespace: {id}")));
		}
		Ok(Self(normalized))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for BroadcastId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for BroadcastId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		BroadcastId::new(s.to_string())
	}
}

/// User profile name; also used as a path segment for the profile's store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
	pub const DEFAULT: &'static str = "default";

	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let id = id.trim();
		if id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
			return Err(ParseIdError::InvalidFormat(format!(
				"profile id may only contain [A-Za-z0-9_-]: {id}"
			)));
		}
		Ok(Self(id.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Default for ProfileId {
	fn default() -> Self {
		Self(Self::DEFAULT.to_string())
	}
}

impl fmt::Display for ProfileId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ProfileId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ProfileId::new(s.to_string())
	}
}

/// Identifier of an extension module registered against the bus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(String);

impl PluginId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for PluginId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for PluginId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		PluginId::new(s.to_string())
	}
}

/// Audience member that caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
	pub id: String,
	pub display_name: String,
}

impl Actor {
	pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			display_name: display_name.into(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn event_kind_parse_and_display() {
		assert_eq!("gift".parse::<EventKind>().unwrap(), EventKind::Gift);
		assert_eq!("Comment".parse::<EventKind>().unwrap(), EventKind::Chat);
		assert_eq!("member".parse::<EventKind>().unwrap(), EventKind::Join);
		assert_eq!(EventKind::Share.to_string(), "share");
		assert!(matches!(
			"subscribe".parse::<EventKind>(),
			Err(ParseIdError::UnknownKind(_))
		));
	}

	#[test]
	fn broadcast_id_normalizes_handle() {
		let a = BroadcastId::new("@Streamer").unwrap();
		let b: BroadcastId = " streamer ".parse().unwrap();
		assert_eq!(a, b);
		assert_eq!(a.as_str(), "streamer");
	}

	#[test]
	fn profile_id_rejects_path_characters() {
		assert!(ProfileId::new("main_1").is_ok());
		assert!(ProfileId::new("../etc").is_err());
		assert_eq!(ProfileId::default().as_str(), "default");
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(BroadcastId::new("@").is_err());
		assert!(PluginId::new("   ").is_err());
		assert!("".parse::<ProfileId>().is_err());
	}
}
