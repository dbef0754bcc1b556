#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kinds of events decoded from the upstream danmaku stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Comment,
	Gift,
	Welcome,
	System,
	Renqi,
	Heartbeat,
	Unknown,
}

impl EventKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Comment => "comment",
			EventKind::Gift => "gift",
			EventKind::Welcome => "welcome",
			EventKind::System => "system",
			EventKind::Renqi => "renqi",
			EventKind::Heartbeat => "heartbeat",
			EventKind::Unknown => "unknown",
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
			"comment" | "danmaku" => Ok(EventKind::Comment),
			"gift" => Ok(EventKind::Gift),
			"welcome" => Ok(EventKind::Welcome),
			"system" => Ok(EventKind::System),
			"renqi" | "popularity" => Ok(EventKind::Renqi),
			"heartbeat" => Ok(EventKind::Heartbeat),
			"unknown" => Ok(EventKind::Unknown),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Numeric live-room identifier (the short id users type in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(u64);

impl RoomId {
	/// Create a non-zero `RoomId`.
	pub fn new(id: u64) -> Result<Self, ParseIdError> {
		if id == 0 {
			return Err(ParseIdError::InvalidFormat("room id must be non-zero".into()));
		}
		Ok(Self(id))
	}

	pub fn value(self) -> u64 {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let id: u64 = s
			.parse()
			.map_err(|_| ParseIdError::InvalidFormat(format!("room id must be numeric: {s}")))?;
		RoomId::new(id)
	}
}

/// A decoded chat event, enriched and fanned out downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
	pub id: uuid::Uuid,

	pub kind: EventKind,

	/// Receipt timestamp (server clock, not for ordering).
	pub received_at: DateTime<Utc>,

	#[serde(default)]
	pub sender_id: String,

	#[serde(default)]
	pub sender_name: String,

	/// JPEG avatar as base64, filled by enrichment when cached.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,

	#[serde(default)]
	pub comment: String,

	/// Ordered extra fields (timestamps, flags, counters).
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,

	/// Untouched payload, kept for unknown commands.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub raw: Option<String>,
}

impl ChatEvent {
	/// Construct an event of `kind` stamped with a fresh id and receipt time.
	pub fn new(kind: EventKind) -> Self {
		Self {
			id: uuid::Uuid::new_v4(),
			kind,
			received_at: Utc::now(),
			sender_id: String::new(),
			sender_name: String::new(),
			avatar: None,
			comment: String::new(),
			metadata: BTreeMap::new(),
			raw: None,
		}
	}
}

/// Cached profile for a chat participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
	pub id: String,

	pub name: String,

	#[serde(default)]
	pub sex: String,

	#[serde(default)]
	pub birthday: String,

	pub level: i32,

	/// Source URL of the avatar.
	#[serde(default)]
	pub face_url: String,

	/// JPEG avatar as base64.
	#[serde(default)]
	pub face: String,

	pub updated_at: DateTime<Utc>,
}

impl UserInfo {
	/// Placeholder profile used when the upstream lookup yields nothing.
	pub fn placeholder(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: "<不知名先生>".to_string(),
			sex: "保密".to_string(),
			birthday: "保密".to_string(),
			level: -1,
			face_url: String::new(),
			face: String::new(),
			updated_at: Utc::now(),
		}
	}
}

/// How a delivery should be routed by the distribution side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
	/// Deliver to one subscriber session.
	Send,
	/// Deliver to all subscriber sessions.
	Broadcast,
}

/// Delivery target descriptor attached to outbound work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
	pub action: ClientAction,

	#[serde(default)]
	pub route: String,

	/// Hub session id; required when `action` is `Send`.
	#[serde(default)]
	pub session_id: String,
}

impl ClientInfo {
	pub fn broadcast(route: impl Into<String>) -> Self {
		Self {
			action: ClientAction::Broadcast,
			route: route.into(),
			session_id: String::new(),
		}
	}

	pub fn send_to(route: impl Into<String>, session_id: impl Into<String>) -> Self {
		Self {
			action: ClientAction::Send,
			route: route.into(),
			session_id: session_id.into(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn event_kind_parse_and_display() {
		assert_eq!("comment".parse::<EventKind>().unwrap(), EventKind::Comment);
		assert_eq!("Popularity".parse::<EventKind>().unwrap(), EventKind::Renqi);
		assert_eq!(EventKind::Gift.to_string(), "gift");
		assert!("".parse::<EventKind>().is_err());
	}

	#[test]
	fn room_id_parse_roundtrip() {
		let id: RoomId = "92613".parse().unwrap();
		assert_eq!(id.value(), 92613);
		assert_eq!(id.to_string(), "92613");
	}

	#[test]
	fn room_id_rejects_invalid() {
		assert!(RoomId::new(0).is_err());
		assert!("".parse::<RoomId>().is_err());
		assert!("abc".parse::<RoomId>().is_err());
	}

	#[test]
	fn chat_event_serializes_camel_case() {
		let mut ev = ChatEvent::new(EventKind::Comment);
		ev.sender_id = "42".to_string();
		ev.sender_name = "tester".to_string();
		ev.comment = "hello".to_string();

		let json = serde_json::to_value(&ev).unwrap();
		assert_eq!(json["kind"], "comment");
		assert_eq!(json["senderId"], "42");
		assert_eq!(json["senderName"], "tester");
		// Empty avatar stays off the wire.
		assert!(json.get("avatar").is_none());
	}

	#[test]
	fn placeholder_user_has_masked_fields() {
		let u = UserInfo::placeholder("7");
		assert_eq!(u.id, "7");
		assert_eq!(u.level, -1);
		assert_eq!(u.sex, "保密");
	}

	#[test]
	fn client_info_constructors() {
		let b = ClientInfo::broadcast("/app");
		assert_eq!(b.action, ClientAction::Broadcast);
		assert!(b.session_id.is_empty());

		let s = ClientInfo::send_to("/app", "sess-1");
		assert_eq!(s.action, ClientAction::Send);
		assert_eq!(s.session_id, "sess-1");
	}
}
