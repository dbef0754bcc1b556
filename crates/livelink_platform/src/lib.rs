#![forbid(unsafe_code)]

pub mod bilibili;
pub mod queue;

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use livelink_domain::{ChatEvent, ClientInfo, UserInfo};
use livelink_protocol::Frame;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Source tag stamped on every work item produced by the ingest side.
pub const SOURCE_BILIBILI: &str = "bilibili";

/// Crawl tasks understood by the crawl worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlTask {
	/// Fetch a user's profile and avatar.
	UserProfile {
		user_id: String,
	},
}

/// Request to fetch something from the upstream HTTP API.
#[derive(Debug, Clone)]
pub struct CrawlWorkItem {
	pub source: String,

	pub task: CrawlTask,

	/// Delivery to make once the result is available.
	pub post_send: Option<ClientInfo>,
}

impl CrawlWorkItem {
	pub fn user_profile(user_id: impl Into<String>, post_send: Option<ClientInfo>) -> Self {
		Self {
			source: SOURCE_BILIBILI.to_string(),
			task: CrawlTask::UserProfile { user_id: user_id.into() },
			post_send,
		}
	}
}

/// Typed payloads accepted by the record worker.
#[derive(Debug, Clone)]
pub enum RecordPayload {
	User(UserInfo),
	Chat(ChatEvent),
	/// Frames nothing else understood, kept verbatim for inspection.
	RawFrame(Frame),
}

impl RecordPayload {
	pub fn kind(&self) -> &'static str {
		match self {
			RecordPayload::User(_) => "user",
			RecordPayload::Chat(_) => "chat",
			RecordPayload::RawFrame(_) => "raw_frame",
		}
	}
}

/// Request to persist one record.
#[derive(Debug, Clone)]
pub struct RecordWorkItem {
	pub source: String,
	pub payload: RecordPayload,
}

impl RecordWorkItem {
	pub fn new(source: impl Into<String>, payload: RecordPayload) -> Self {
		Self {
			source: source.into(),
			payload,
		}
	}
}

/// Request to deliver bytes to one or all hub subscribers.
#[derive(Debug, Clone)]
pub struct SendWorkItem {
	pub source: String,
	pub target: ClientInfo,
	pub payload: Vec<u8>,
}

impl SendWorkItem {
	pub fn new(source: impl Into<String>, target: ClientInfo, payload: Vec<u8>) -> Self {
		Self {
			source: source.into(),
			target,
			payload,
		}
	}
}

/// Inbound command envelope sent by hub subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCommand {
	/// Stamped by the hub with the real session identity; anything the
	/// client put here is overridden.
	#[serde(default)]
	pub client_info: Option<ClientInfo>,

	pub processor: String,

	pub action: String,

	#[serde(default)]
	pub parameters: BTreeMap<String, String>,
}

/// Outbound envelope wrapping everything pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope<'a, T: Serialize> {
	#[serde(rename = "type")]
	pub kind: &'a str,
	pub data: &'a T,
}

/// Serialize a `{"type": ..., "data": ...}` envelope to JSON bytes.
pub fn response_envelope<T: Serialize>(kind: &str, data: &T) -> serde_json::Result<Vec<u8>> {
	serde_json::to_vec(&ResponseEnvelope { kind, data })
}

/// Read side of the user cache consulted before crawling.
#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
	async fn pick_user(&self, user_id: &str) -> anyhow::Result<Option<UserInfo>>;

	/// Insert or replace a cached profile.
	async fn record_user(&self, user: &UserInfo) -> anyhow::Result<()>;
}

/// In-memory `UserStore`, used as a standalone cache in tests and tools.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
	users: parking_lot::RwLock<HashMap<String, UserInfo>>,
}

#[async_trait::async_trait]
impl UserStore for MemoryUserStore {
	async fn pick_user(&self, user_id: &str) -> anyhow::Result<Option<UserInfo>> {
		Ok(self.users.read().get(user_id).cloned())
	}

	async fn record_user(&self, user: &UserInfo) -> anyhow::Result<()> {
		self.users.write().insert(user.id.clone(), user.clone());
		Ok(())
	}
}

/// Upstream session status update.
#[derive(Debug, Clone)]
pub struct SessionStatus {
	pub state: bilibili::SessionState,
	pub detail: String,
	pub last_error: Option<String>,
	pub time: SystemTime,
}

/// Build a status update.
pub fn session_status(state: bilibili::SessionState, detail: impl Into<String>) -> SessionStatus {
	SessionStatus {
		state,
		detail: detail.into(),
		last_error: None,
		time: SystemTime::now(),
	}
}

/// Build a status update that carries an error.
pub fn session_status_error(
	state: bilibili::SessionState,
	detail: impl Into<String>,
	err: impl core::fmt::Display,
) -> SessionStatus {
	SessionStatus {
		state,
		detail: detail.into(),
		last_error: Some(err.to_string()),
		time: SystemTime::now(),
	}
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
	use livelink_domain::ClientAction;

	use super::*;

	#[test]
	fn client_command_parses_minimal_envelope() {
		let cmd: ClientCommand =
			serde_json::from_str(r#"{"processor":"bilibili","action":"queryUserInfo","parameters":{"id":"42"}}"#).unwrap();
		assert!(cmd.client_info.is_none());
		assert_eq!(cmd.processor, "bilibili");
		assert_eq!(cmd.action, "queryUserInfo");
		assert_eq!(cmd.parameters.get("id").map(String::as_str), Some("42"));
	}

	#[test]
	fn client_command_parses_client_info() {
		let cmd: ClientCommand = serde_json::from_str(
			r#"{"clientInfo":{"action":"send","route":"/app","sessionId":"s1"},"processor":"p","action":"a"}"#,
		)
		.unwrap();
		let info = cmd.client_info.expect("client info");
		assert_eq!(info.action, ClientAction::Send);
		assert_eq!(info.session_id, "s1");
	}

	#[test]
	fn response_envelope_shape() {
		let user = UserInfo::placeholder("9");
		let bytes = response_envelope("user-info", &user).unwrap();
		let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(v["type"], "user-info");
		assert_eq!(v["data"]["id"], "9");
	}

	#[tokio::test]
	async fn memory_user_store_roundtrip() {
		let store = MemoryUserStore::default();
		assert!(store.pick_user("1").await.unwrap().is_none());

		let user = UserInfo::placeholder("1");
		store.record_user(&user).await.unwrap();
		assert_eq!(store.pick_user("1").await.unwrap(), Some(user));
	}
}
