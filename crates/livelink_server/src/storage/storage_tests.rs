#![forbid(unsafe_code)]

use bytes::Bytes;
use chrono::{Duration, Utc};
use livelink_domain::{ChatEvent, EventKind, UserInfo};
use livelink_platform::UserStore;
use livelink_protocol::{Frame, MessageType};

use super::SqliteStorage;

async fn memory_storage() -> SqliteStorage {
	SqliteStorage::connect("sqlite::memory:").await.expect("in-memory sqlite")
}

fn comment(sender_id: &str, text: &str) -> ChatEvent {
	let mut ev = ChatEvent::new(EventKind::Comment);
	ev.sender_id = sender_id.to_string();
	ev.sender_name = format!("user-{sender_id}");
	ev.comment = text.to_string();
	ev.metadata.insert("flag1".to_string(), "0".to_string());
	ev
}

#[tokio::test]
async fn user_roundtrips_through_upsert() {
	let storage = memory_storage().await;
	assert!(storage.pick_user("42").await.unwrap().is_none());

	let mut user = UserInfo::placeholder("42");
	user.name = "alice".to_string();
	user.level = 12;
	user.face_url = "http://example/a.png".to_string();
	storage.record_user(&user).await.unwrap();

	let got = storage.pick_user("42").await.unwrap().expect("stored user");
	assert_eq!(got.name, "alice");
	assert_eq!(got.level, 12);
	assert_eq!(got.face_url, "http://example/a.png");
	// Timestamps survive at second precision.
	assert_eq!(got.updated_at.timestamp(), user.updated_at.timestamp());

	user.name = "alice-renamed".to_string();
	storage.record_user(&user).await.unwrap();
	let got = storage.pick_user("42").await.unwrap().expect("stored user");
	assert_eq!(got.name, "alice-renamed");
}

#[tokio::test]
async fn latest_comments_come_back_newest_first() {
	let storage = memory_storage().await;

	let mut first = comment("1", "oldest");
	first.received_at = Utc::now() - Duration::seconds(20);
	let mut second = comment("2", "middle");
	second.received_at = Utc::now() - Duration::seconds(10);
	let third = comment("3", "newest");

	storage.record_chat(&first).await.unwrap();
	storage.record_chat(&second).await.unwrap();
	storage.record_chat(&third).await.unwrap();

	// Non-comment kinds are filtered out.
	let mut system = ChatEvent::new(EventKind::System);
	system.comment = "stream open".to_string();
	storage.record_chat(&system).await.unwrap();

	let latest = storage.pick_latest_comments(2).await.unwrap();
	assert_eq!(latest.len(), 2);
	assert_eq!(latest[0].comment, "newest");
	assert_eq!(latest[1].comment, "middle");
	assert_eq!(latest[0].metadata.get("flag1").map(String::as_str), Some("0"));
}

#[tokio::test]
async fn duplicate_chat_ids_are_ignored() {
	let storage = memory_storage().await;
	let ev = comment("9", "once");

	storage.record_chat(&ev).await.unwrap();
	storage.record_chat(&ev).await.unwrap();

	let latest = storage.pick_latest_comments(10).await.unwrap();
	assert_eq!(latest.len(), 1);
}

#[tokio::test]
async fn raw_frames_are_persisted() {
	let storage = memory_storage().await;
	let frame = Frame::new(1, MessageType::Command, 7, Bytes::from_static(b"{\"cmd\":\"MYSTERY\"}"));

	storage.record_raw_frame(&frame).await.unwrap();
	// Same frame id is a no-op, not an error.
	storage.record_raw_frame(&frame).await.unwrap();
}
