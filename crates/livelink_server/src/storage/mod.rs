#![forbid(unsafe_code)]

#[cfg(test)]
mod storage_tests;

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use livelink_domain::{ChatEvent, EventKind, UserInfo};
use livelink_platform::UserStore;
use livelink_protocol::Frame;
use uuid::Uuid;

/// Sqlite-backed store for user profiles, chat history, and frames
/// nothing understood.
#[derive(Clone)]
pub struct SqliteStorage {
	pool: sqlx::SqlitePool,
}

impl SqliteStorage {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS users (\
				id TEXT PRIMARY KEY, \
				name TEXT NOT NULL, \
				sex TEXT NOT NULL, \
				birthday TEXT NOT NULL, \
				level INTEGER NOT NULL, \
				face_url TEXT NOT NULL, \
				face TEXT NOT NULL, \
				updated_at INTEGER NOT NULL)",
		)
		.execute(&pool)
		.await
		.context("create users table")?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS chat_log (\
				id TEXT PRIMARY KEY, \
				kind TEXT NOT NULL, \
				received_at INTEGER NOT NULL, \
				day TEXT NOT NULL, \
				sender_id TEXT NOT NULL, \
				sender_name TEXT NOT NULL, \
				avatar TEXT, \
				comment TEXT NOT NULL, \
				metadata TEXT NOT NULL, \
				raw TEXT)",
		)
		.execute(&pool)
		.await
		.context("create chat_log table")?;

		sqlx::query("CREATE INDEX IF NOT EXISTS idx_chat_log_kind_received ON chat_log (kind, received_at)")
			.execute(&pool)
			.await
			.context("create chat_log index")?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS raw_frames (\
				id TEXT PRIMARY KEY, \
				received_at INTEGER NOT NULL, \
				day TEXT NOT NULL, \
				message_type TEXT NOT NULL, \
				protocol_version INTEGER NOT NULL, \
				sequence INTEGER NOT NULL, \
				body BLOB NOT NULL)",
		)
		.execute(&pool)
		.await
		.context("create raw_frames table")?;

		Ok(Self { pool })
	}

	pub async fn record_chat(&self, event: &ChatEvent) -> anyhow::Result<()> {
		let metadata = serde_json::to_string(&event.metadata).context("serialize chat metadata")?;

		sqlx::query(
			"INSERT INTO chat_log (id, kind, received_at, day, sender_id, sender_name, avatar, comment, metadata, raw) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
			ON CONFLICT(id) DO NOTHING",
		)
		.bind(event.id.to_string())
		.bind(event.kind.as_str())
		.bind(event.received_at.timestamp())
		.bind(event.received_at.format("%Y-%m-%d").to_string())
		.bind(&event.sender_id)
		.bind(&event.sender_name)
		.bind(event.avatar.as_deref())
		.bind(&event.comment)
		.bind(metadata)
		.bind(event.raw.as_deref())
		.execute(&self.pool)
		.await
		.context("insert chat_log")?;

		Ok(())
	}

	pub async fn record_raw_frame(&self, frame: &Frame) -> anyhow::Result<()> {
		let now = Utc::now();

		sqlx::query(
			"INSERT INTO raw_frames (id, received_at, day, message_type, protocol_version, sequence, body) \
			VALUES (?, ?, ?, ?, ?, ?, ?) \
			ON CONFLICT(id) DO NOTHING",
		)
		.bind(frame.id.to_string())
		.bind(now.timestamp())
		.bind(now.format("%Y-%m-%d").to_string())
		.bind(frame.message_type.to_string())
		.bind(frame.protocol_version as i64)
		.bind(frame.sequence as i64)
		.bind(frame.body.as_ref())
		.execute(&self.pool)
		.await
		.context("insert raw_frames")?;

		Ok(())
	}

	/// Newest comments first.
	pub async fn pick_latest_comments(&self, limit: u32) -> anyhow::Result<Vec<ChatEvent>> {
		let rows: Vec<ChatRow> = sqlx::query_as(
			"SELECT id, kind, received_at, sender_id, sender_name, avatar, comment, metadata, raw \
			FROM chat_log WHERE kind = ? ORDER BY received_at DESC, id DESC LIMIT ?",
		)
		.bind(EventKind::Comment.as_str())
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.context("select latest comments")?;

		rows.into_iter().map(ChatRow::into_event).collect()
	}
}

#[derive(sqlx::FromRow)]
struct ChatRow {
	id: String,
	kind: String,
	received_at: i64,
	sender_id: String,
	sender_name: String,
	avatar: Option<String>,
	comment: String,
	metadata: String,
	raw: Option<String>,
}

impl ChatRow {
	fn into_event(self) -> anyhow::Result<ChatEvent> {
		let metadata: BTreeMap<String, String> = serde_json::from_str(&self.metadata).context("parse chat metadata")?;

		Ok(ChatEvent {
			id: Uuid::parse_str(&self.id).context("parse chat event id")?,
			kind: self.kind.parse().unwrap_or(EventKind::Unknown),
			received_at: DateTime::<Utc>::from_timestamp(self.received_at, 0).unwrap_or_default(),
			sender_id: self.sender_id,
			sender_name: self.sender_name,
			avatar: self.avatar,
			comment: self.comment,
			metadata,
			raw: self.raw,
		})
	}
}

#[async_trait::async_trait]
impl UserStore for SqliteStorage {
	async fn pick_user(&self, user_id: &str) -> anyhow::Result<Option<UserInfo>> {
		let row: Option<(String, String, String, String, i64, String, String, i64)> = sqlx::query_as(
			"SELECT id, name, sex, birthday, level, face_url, face, updated_at FROM users WHERE id = ?",
		)
		.bind(user_id)
		.fetch_optional(&self.pool)
		.await
		.context("select user")?;

		Ok(row.map(|(id, name, sex, birthday, level, face_url, face, updated_at)| UserInfo {
			id,
			name,
			sex,
			birthday,
			level: level as i32,
			face_url,
			face,
			updated_at: DateTime::<Utc>::from_timestamp(updated_at, 0).unwrap_or_default(),
		}))
	}

	async fn record_user(&self, user: &UserInfo) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO users (id, name, sex, birthday, level, face_url, face, updated_at) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
			ON CONFLICT(id) DO UPDATE SET \
				name = excluded.name, \
				sex = excluded.sex, \
				birthday = excluded.birthday, \
				level = excluded.level, \
				face_url = excluded.face_url, \
				face = excluded.face, \
				updated_at = excluded.updated_at",
		)
		.bind(&user.id)
		.bind(&user.name)
		.bind(&user.sex)
		.bind(&user.birthday)
		.bind(user.level as i64)
		.bind(&user.face_url)
		.bind(&user.face)
		.bind(user.updated_at.timestamp())
		.execute(&self.pool)
		.await
		.context("upsert user")?;

		Ok(())
	}
}
