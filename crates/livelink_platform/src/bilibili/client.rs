#![forbid(unsafe_code)]

use std::io::Cursor;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use livelink_domain::{RoomId, UserInfo};
use serde::Deserialize;

use super::{DEFAULT_API_BASE_URL, DEFAULT_LIVE_API_BASE_URL};

/// Browser-looking headers; the profile endpoint rejects bare clients.
const USER_AGENT: &str =
	"Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/52.0.2743.116 Safari/537.36";
const REFERER: &str = "http://m.bilibili.com";

/// Longest edge of the re-encoded avatar thumbnail.
const AVATAR_MAX_EDGE: u32 = 256;

#[derive(Debug, Clone)]
pub struct BilibiliClientConfig {
	pub live_api_base_url: String,
	pub api_base_url: String,
}

impl Default for BilibiliClientConfig {
	fn default() -> Self {
		Self {
			live_api_base_url: DEFAULT_LIVE_API_BASE_URL.to_string(),
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
		}
	}
}

/// HTTP client for the room and profile endpoints.
#[derive(Debug, Clone)]
pub struct BilibiliClient {
	cfg: BilibiliClientConfig,
	client: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
struct RoomInitResponse {
	data: Option<RoomInitData>,
}

#[derive(Debug, Clone, Deserialize)]
struct RoomInitData {
	room_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct DanmuConfResponse {
	data: Option<DanmuConfData>,
}

#[derive(Debug, Clone, Deserialize)]
struct DanmuConfData {
	token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AccInfoResponse {
	data: Option<AccInfoData>,
}

/// Raw profile fields as the API returns them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccInfoData {
	pub name: Option<String>,
	pub sex: Option<String>,
	pub face: Option<String>,
	pub birthday: Option<String>,
	pub level_info: Option<LevelInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LevelInfo {
	pub current_level: Option<i32>,
}

impl BilibiliClient {
	pub fn new(cfg: BilibiliClientConfig) -> Self {
		Self {
			cfg,
			client: reqwest::Client::new(),
		}
	}

	/// Resolve the short room id users type into the real room id.
	pub async fn resolve_room_id(&self, room_id: RoomId) -> anyhow::Result<u64> {
		let url = format!(
			"{}/room/v1/Room/room_init?id={}",
			self.cfg.live_api_base_url.trim_end_matches('/'),
			room_id
		);

		let resp: RoomInitResponse = self
			.client
			.get(url)
			.send()
			.await
			.context("bilibili room_init")?
			.json()
			.await
			.context("parse room_init response")?;

		resp.data
			.map(|d| d.room_id)
			.ok_or_else(|| anyhow!("room_init returned no data for room {room_id}"))
	}

	/// Fetch the danmaku auth token for a room.
	pub async fn fetch_danmu_token(&self, room_id: RoomId) -> anyhow::Result<String> {
		let url = format!(
			"{}/room/v1/Danmu/getConf?room_id={}",
			self.cfg.live_api_base_url.trim_end_matches('/'),
			room_id
		);

		let resp: DanmuConfResponse = self
			.client
			.get(url)
			.send()
			.await
			.context("bilibili getConf")?
			.json()
			.await
			.context("parse getConf response")?;

		resp.data
			.map(|d| d.token)
			.ok_or_else(|| anyhow!("getConf returned no token for room {room_id}"))
	}

	/// Fetch a user's raw profile; `None` when the API has no data.
	pub async fn fetch_user_profile(&self, user_id: &str) -> anyhow::Result<Option<AccInfoData>> {
		let url = format!(
			"{}/x/space/acc/info?mid={}",
			self.cfg.api_base_url.trim_end_matches('/'),
			user_id
		);

		let resp: AccInfoResponse = self
			.client
			.get(url)
			.header("User-Agent", USER_AGENT)
			.header("Referer", REFERER)
			.header("Origin", REFERER)
			.send()
			.await
			.context("bilibili acc/info")?
			.json()
			.await
			.context("parse acc/info response")?;

		Ok(resp.data)
	}

	/// Download an avatar and re-encode it as a base64 JPEG thumbnail.
	pub async fn fetch_avatar_jpeg_base64(&self, face_url: &str) -> anyhow::Result<String> {
		let bytes = self
			.client
			.get(face_url)
			.header("User-Agent", USER_AGENT)
			.send()
			.await
			.context("bilibili avatar download")?
			.bytes()
			.await
			.context("read avatar bytes")?;

		encode_avatar_jpeg_base64(&bytes)
	}

	/// Fetch a full `UserInfo`, masked defaults for anything missing.
	pub async fn fetch_user_info(&self, user_id: &str) -> anyhow::Result<Option<UserInfo>> {
		let Some(profile) = self.fetch_user_profile(user_id).await? else {
			return Ok(None);
		};

		let face_url = profile.face.clone().unwrap_or_default();
		let face = if face_url.is_empty() {
			String::new()
		} else {
			match self.fetch_avatar_jpeg_base64(&face_url).await {
				Ok(face) => face,
				Err(e) => {
					tracing::warn!(user_id, error = %e, "avatar fetch failed; storing profile without avatar");
					String::new()
				}
			}
		};

		Ok(Some(build_user_info(user_id, profile, face_url, face)))
	}
}

/// Apply the masked-profile defaults for fields the API withheld.
pub fn build_user_info(user_id: &str, profile: AccInfoData, face_url: String, face: String) -> UserInfo {
	UserInfo {
		id: user_id.to_string(),
		name: profile.name.filter(|s| !s.is_empty()).unwrap_or_else(|| "<不知名先生>".to_string()),
		sex: profile.sex.filter(|s| !s.is_empty()).unwrap_or_else(|| "保密".to_string()),
		birthday: profile
			.birthday
			.filter(|s| !s.is_empty())
			.unwrap_or_else(|| "保密".to_string()),
		level: profile.level_info.and_then(|l| l.current_level).unwrap_or(-1),
		face_url,
		face,
		updated_at: Utc::now(),
	}
}

/// Decode any supported image format and re-encode a JPEG thumbnail.
pub fn encode_avatar_jpeg_base64(data: &[u8]) -> anyhow::Result<String> {
	let img = image::load_from_memory(data).context("decode avatar image")?;
	let thumb = img.thumbnail(AVATAR_MAX_EDGE, AVATAR_MAX_EDGE);

	let mut jpeg = Vec::new();
	thumb
		.write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
		.context("encode avatar jpeg")?;

	Ok(BASE64.encode(&jpeg))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn build_user_info_applies_masked_defaults() {
		let user = build_user_info("77", AccInfoData::default(), String::new(), String::new());
		assert_eq!(user.id, "77");
		assert_eq!(user.name, "<不知名先生>");
		assert_eq!(user.sex, "保密");
		assert_eq!(user.birthday, "保密");
		assert_eq!(user.level, -1);
	}

	#[test]
	fn build_user_info_keeps_provided_fields() {
		let profile = AccInfoData {
			name: Some("tester".to_string()),
			sex: Some("女".to_string()),
			birthday: Some("01-01".to_string()),
			face: Some("http://example/face.png".to_string()),
			level_info: Some(LevelInfo { current_level: Some(6) }),
		};

		let user = build_user_info("5", profile, "http://example/face.png".to_string(), "abc".to_string());
		assert_eq!(user.name, "tester");
		assert_eq!(user.level, 6);
		assert_eq!(user.face_url, "http://example/face.png");
		assert_eq!(user.face, "abc");
	}

	#[test]
	fn avatar_reencode_produces_base64_jpeg() {
		let mut png = Vec::new();
		image::DynamicImage::new_rgb8(4, 4)
			.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
			.expect("encode png");

		let b64 = encode_avatar_jpeg_base64(&png).expect("reencode");
		let jpeg = BASE64.decode(b64).expect("valid base64");
		// JPEG SOI marker.
		assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
	}

	#[test]
	fn avatar_reencode_rejects_garbage() {
		assert!(encode_avatar_jpeg_base64(b"not an image").is_err());
	}
}
