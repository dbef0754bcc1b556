#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.livelink/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".livelink").join("config.toml"))
}

/// Default sqlite database path: `~/.livelink/livelink.db`.
pub fn default_database_url() -> anyhow::Result<String> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	let path = home.join(".livelink").join("livelink.db");
	Ok(format!("sqlite://{}?mode=rwc", path.display()))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub bilibili: BilibiliSettings,
	pub hub: HubSettings,
	pub storage: StorageSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Upstream room settings.
#[derive(Debug, Clone, Default)]
pub struct BilibiliSettings {
	/// Short room id as typed into the site URL.
	pub room_id: Option<u64>,

	/// Live API base (room init / danmaku conf).
	pub live_api_base_url: Option<String>,
	/// Main API base (user profiles).
	pub api_base_url: Option<String>,
	/// Danmaku websocket URL override.
	pub ws_url: Option<String>,
	/// Client version reported in the auth body.
	pub client_version: Option<String>,

	/// Interval between client heartbeats.
	pub heartbeat_interval: Option<Duration>,
	/// How long a heartbeat reply may stay outstanding.
	pub lost_threshold: Option<Duration>,

	/// Reconnect backoff min/max (optional).
	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,
}

/// Downstream rebroadcast settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
	/// Websocket bind address (host:port).
	pub bind: String,
	/// Route subscribers sit on.
	pub route: String,
}

impl Default for HubSettings {
	fn default() -> Self {
		Self {
			bind: "127.0.0.1:18080".to_string(),
			route: "/app".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
	/// Database URL (sqlite:); defaults to `~/.livelink/livelink.db`.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	bilibili: FileBilibiliSettings,

	#[serde(default)]
	hub: FileHubSettings,

	#[serde(default)]
	storage: FileStorageSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBilibiliSettings {
	room_id: Option<u64>,
	live_api_base_url: Option<String>,
	api_base_url: Option<String>,
	ws_url: Option<String>,
	client_version: Option<String>,

	heartbeat_interval_secs: Option<u64>,
	lost_threshold_secs: Option<u64>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	bind: Option<String>,
	route: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStorageSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = HubSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			bilibili: BilibiliSettings {
				room_id: file.bilibili.room_id.filter(|v| *v > 0),
				live_api_base_url: file.bilibili.live_api_base_url.filter(|s| !s.trim().is_empty()),
				api_base_url: file.bilibili.api_base_url.filter(|s| !s.trim().is_empty()),
				ws_url: file.bilibili.ws_url.filter(|s| !s.trim().is_empty()),
				client_version: file.bilibili.client_version.filter(|s| !s.trim().is_empty()),
				heartbeat_interval: file.bilibili.heartbeat_interval_secs.filter(|v| *v > 0).map(Duration::from_secs),
				lost_threshold: file.bilibili.lost_threshold_secs.filter(|v| *v > 0).map(Duration::from_secs),
				reconnect_min_delay: file.bilibili.reconnect_min_delay_ms.map(Duration::from_millis),
				reconnect_max_delay: file.bilibili.reconnect_max_delay_ms.map(Duration::from_millis),
			},
			hub: HubSettings {
				bind: file.hub.bind.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.bind),
				route: file.hub.route.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.route),
			},
			storage: StorageSettings {
				database_url: file.storage.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("LIVELINK_ROOM_ID")
		&& let Ok(room_id) = v.trim().parse::<u64>()
		&& room_id > 0
	{
		cfg.bilibili.room_id = Some(room_id);
		info!(room_id, "bilibili config: room_id overridden by env");
	}

	if let Ok(v) = std::env::var("LIVELINK_LIVE_API_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bilibili.live_api_base_url = Some(v);
			info!("bilibili config: live_api_base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVELINK_API_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bilibili.api_base_url = Some(v);
			info!("bilibili config: api_base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVELINK_WS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bilibili.ws_url = Some(v);
			info!("bilibili config: ws_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVELINK_CLIENT_VERSION") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bilibili.client_version = Some(v);
			info!("bilibili config: client_version overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVELINK_HEARTBEAT_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.bilibili.heartbeat_interval = Some(Duration::from_secs(secs));
		info!(secs, "bilibili config: heartbeat_interval overridden by env");
	}

	if let Ok(v) = std::env::var("LIVELINK_LOST_THRESHOLD_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.bilibili.lost_threshold = Some(Duration::from_secs(secs));
		info!(secs, "bilibili config: lost_threshold overridden by env");
	}

	if let Ok(v) = std::env::var("LIVELINK_RECONNECT_MIN_DELAY_MS")
		&& let Ok(min_ms) = v.trim().parse::<u64>()
	{
		cfg.bilibili.reconnect_min_delay = Some(Duration::from_millis(min_ms));
		info!(min_ms, "bilibili config: reconnect_min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("LIVELINK_RECONNECT_MAX_DELAY_MS")
		&& let Ok(max_ms) = v.trim().parse::<u64>()
	{
		cfg.bilibili.reconnect_max_delay = Some(Duration::from_millis(max_ms));
		info!(max_ms, "bilibili config: reconnect_max_delay overridden by env");
	}

	if let Ok(v) = std::env::var("LIVELINK_HUB_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.hub.bind = v;
			info!("hub config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVELINK_HUB_ROUTE") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.hub.route = v;
			info!("hub config: route overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVELINK_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.storage.database_url = Some(v);
			info!("storage config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LIVELINK_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let (Some(min), Some(max)) = (cfg.bilibili.reconnect_min_delay, cfg.bilibili.reconnect_max_delay)
		&& min > max
	{
		warn!(
			min_ms = min.as_millis(),
			max_ms = max.as_millis(),
			"bilibili config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		cfg.bilibili.reconnect_min_delay = Some(max);
		cfg.bilibili.reconnect_max_delay = Some(min);
	}

	if let (Some(interval), Some(threshold)) = (cfg.bilibili.heartbeat_interval, cfg.bilibili.lost_threshold)
		&& threshold <= interval
	{
		warn!(
			interval_secs = interval.as_secs(),
			threshold_secs = threshold.as_secs(),
			"bilibili config: lost_threshold <= heartbeat_interval; using 3x interval"
		);
		cfg.bilibili.lost_threshold = Some(interval * 3);
	}
}
