#![forbid(unsafe_code)]

mod config;
mod server;
mod storage;

use std::sync::Arc;

use anyhow::Context;
use livelink_domain::RoomId;
use livelink_platform::bilibili::{BilibiliClient, BilibiliClientConfig, ConnectionSession, IngestPipeline, SessionConfig};
use livelink_platform::queue::WorkQueue;
use livelink_platform::{SessionStatus, UserStore};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::hub::{DistributionHub, DistributionHubConfig, run_hub_listener};
use crate::server::workers::{run_client_command_worker, run_crawl_worker, run_record_worker, run_send_worker};
use crate::storage::SqliteStorage;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: livelink_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Hub bind address (default: 127.0.0.1:18080)\n\
\t--config  Config file path (default: ~/.livelink/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind_override: Option<String>,
	config_path: Option<std::path::PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind_override: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind_override = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty (expected a file path)");
					usage_and_exit();
				}
				args.config_path = Some(std::path::PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,livelink_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn spawn_status_logger(mut rx: mpsc::Receiver<SessionStatus>) {
	tokio::spawn(async move {
		while let Some(status) = rx.recv().await {
			match &status.last_error {
				Some(err) => warn!(state = %status.state, detail = %status.detail, error = %err, "upstream session status"),
				None => info!(state = %status.state, detail = %status.detail, "upstream session status"),
			}
		}
	});
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.bind_override {
		server_cfg.hub.bind = bind;
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let room_id = match server_cfg.bilibili.room_id {
		Some(id) => RoomId::new(id).context("invalid bilibili.room_id")?,
		None => anyhow::bail!("bilibili.room_id must be set (config file or LIVELINK_ROOM_ID)"),
	};

	let database_url = match server_cfg.storage.database_url.clone() {
		Some(url) => url,
		None => {
			let url = crate::config::default_database_url()?;
			if let Some(dir) = crate::config::default_config_path()?.parent() {
				std::fs::create_dir_all(dir).context("create data directory")?;
			}
			url
		}
	};
	let storage = SqliteStorage::connect(&database_url).await?;
	info!("storage ready");

	let store: Arc<dyn UserStore> = Arc::new(storage.clone());

	let crawl_queue = WorkQueue::new();
	let record_queue = WorkQueue::new();
	let send_queue = WorkQueue::new();
	let command_queue = WorkQueue::new();

	let hub = DistributionHub::new(DistributionHubConfig {
		route: server_cfg.hub.route.clone(),
		..DistributionHubConfig::default()
	});

	let listener = TcpListener::bind(&server_cfg.hub.bind)
		.await
		.with_context(|| format!("bind hub listener on {}", server_cfg.hub.bind))?;
	info!(bind = %server_cfg.hub.bind, route = %server_cfg.hub.route, "hub listening");

	let mut client_cfg = BilibiliClientConfig::default();
	if let Some(url) = server_cfg.bilibili.live_api_base_url.clone() {
		client_cfg.live_api_base_url = url;
	}
	if let Some(url) = server_cfg.bilibili.api_base_url.clone() {
		client_cfg.api_base_url = url;
	}
	let client = BilibiliClient::new(client_cfg);

	let mut session_cfg = SessionConfig::new(room_id);
	if let Some(url) = server_cfg.bilibili.ws_url.clone() {
		session_cfg.ws_url = url;
	}
	if let Some(version) = server_cfg.bilibili.client_version.clone() {
		session_cfg.client_version = version;
	}
	if let Some(interval) = server_cfg.bilibili.heartbeat_interval {
		session_cfg.heartbeat_interval = interval;
	}
	if let Some(threshold) = server_cfg.bilibili.lost_threshold {
		session_cfg.lost_threshold = threshold;
	}
	if let Some(min) = server_cfg.bilibili.reconnect_min_delay {
		session_cfg.reconnect_min_delay = min;
	}
	if let Some(max) = server_cfg.bilibili.reconnect_max_delay {
		session_cfg.reconnect_max_delay = max;
	}

	let pipeline = IngestPipeline {
		user_store: Arc::clone(&store),
		crawl_queue: crawl_queue.clone(),
		record_queue: record_queue.clone(),
		send_queue: send_queue.clone(),
		route: server_cfg.hub.route.clone(),
	};

	let (status_tx, status_rx) = mpsc::channel(64);
	spawn_status_logger(status_rx);

	let session = ConnectionSession::new(session_cfg, client.clone(), pipeline).with_status_sender(status_tx);

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let hub_task = tokio::spawn(run_hub_listener(listener, hub.clone(), command_queue.clone(), shutdown_rx.clone()));

	tokio::spawn(run_crawl_worker(
		crawl_queue.clone(),
		client,
		Arc::clone(&store),
		record_queue.clone(),
		send_queue.clone(),
		shutdown_rx.clone(),
	));
	tokio::spawn(run_record_worker(record_queue.clone(), storage.clone(), shutdown_rx.clone()));
	tokio::spawn(run_send_worker(send_queue.clone(), hub.clone(), shutdown_rx.clone()));
	tokio::spawn(run_client_command_worker(
		command_queue.clone(),
		Arc::clone(&store),
		crawl_queue.clone(),
		send_queue.clone(),
		shutdown_rx.clone(),
	));

	let session_task = tokio::spawn(session.run(shutdown_rx));

	info!(room_id = %room_id, "livelink_server running; ctrl-c to stop");
	tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
	info!("shutdown requested");
	let _ = shutdown_tx.send(true);

	if let Err(e) = session_task.await.context("join session task")? {
		warn!(error = %e, "upstream session exited with error");
	}
	if let Err(e) = hub_task.await.context("join hub task")? {
		warn!(error = %e, "hub listener exited with error");
	}

	Ok(())
}
