#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use livelink_domain::{ChatEvent, ClientInfo, EventKind, RoomId};
use livelink_protocol::{DEFAULT_MAX_FRAME_SIZE, Frame, decode_payload, encode_frame, make_auth_frame, make_heartbeat_frame};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::client::BilibiliClient;
use super::{DEFAULT_CLIENT_VERSION, DEFAULT_WS_URL};
use crate::queue::WorkQueue;
use crate::{
	CrawlWorkItem, RecordPayload, RecordWorkItem, SOURCE_BILIBILI, SendWorkItem, SessionStatus, UserStore, response_envelope,
	session_status, session_status_error,
};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub(crate) type BilibiliWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Socket factory, injectable so tests can point at a local server.
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<BilibiliWs>> + Send + Sync>;

/// Room preparation (real id + token), injectable for the same reason.
pub type RoomPreparer = Arc<dyn Fn(RoomId) -> BoxFuture<'static, anyhow::Result<(u64, String)>> + Send + Sync>;

/// Upstream session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Disconnected,
	Connecting,
	Connected,
	/// Heartbeat reply overdue; a reconnect is underway.
	BadCommunication,
}

impl core::fmt::Display for SessionState {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		let s = match self {
			SessionState::Disconnected => "disconnected",
			SessionState::Connecting => "connecting",
			SessionState::Connected => "connected",
			SessionState::BadCommunication => "bad_communication",
		};
		f.write_str(s)
	}
}

/// Upstream session configuration.
#[derive(Clone)]
pub struct SessionConfig {
	pub room_id: RoomId,
	pub ws_url: String,
	pub client_version: String,

	/// Interval between client heartbeats.
	pub heartbeat_interval: Duration,
	/// How long a heartbeat reply may stay outstanding.
	pub lost_threshold: Duration,

	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,

	pub max_frame_size: usize,

	pub ws_connector: Option<WsConnector>,
	pub room_preparer: Option<RoomPreparer>,
}

impl SessionConfig {
	pub fn new(room_id: RoomId) -> Self {
		Self {
			room_id,
			ws_url: DEFAULT_WS_URL.to_string(),
			client_version: DEFAULT_CLIENT_VERSION.to_string(),
			heartbeat_interval: Duration::from_secs(30),
			lost_threshold: Duration::from_secs(90),
			reconnect_min_delay: Duration::from_secs(1),
			reconnect_max_delay: Duration::from_secs(60),
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
			ws_connector: None,
			room_preparer: None,
		}
	}
}

/// Fan-out target for decoded frames.
///
/// Enrichment consults the user cache; a hit fills the event in place
/// and never re-fetches, a miss queues a crawl that will broadcast the
/// profile once fetched.
#[derive(Clone)]
pub struct IngestPipeline {
	pub user_store: Arc<dyn UserStore>,
	pub crawl_queue: WorkQueue<CrawlWorkItem>,
	pub record_queue: WorkQueue<RecordWorkItem>,
	pub send_queue: WorkQueue<SendWorkItem>,
	/// Route subscribers sit on, stamped into broadcast targets.
	pub route: String,
}

impl IngestPipeline {
	pub async fn ingest_frame(&self, frame: Frame) {
		let Some(mut event) = super::decode_event(&frame) else {
			metrics::counter!("livelink_frames_dropped_total").increment(1);
			return;
		};

		metrics::counter!("livelink_events_total", "kind" => event.kind.as_str()).increment(1);

		if event.kind == EventKind::Unknown {
			self.record_queue
				.enqueue(RecordWorkItem::new(SOURCE_BILIBILI, RecordPayload::RawFrame(frame)));
			return;
		}

		if !event.sender_id.is_empty() {
			self.enrich_or_crawl(&mut event).await;
		}

		self.record_queue
			.enqueue(RecordWorkItem::new(SOURCE_BILIBILI, RecordPayload::Chat(event.clone())));

		match response_envelope("user-info", &event) {
			Ok(payload) => {
				self.send_queue.enqueue(SendWorkItem::new(
					SOURCE_BILIBILI,
					ClientInfo::broadcast(&self.route),
					payload,
				));
			}
			Err(e) => warn!(event_id = %event.id, error = %e, "failed to serialize event for broadcast"),
		}
	}

	async fn enrich_or_crawl(&self, event: &mut ChatEvent) {
		match self.user_store.pick_user(&event.sender_id).await {
			Ok(Some(user)) => {
				if !user.face.is_empty() {
					event.avatar = Some(user.face);
				}
				event.metadata.insert("face_url".to_string(), user.face_url);
				event.sender_name = user.name;
			}
			Ok(None) => {
				self.crawl_queue.enqueue(CrawlWorkItem::user_profile(
					event.sender_id.clone(),
					Some(ClientInfo::broadcast(&self.route)),
				));
			}
			Err(e) => {
				warn!(sender_id = %event.sender_id, error = %e, "user cache lookup failed");
				self.crawl_queue.enqueue(CrawlWorkItem::user_profile(
					event.sender_id.clone(),
					Some(ClientInfo::broadcast(&self.route)),
				));
			}
		}
	}
}

/// Reconnecting upstream session.
///
/// Owns the socket for its whole lifetime; the read loop, heartbeat
/// clock, and reconnect policy all live in `run`.
pub struct ConnectionSession {
	cfg: SessionConfig,
	client: BilibiliClient,
	pipeline: IngestPipeline,
	status_tx: Option<mpsc::Sender<SessionStatus>>,
	state: SessionState,
}

impl ConnectionSession {
	pub fn new(cfg: SessionConfig, client: BilibiliClient, pipeline: IngestPipeline) -> Self {
		Self {
			cfg,
			client,
			pipeline,
			status_tx: None,
			state: SessionState::Disconnected,
		}
	}

	/// Attach a channel that receives state transitions.
	pub fn with_status_sender(mut self, tx: mpsc::Sender<SessionStatus>) -> Self {
		self.status_tx = Some(tx);
		self
	}

	fn set_state(&mut self, state: SessionState, detail: &str) {
		if self.state != state {
			info!(from = %self.state, to = %state, detail, "session state changed");
		}
		self.state = state;
		if let Some(tx) = &self.status_tx {
			let _ = tx.try_send(session_status(state, detail));
		}
	}

	fn report_error(&self, state: SessionState, detail: &str, err: &anyhow::Error) {
		if let Some(tx) = &self.status_tx {
			let _ = tx.try_send(session_status_error(state, detail, err));
		}
	}

	fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

	async fn connect_danmaku_ws(url: Url) -> anyhow::Result<BilibiliWs> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to danmaku ws")?;
		Ok(ws)
	}

	fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| {
			Box::pin(async move { Self::connect_danmaku_ws(url).await }) as BoxFuture<'static, anyhow::Result<BilibiliWs>>
		})
	}

	fn room_preparer(&self) -> RoomPreparer {
		if let Some(p) = &self.cfg.room_preparer {
			return p.clone();
		}

		let client = self.client.clone();
		Arc::new(move |room_id: RoomId| {
			let client = client.clone();
			Box::pin(async move {
				let real_room_id = client.resolve_room_id(room_id).await.context("resolve real room id")?;
				let token = client.fetch_danmu_token(room_id).await.context("fetch danmaku token")?;
				Ok((real_room_id, token))
			}) as BoxFuture<'static, anyhow::Result<(u64, String)>>
		})
	}

	/// Run until the shutdown signal flips.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
		let connector = self.ws_connector();
		let preparer = self.room_preparer();
		let ws_url = Url::parse(&self.cfg.ws_url).context("parse danmaku ws url")?;

		let mut reconnect_attempt: u32 = 0;

		'outer: loop {
			if *shutdown.borrow() {
				break;
			}

			self.set_state(SessionState::Connecting, "preparing room");

			let prepared = tokio::select! {
				r = (preparer)(self.cfg.room_id) => r,
				_ = shutdown.changed() => break 'outer,
			};

			let (real_room_id, token) = match prepared {
				Ok(v) => v,
				Err(e) => {
					warn!(room_id = %self.cfg.room_id, error = %e, "room preparation failed");
					self.report_error(SessionState::Disconnected, "room preparation failed", &e);
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					if self.wait_backoff(reconnect_attempt, &mut shutdown).await {
						break 'outer;
					}
					continue;
				}
			};

			let mut ws = match (connector)(ws_url.clone()).await {
				Ok(ws) => ws,
				Err(e) => {
					warn!(room_id = %self.cfg.room_id, error = %e, "danmaku socket connect failed");
					self.report_error(SessionState::Disconnected, "socket connect failed", &e);
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					if self.wait_backoff(reconnect_attempt, &mut shutdown).await {
						break 'outer;
					}
					continue;
				}
			};

			let auth = match make_auth_frame("0", real_room_id, &token, &self.cfg.client_version) {
				Ok(f) => f,
				Err(e) => return Err(anyhow::Error::new(e).context("build auth frame")),
			};

			if let Err(e) = ws.send(Message::binary(encode_frame(&auth))).await {
				warn!(real_room_id, error = %e, "failed to send auth frame");
				reconnect_attempt = reconnect_attempt.saturating_add(1);
				if self.wait_backoff(reconnect_attempt, &mut shutdown).await {
					break 'outer;
				}
				continue;
			}

			info!(room_id = %self.cfg.room_id, real_room_id, "danmaku session connected");
			self.set_state(SessionState::Connected, "authenticated");
			reconnect_attempt = 0;

			// First heartbeat goes out immediately; the auth reply clears it.
			let mut await_reply = false;
			let mut last_heartbeat_sent = Instant::now();
			if let Err(e) = ws.send(Message::binary(encode_frame(&make_heartbeat_frame()))).await {
				warn!(error = %e, "failed to send initial heartbeat");
			} else {
				await_reply = true;
			}

			loop {
				tokio::select! {
					_ = shutdown.changed() => {
						let _ = ws.close(None).await;
						break 'outer;
					}

					msg = ws.next() => {
						match msg {
							Some(Ok(Message::Binary(payload))) => {
								await_reply = false;
								let (frames, errors) = decode_payload(&payload, self.cfg.max_frame_size);
								metrics::counter!("livelink_frames_decoded_total").increment(frames.len() as u64);
								for e in &errors {
									metrics::counter!("livelink_frame_errors_total").increment(1);
									warn!(error = %e, "frame decode error");
								}
								for frame in frames {
									self.pipeline.ingest_frame(frame).await;
								}
							}
							Some(Ok(Message::Ping(p))) => {
								await_reply = false;
								let _ = ws.send(Message::Pong(p)).await;
							}
							Some(Ok(Message::Close(c))) => {
								info!(close = ?c, "danmaku socket closed by server");
								break;
							}
							Some(Ok(other)) => {
								await_reply = false;
								debug!(message = ?other, "ignoring non-binary danmaku message");
							}
							Some(Err(e)) => {
								warn!(error = %e, "danmaku socket error");
								break;
							}
							None => {
								info!("danmaku socket stream ended");
								break;
							}
						}
					}

					_ = sleep_until(last_heartbeat_sent + self.cfg.heartbeat_interval), if !await_reply => {
						if let Err(e) = ws.send(Message::binary(encode_frame(&make_heartbeat_frame()))).await {
							warn!(error = %e, "failed to send heartbeat");
							break;
						}
						last_heartbeat_sent = Instant::now();
						await_reply = true;
					}

					_ = sleep_until(last_heartbeat_sent + self.cfg.lost_threshold), if await_reply => {
						warn!(
							overdue_ms = self.cfg.lost_threshold.as_millis() as u64,
							"heartbeat reply overdue; reconnecting"
						);
						self.set_state(SessionState::BadCommunication, "heartbeat reply overdue");
						metrics::counter!("livelink_session_reconnects_total").increment(1);
						break;
					}
				}
			}

			let _ = ws.close(None).await;
			reconnect_attempt = reconnect_attempt.saturating_add(1);
			if self.wait_backoff(reconnect_attempt, &mut shutdown).await {
				break 'outer;
			}
		}

		self.set_state(SessionState::Disconnected, "shutdown");
		Ok(())
	}

	/// Sleep out the backoff; returns true when shutdown fired instead.
	async fn wait_backoff(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
		let delay = Self::backoff_delay(attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
		debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
		tokio::select! {
			_ = sleep(delay) => false,
			_ = shutdown.changed() => true,
		}
	}
}
