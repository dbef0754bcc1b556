#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use livelink_domain::{ClientAction, ClientInfo};
use livelink_platform::queue::WorkQueue;
use livelink_platform::{ClientCommand, new_session_id};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use futures_util::{SinkExt, StreamExt};

/// Fan-out hub for downstream websocket subscribers.
#[derive(Debug, Clone)]
pub struct DistributionHub {
	inner: Arc<Mutex<Inner>>,
	cfg: DistributionHubConfig,
}

#[derive(Debug, Clone)]
pub struct DistributionHubConfig {
	/// Maximum number of queued messages per subscriber.
	pub subscriber_queue_capacity: usize,

	/// Route subscribers are registered under.
	pub route: String,
}

impl Default for DistributionHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			route: "/app".to_string(),
		}
	}
}

#[derive(Debug, Default)]
struct Inner {
	sessions: HashMap<String, SessionEntry>,
}

#[derive(Debug)]
struct SessionEntry {
	route: String,
	tx: mpsc::Sender<Message>,
}

impl DistributionHub {
	pub fn new(cfg: DistributionHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	pub fn route(&self) -> &str {
		&self.cfg.route
	}

	/// Register a subscriber session and get its outbound stream.
	pub async fn subscribe(&self, session_id: &str) -> mpsc::Receiver<Message> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		prune_closed_sessions(&mut inner);
		inner.sessions.insert(
			session_id.to_string(),
			SessionEntry {
				route: self.cfg.route.clone(),
				tx,
			},
		);

		debug!(session_id, subs = inner.sessions.len(), "hub: subscribed");
		rx
	}

	pub async fn remove_session(&self, session_id: &str) {
		let mut inner = self.inner.lock().await;
		inner.sessions.remove(session_id);
		prune_closed_sessions(&mut inner);
	}

	pub async fn session_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.sessions.values().filter(|s| !s.tx.is_closed()).count()
	}

	/// Deliver a payload per its target; returns how many subscribers
	/// accepted it.
	pub async fn deliver(&self, target: &ClientInfo, payload: Vec<u8>) -> usize {
		let message = Message::text(String::from_utf8_lossy(&payload).into_owned());

		let mut inner = self.inner.lock().await;
		prune_closed_sessions(&mut inner);

		let mut delivered = 0;
		let mut dropped = 0;

		match target.action {
			ClientAction::Send => {
				if let Some(entry) = inner.sessions.get(&target.session_id) {
					match entry.tx.try_send(message) {
						Ok(()) => delivered += 1,
						Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
						Err(mpsc::error::TrySendError::Closed(_)) => {}
					}
				} else {
					debug!(session_id = %target.session_id, "hub: target session is gone");
				}
			}
			ClientAction::Broadcast => {
				for entry in inner.sessions.values().filter(|s| s.route == target.route) {
					match entry.tx.try_send(message.clone()) {
						Ok(()) => delivered += 1,
						Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
						Err(mpsc::error::TrySendError::Closed(_)) => {}
					}
				}
			}
		}

		if dropped > 0 {
			metrics::counter!("livelink_hub_dropped_total").increment(dropped as u64);
			debug!(dropped, "hub: dropped due to full subscriber queues");
		}

		delivered
	}
}

fn prune_closed_sessions(inner: &mut Inner) {
	inner.sessions.retain(|_, s| !s.tx.is_closed());
}

/// Accept subscriber sockets until shutdown flips.
pub async fn run_hub_listener(
	listener: TcpListener,
	hub: DistributionHub,
	command_queue: WorkQueue<ClientCommand>,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			accepted = listener.accept() => {
				let (stream, remote) = match accepted {
					Ok(v) => v,
					Err(e) => {
						warn!(error = %e, "hub: accept failed");
						continue;
					}
				};

				metrics::counter!("livelink_hub_connections_total").increment(1);
				info!(remote = %remote, "hub: accepted subscriber");

				let hub = hub.clone();
				let command_queue = command_queue.clone();
				let shutdown = shutdown.clone();
				tokio::spawn(async move {
					if let Err(e) = handle_subscriber(stream, hub, command_queue, shutdown).await {
						debug!(error = %e, "hub: subscriber exited with error");
					}
				});
			}
		}
	}

	Ok(())
}

async fn handle_subscriber(
	stream: TcpStream,
	hub: DistributionHub,
	command_queue: WorkQueue<ClientCommand>,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let route = hub.route().to_string();

	// Subscribers are served on the configured route only.
	let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
		if req.uri().path() == route {
			Ok(resp)
		} else {
			warn!(path = %req.uri().path(), route = %route, "hub: rejecting subscriber on unknown route");
			let mut rejection = ErrorResponse::new(Some("unknown route".to_string()));
			*rejection.status_mut() = StatusCode::NOT_FOUND;
			Err(rejection)
		}
	})
	.await?;
	let (mut sink, mut source) = ws.split();

	let session_id = new_session_id();
	let mut outbound = hub.subscribe(&session_id).await;

	loop {
		tokio::select! {
			_ = shutdown.changed() => {
				let _ = sink.close().await;
				break;
			}

			queued = outbound.recv() => {
				match queued {
					Some(message) => {
						if sink.send(message).await.is_err() {
							break;
						}
					}
					None => break,
				}
			}

			inbound = source.next() => {
				match inbound {
					Some(Ok(Message::Text(text))) => {
						handle_client_text(&text, &route, &session_id, &command_queue, &mut sink).await;
					}
					Some(Ok(Message::Binary(_))) => {
						warn!(session_id = %session_id, "hub: ignoring binary message from subscriber");
					}
					Some(Ok(Message::Ping(payload))) => {
						let _ = sink.send(Message::Pong(payload)).await;
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(e)) => {
						debug!(session_id = %session_id, error = %e, "hub: subscriber socket error");
						break;
					}
				}
			}
		}
	}

	hub.remove_session(&session_id).await;
	debug!(session_id = %session_id, "hub: subscriber removed");
	Ok(())
}

async fn handle_client_text<S>(
	text: &str,
	route: &str,
	session_id: &str,
	command_queue: &WorkQueue<ClientCommand>,
	sink: &mut S,
) where
	S: SinkExt<Message> + Unpin,
{
	let trimmed = text.trim();

	if trimmed.eq_ignore_ascii_case("ping") {
		let _ = sink.send(Message::text("pong")).await;
		return;
	}

	match serde_json::from_str::<ClientCommand>(trimmed) {
		Ok(mut command) => {
			// Whatever identity the client claimed is replaced with the
			// session the hub actually knows.
			command.client_info = Some(ClientInfo::send_to(route, session_id));
			metrics::counter!("livelink_hub_commands_total").increment(1);
			command_queue.enqueue(command);
		}
		Err(e) => {
			warn!(session_id, error = %e, "hub: unparseable client message");
		}
	}
}
