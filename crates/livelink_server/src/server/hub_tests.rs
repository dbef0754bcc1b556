#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use livelink_domain::{ClientAction, ClientInfo};
use livelink_platform::ClientCommand;
use livelink_platform::queue::WorkQueue;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;

use super::hub::{DistributionHub, DistributionHubConfig, run_hub_listener};

type WsClient = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_hub() -> (DistributionHub, WorkQueue<ClientCommand>, SocketAddr, watch::Sender<bool>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	let hub = DistributionHub::new(DistributionHubConfig::default());
	let command_queue = WorkQueue::new();
	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	tokio::spawn(run_hub_listener(listener, hub.clone(), command_queue.clone(), shutdown_rx));

	(hub, command_queue, addr, shutdown_tx)
}

async fn connect_subscriber(hub: &DistributionHub, addr: SocketAddr, expected_sessions: usize) -> WsClient {
	let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/app")).await.unwrap();

	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while hub.session_count().await < expected_sessions && tokio::time::Instant::now() < deadline {
		sleep(Duration::from_millis(5)).await;
	}
	assert_eq!(hub.session_count().await, expected_sessions, "subscriber not registered");

	client
}

async fn next_text(client: &mut WsClient) -> String {
	loop {
		let message = timeout(Duration::from_secs(5), client.next())
			.await
			.expect("message in time")
			.expect("stream open")
			.expect("socket ok");
		if let Message::Text(text) = message {
			return text.to_string();
		}
	}
}

#[tokio::test]
async fn ping_gets_a_pong() {
	let (hub, _commands, addr, shutdown) = start_hub().await;
	let mut client = connect_subscriber(&hub, addr, 1).await;

	client.send(Message::text("PING")).await.unwrap();
	assert_eq!(next_text(&mut client).await, "pong");

	shutdown.send(true).unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_subscriber() {
	let (hub, _commands, addr, shutdown) = start_hub().await;
	let mut first = connect_subscriber(&hub, addr, 1).await;
	let mut second = connect_subscriber(&hub, addr, 2).await;

	let delivered = hub
		.deliver(&ClientInfo::broadcast("/app"), br#"{"type":"user-info","data":{}}"#.to_vec())
		.await;
	assert_eq!(delivered, 2);

	assert!(next_text(&mut first).await.contains("user-info"));
	assert!(next_text(&mut second).await.contains("user-info"));

	shutdown.send(true).unwrap();
}

#[tokio::test]
async fn json_command_is_stamped_and_targeted_reply_reaches_only_the_sender() {
	let (hub, commands, addr, shutdown) = start_hub().await;
	let mut asker = connect_subscriber(&hub, addr, 1).await;
	let mut bystander = connect_subscriber(&hub, addr, 2).await;

	asker
		.send(Message::text(
			r#"{"clientInfo":{"action":"broadcast","route":"/spoofed","sessionId":"fake"},"processor":"bilibili","action":"queryUserInfo","parameters":{"id":"42"}}"#,
		))
		.await
		.unwrap();

	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while commands.is_empty() && tokio::time::Instant::now() < deadline {
		sleep(Duration::from_millis(5)).await;
	}

	let command = commands.dequeue().expect("stamped command");
	assert_eq!(command.processor, "bilibili");
	let info = command.client_info.expect("stamped client info");
	assert_eq!(info.action, ClientAction::Send);
	assert_eq!(info.route, "/app", "claimed identity must be replaced");
	assert_ne!(info.session_id, "fake");

	// A targeted reply lands on the asking session only.
	let delivered = hub.deliver(&info, br#"{"type":"user-info","data":{"id":"42"}}"#.to_vec()).await;
	assert_eq!(delivered, 1);
	assert!(next_text(&mut asker).await.contains("\"42\""));

	// The bystander sees nothing; a ping round-trip proves its stream is
	// empty but alive.
	bystander.send(Message::text("ping")).await.unwrap();
	assert_eq!(next_text(&mut bystander).await, "pong");

	shutdown.send(true).unwrap();
}

#[tokio::test]
async fn subscribers_on_an_unknown_route_are_rejected() {
	let (hub, _commands, addr, shutdown) = start_hub().await;

	let err = tokio_tungstenite::connect_async(format!("ws://{addr}/nope")).await;
	assert!(err.is_err(), "handshake off the configured route must fail");
	assert_eq!(hub.session_count().await, 0);

	// The configured route still works.
	let mut client = connect_subscriber(&hub, addr, 1).await;
	client.send(Message::text("ping")).await.unwrap();
	assert_eq!(next_text(&mut client).await, "pong");

	shutdown.send(true).unwrap();
}

#[tokio::test]
async fn binary_messages_are_ignored() {
	let (hub, commands, addr, shutdown) = start_hub().await;
	let mut client = connect_subscriber(&hub, addr, 1).await;

	client.send(Message::binary(vec![0u8, 1, 2, 3])).await.unwrap();
	client.send(Message::text("ping")).await.unwrap();
	assert_eq!(next_text(&mut client).await, "pong");
	assert!(commands.is_empty());

	shutdown.send(true).unwrap();
}

#[tokio::test]
async fn closed_sessions_are_pruned() {
	let (hub, _commands, addr, shutdown) = start_hub().await;
	let mut client = connect_subscriber(&hub, addr, 1).await;

	client.close(None).await.unwrap();

	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while hub.session_count().await > 0 && tokio::time::Instant::now() < deadline {
		sleep(Duration::from_millis(5)).await;
	}
	assert_eq!(hub.session_count().await, 0);

	let delivered = hub.deliver(&ClientInfo::broadcast("/app"), b"{}".to_vec()).await;
	assert_eq!(delivered, 0);

	shutdown.send(true).unwrap();
}
