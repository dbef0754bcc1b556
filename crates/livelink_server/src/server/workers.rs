#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use livelink_domain::{ClientAction, ClientInfo};
use livelink_platform::bilibili::BilibiliClient;
use livelink_platform::queue::WorkQueue;
use livelink_platform::{
	ClientCommand, CrawlTask, CrawlWorkItem, RecordPayload, RecordWorkItem, SOURCE_BILIBILI, SendWorkItem, UserStore,
	response_envelope,
};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::hub::DistributionHub;
use crate::storage::SqliteStorage;

/// How long an idle worker sleeps before polling again.
const EMPTY_POLL_DELAY: Duration = Duration::from_millis(250);

/// Courtesy delay after each real profile fetch.
const CRAWL_FETCH_DELAY: Duration = Duration::from_millis(500);

/// Pacing between deliveries to subscribers.
const SEND_PACING_DELAY: Duration = Duration::from_millis(50);

async fn idle_or_shutdown(shutdown: &mut watch::Receiver<bool>) -> bool {
	tokio::select! {
		_ = sleep(EMPTY_POLL_DELAY) => false,
		_ = shutdown.changed() => true,
	}
}

/// Fetch user profiles for queued crawl requests.
pub async fn run_crawl_worker(
	queue: WorkQueue<CrawlWorkItem>,
	client: BilibiliClient,
	store: Arc<dyn UserStore>,
	record_queue: WorkQueue<RecordWorkItem>,
	send_queue: WorkQueue<SendWorkItem>,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		if *shutdown.borrow() {
			break;
		}

		let Some(item) = queue.dequeue() else {
			if idle_or_shutdown(&mut shutdown).await {
				break;
			}
			continue;
		};

		let CrawlTask::UserProfile { user_id } = &item.task;

		// The same user may be queued many times before the first fetch
		// lands; the cache check collapses the duplicates.
		let cached = match store.pick_user(user_id).await {
			Ok(v) => v,
			Err(e) => {
				warn!(user_id = %user_id, error = %e, "crawl: cache lookup failed");
				None
			}
		};

		let (user, fetched) = match cached {
			Some(user) => (Some(user), false),
			None => match client.fetch_user_info(user_id).await {
				Ok(Some(user)) => {
					record_queue.enqueue(RecordWorkItem::new(item.source.clone(), RecordPayload::User(user.clone())));
					metrics::counter!("livelink_crawl_fetches_total").increment(1);
					(Some(user), true)
				}
				Ok(None) => {
					debug!(user_id = %user_id, "crawl: profile api returned no data");
					(None, true)
				}
				Err(e) => {
					warn!(user_id = %user_id, error = %e, "crawl: profile fetch failed");
					metrics::counter!("livelink_crawl_errors_total").increment(1);
					(None, true)
				}
			},
		};

		if let (Some(user), Some(target)) = (user, item.post_send) {
			match response_envelope("user-info", &user) {
				Ok(payload) => send_queue.enqueue(SendWorkItem::new(item.source, target, payload)),
				Err(e) => warn!(user_id = %user.id, error = %e, "crawl: failed to serialize user info"),
			}
		}

		// Stay polite to the profile api; cache hits skip the wait.
		if fetched {
			tokio::select! {
				_ = sleep(CRAWL_FETCH_DELAY) => {}
				_ = shutdown.changed() => break,
			}
		}
	}
}

/// Persist queued records.
pub async fn run_record_worker(queue: WorkQueue<RecordWorkItem>, storage: SqliteStorage, mut shutdown: watch::Receiver<bool>) {
	loop {
		if *shutdown.borrow() {
			break;
		}

		let Some(item) = queue.dequeue() else {
			if idle_or_shutdown(&mut shutdown).await {
				break;
			}
			continue;
		};

		metrics::counter!("livelink_records_total", "kind" => item.payload.kind()).increment(1);

		let result = match &item.payload {
			RecordPayload::User(user) => storage.record_user(user).await,
			RecordPayload::Chat(event) => storage.record_chat(event).await,
			RecordPayload::RawFrame(frame) => storage.record_raw_frame(frame).await,
		};

		if let Err(e) = result {
			warn!(kind = item.payload.kind(), error = %e, "record: persist failed");
			metrics::counter!("livelink_record_errors_total").increment(1);
		}
	}
}

/// Push queued payloads out through the hub.
pub async fn run_send_worker(queue: WorkQueue<SendWorkItem>, hub: DistributionHub, mut shutdown: watch::Receiver<bool>) {
	loop {
		if *shutdown.borrow() {
			break;
		}

		let Some(item) = queue.dequeue() else {
			if idle_or_shutdown(&mut shutdown).await {
				break;
			}
			continue;
		};

		let delivered = hub.deliver(&item.target, item.payload).await;
		metrics::counter!("livelink_sends_total").increment(1);
		debug!(delivered, action = ?item.target.action, "send: delivered payload");

		tokio::select! {
			_ = sleep(SEND_PACING_DELAY) => {}
			_ = shutdown.changed() => break,
		}
	}
}

/// Serve commands sent by hub subscribers.
pub async fn run_client_command_worker(
	queue: WorkQueue<ClientCommand>,
	store: Arc<dyn UserStore>,
	crawl_queue: WorkQueue<CrawlWorkItem>,
	send_queue: WorkQueue<SendWorkItem>,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		if *shutdown.borrow() {
			break;
		}

		let Some(command) = queue.dequeue() else {
			if idle_or_shutdown(&mut shutdown).await {
				break;
			}
			continue;
		};

		if command.processor != SOURCE_BILIBILI {
			warn!(processor = %command.processor, "client command: unknown processor");
			continue;
		}

		match command.action.as_str() {
			"queryUserInfo" => {
				let Some(user_id) = command.parameters.get("id").filter(|v| !v.is_empty()) else {
					warn!("client command: queryUserInfo without an id parameter");
					continue;
				};
				let Some(client_info) = command.client_info else {
					warn!("client command: queryUserInfo without a stamped session");
					continue;
				};

				// Replies go back to the asking session only.
				let target = ClientInfo {
					action: ClientAction::Send,
					..client_info
				};

				query_user_info(user_id, target, &store, &crawl_queue, &send_queue).await;
			}
			other => {
				warn!(action = %other, "client command: unknown action");
			}
		}
	}
}

async fn query_user_info(
	user_id: &str,
	target: ClientInfo,
	store: &Arc<dyn UserStore>,
	crawl_queue: &WorkQueue<CrawlWorkItem>,
	send_queue: &WorkQueue<SendWorkItem>,
) {
	let cached = match store.pick_user(user_id).await {
		Ok(v) => v,
		Err(e) => {
			warn!(user_id, error = %e, "client command: cache lookup failed");
			None
		}
	};

	match cached {
		Some(user) => match response_envelope("user-info", &user) {
			Ok(payload) => send_queue.enqueue(SendWorkItem::new(SOURCE_BILIBILI, target, payload)),
			Err(e) => warn!(user_id, error = %e, "client command: failed to serialize user info"),
		},
		None => {
			debug!(user_id, "client command: collecting user information");
			crawl_queue.enqueue(CrawlWorkItem::user_profile(user_id, Some(target)));
		}
	}
}
