#![forbid(unsafe_code)]

use livelink_domain::{ChatEvent, EventKind};
use livelink_protocol::{Frame, MessageType};
use serde_json::Value;
use tracing::{debug, warn};

/// Decode one frame into a chat event.
///
/// Client-side frame types arriving from the server are protocol
/// violations and yield `None`; so does a command body that cannot be
/// parsed at all. Commands nobody recognizes become `Unknown` events
/// with the payload preserved verbatim.
pub fn decode_event(frame: &Frame) -> Option<ChatEvent> {
	match frame.message_type {
		MessageType::Auth | MessageType::ClientHeartbeat => {
			warn!(frame_id = %frame.id, message_type = %frame.message_type, "client-side frame received from upstream");
			None
		}
		MessageType::PopularityCount => decode_popularity(frame),
		MessageType::ServerHeartbeat => {
			let mut ev = ChatEvent::new(EventKind::Heartbeat);
			ev.sender_name = "server".to_string();
			Some(ev)
		}
		MessageType::Command => decode_command(frame),
	}
}

fn decode_popularity(frame: &Frame) -> Option<ChatEvent> {
	if frame.body.len() < 4 {
		warn!(frame_id = %frame.id, len = frame.body.len(), "popularity frame body too short");
		return None;
	}

	let count = u32::from_be_bytes([frame.body[0], frame.body[1], frame.body[2], frame.body[3]]);
	let mut ev = ChatEvent::new(EventKind::Renqi);
	ev.sender_name = "server".to_string();
	ev.metadata.insert("renqi".to_string(), count.to_string());
	Some(ev)
}

fn decode_command(frame: &Frame) -> Option<ChatEvent> {
	let json: Value = match serde_json::from_slice(&frame.body) {
		Ok(v) => v,
		Err(e) => {
			debug!(frame_id = %frame.id, error = %e, "command frame body is not JSON; dropping");
			return None;
		}
	};

	let cmd = json.get("cmd").and_then(Value::as_str).unwrap_or_default().to_uppercase();
	let data = json.get("data").unwrap_or(&Value::Null);

	let mut ev = ChatEvent::new(EventKind::Unknown);

	match cmd.as_str() {
		"WELCOME_GUARD" => {
			ev.kind = EventKind::Welcome;
			ev.sender_id = value_string(data.get("uid"));
			ev.sender_name = value_string(data.get("username"));
			ev.metadata.insert("uname".to_string(), ev.sender_name.clone());
			ev.metadata
				.insert("guard_level".to_string(), value_string(data.get("guard_level")));
		}
		"WELCOME" => {
			ev.kind = EventKind::Welcome;
			ev.sender_id = value_string(data.get("uid"));
			ev.sender_name = value_string(data.get("uname"));
			ev.metadata.insert("cmd".to_string(), cmd.clone());
			ev.metadata.insert("uname".to_string(), ev.sender_name.clone());
			ev.metadata.insert("is_admin".to_string(), flag_string(data, &["isadmin", "is_admin"]));
			ev.metadata.insert("is_vip".to_string(), flag_string(data, &["vip"]));
			ev.metadata.insert("is_svip".to_string(), flag_string(data, &["svip"]));
		}
		"INTERACT_WORD" => {
			ev.kind = EventKind::Welcome;
			ev.sender_id = value_string(data.get("uid"));
			ev.sender_name = value_string(data.get("uname"));
			ev.metadata.insert("cmd".to_string(), cmd.clone());
			ev.metadata.insert("uname".to_string(), ev.sender_name.clone());
		}
		"SEND_GIFT" => {
			ev.kind = EventKind::Gift;
			ev.sender_id = value_string(data.get("uid"));
			ev.sender_name = value_string(data.get("uname"));
			ev.metadata.insert("gift_name".to_string(), value_string(data.get("giftName")));
			ev.metadata.insert("gift_count".to_string(), value_string(data.get("num")));
			ev.metadata.insert("price".to_string(), value_string(data.get("price")));
		}
		"PREPARING" | "LIVE" => {
			ev.kind = EventKind::System;
			ev.sender_name = "server".to_string();
			ev.metadata.insert("roomid".to_string(), value_string(json.get("roomid")));
			ev.metadata.insert(
				"action".to_string(),
				if cmd == "LIVE" { "OPEN" } else { "CLOSE" }.to_string(),
			);
		}
		"DANMU_MSG" => {
			// The info array is load-bearing; without it there is no comment.
			let info = json.get("info")?;
			ev.kind = EventKind::Comment;
			ev.sender_id = value_string(info.get(2).and_then(|v| v.get(0)));
			ev.sender_name = value_string(info.get(2).and_then(|v| v.get(1)));
			ev.comment = value_string(info.get(1));
			ev.metadata
				.insert("ts".to_string(), value_string(info.get(0).and_then(|v| v.get(4))));
			for (i, key) in ["flag1", "flag2", "flag3"].into_iter().enumerate() {
				ev.metadata
					.insert(key.to_string(), value_string(info.get(2).and_then(|v| v.get(2 + i))));
			}
		}
		"NOTICE_MSG" => {
			ev.kind = EventKind::System;
			ev.sender_name = "server".to_string();
			ev.metadata.insert("cmd".to_string(), cmd.clone());
		}
		"ONLINE_RANK_COUNT" => {
			ev.kind = EventKind::System;
			ev.sender_name = "server".to_string();
			ev.metadata.insert("cmd".to_string(), cmd.clone());
			ev.metadata.insert("count".to_string(), value_string(data.get("count")));
		}
		"WATCHED_CHANGE" => {
			ev.kind = EventKind::System;
			ev.sender_name = "server".to_string();
			ev.metadata.insert("cmd".to_string(), cmd.clone());
			ev.metadata.insert("num".to_string(), value_string(data.get("num")));
		}
		"HOT_RANK_CHANGED" => {
			ev.kind = EventKind::System;
			ev.sender_name = "server".to_string();
			ev.metadata.insert("cmd".to_string(), cmd.clone());
			ev.metadata.insert("rank".to_string(), value_string(data.get("rank")));
			ev.metadata.insert("area_name".to_string(), value_string(data.get("area_name")));
		}
		other => {
			debug!(frame_id = %frame.id, cmd = other, "unknown command; keeping raw payload");
			ev.raw = Some(frame.content());
		}
	}

	Some(ev)
}

/// Render a JSON scalar (or anything else) as a plain string.
fn value_string(v: Option<&Value>) -> String {
	match v {
		Some(Value::String(s)) => s.clone(),
		Some(Value::Null) | None => String::new(),
		Some(other) => other.to_string(),
	}
}

/// Truthy 0/1 or boolean flags under any of the given keys.
fn flag_string(data: &Value, keys: &[&str]) -> String {
	for key in keys {
		match data.get(key) {
			Some(Value::Bool(b)) => return b.to_string(),
			Some(Value::Number(n)) => return (n.as_i64() == Some(1)).to_string(),
			_ => {}
		}
	}
	"false".to_string()
}
