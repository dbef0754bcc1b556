#![forbid(unsafe_code)]

use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::DeflateDecoder;
use thiserror::Error;

/// Fixed header size shared by outer frames and bundled mini-frames.
pub const HEADER_LEN: usize = 16;

/// Default maximum accepted frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

/// Protocol version that marks compressed command bundles.
pub const PROTOVER_DEFLATE: u16 = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("declared frame length smaller than header: {0}")]
	FrameTooSmall(usize),

	#[error("frame length mismatch: declared={declared} actual={actual}")]
	LengthMismatch {
		declared: usize,
		actual: usize,
	},

	#[error("unexpected header length: {0}")]
	BadHeaderLength(u16),

	#[error("unknown message type: {0}")]
	UnknownMessageType(u32),

	#[error("deflate error: {0}")]
	Inflate(#[from] std::io::Error),

	#[error("body encode error: {0}")]
	Encode(#[from] serde_json::Error),
}

/// Frame-level message types on the danmaku socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
	ClientHeartbeat,
	PopularityCount,
	Command,
	Auth,
	ServerHeartbeat,
}

impl MessageType {
	pub const fn as_u32(self) -> u32 {
		match self {
			MessageType::ClientHeartbeat => 2,
			MessageType::PopularityCount => 3,
			MessageType::Command => 5,
			MessageType::Auth => 7,
			MessageType::ServerHeartbeat => 8,
		}
	}

	pub const fn from_u32(v: u32) -> Option<Self> {
		match v {
			2 => Some(MessageType::ClientHeartbeat),
			3 => Some(MessageType::PopularityCount),
			5 => Some(MessageType::Command),
			7 => Some(MessageType::Auth),
			8 => Some(MessageType::ServerHeartbeat),
			_ => None,
		}
	}
}

impl core::fmt::Display for MessageType {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		let s = match self {
			MessageType::ClientHeartbeat => "client_heartbeat",
			MessageType::PopularityCount => "popularity_count",
			MessageType::Command => "command",
			MessageType::Auth => "auth",
			MessageType::ServerHeartbeat => "server_heartbeat",
		};
		f.write_str(s)
	}
}

/// One decoded frame. `id` is a local correlation id, never on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
	pub id: uuid::Uuid,
	pub protocol_version: u16,
	pub message_type: MessageType,
	pub sequence: u32,
	pub body: Bytes,
}

impl Frame {
	pub fn new(protocol_version: u16, message_type: MessageType, sequence: u32, body: impl Into<Bytes>) -> Self {
		Self {
			id: uuid::Uuid::new_v4(),
			protocol_version,
			message_type,
			sequence,
			body: body.into(),
		}
	}

	/// Body interpreted as UTF-8, lossily.
	pub fn content(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}
}

/// Encode a frame into the 16-byte-header wire layout (big-endian).
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
	let total = HEADER_LEN + frame.body.len();
	let mut buf = BytesMut::with_capacity(total);
	buf.put_u32(total as u32);
	buf.put_u16(HEADER_LEN as u16);
	buf.put_u16(frame.protocol_version);
	buf.put_u32(frame.message_type.as_u32());
	buf.put_u32(frame.sequence);
	buf.put_slice(&frame.body);
	buf.to_vec()
}

/// Split a socket payload into raw frames by their length prefixes.
///
/// Stops at the first broken prefix and returns whatever was salvaged
/// before it, together with the error describing the break.
pub fn split_frames(src: &[u8]) -> (Vec<&[u8]>, Option<ProtocolError>) {
	let mut frames = Vec::new();
	let mut pos = 0usize;

	while pos < src.len() {
		let rest = src.len() - pos;
		if rest < 4 {
			return (frames, Some(ProtocolError::InsufficientData { need: 4, have: rest }));
		}

		let len = u32::from_be_bytes([src[pos], src[pos + 1], src[pos + 2], src[pos + 3]]) as usize;
		if len < HEADER_LEN {
			return (frames, Some(ProtocolError::FrameTooSmall(len)));
		}
		if len > rest {
			return (frames, Some(ProtocolError::InsufficientData { need: len, have: rest }));
		}

		frames.push(&src[pos..pos + len]);
		pos += len;
	}

	(frames, None)
}

/// Parse one raw frame into decoded frames.
///
/// A protover-2 command frame is a zlib-marked deflate stream of
/// mini-frames and yields each of them; anything else yields itself.
pub fn parse_frame(raw: &[u8], max_frame_size: usize) -> Result<Vec<Frame>, ProtocolError> {
	if raw.len() < HEADER_LEN {
		return Err(ProtocolError::InsufficientData {
			need: HEADER_LEN,
			have: raw.len(),
		});
	}
	if raw.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: raw.len(),
			max: max_frame_size,
		});
	}

	let declared = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
	if declared != raw.len() {
		return Err(ProtocolError::LengthMismatch {
			declared,
			actual: raw.len(),
		});
	}

	let header_len = u16::from_be_bytes([raw[4], raw[5]]);
	if header_len as usize != HEADER_LEN {
		return Err(ProtocolError::BadHeaderLength(header_len));
	}

	let protocol_version = u16::from_be_bytes([raw[6], raw[7]]);
	let type_raw = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
	let message_type = MessageType::from_u32(type_raw).ok_or(ProtocolError::UnknownMessageType(type_raw))?;
	let sequence = u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]);
	let body = &raw[HEADER_LEN..];

	if protocol_version == PROTOVER_DEFLATE && message_type == MessageType::Command {
		if body.len() < 2 {
			return Err(ProtocolError::InsufficientData {
				need: 2,
				have: body.len(),
			});
		}

		// Two zlib marker bytes precede the raw deflate stream.
		let mut inflated = Vec::new();
		DeflateDecoder::new(&body[2..]).read_to_end(&mut inflated)?;
		Ok(extract_bundle(&inflated, sequence))
	} else {
		Ok(vec![Frame::new(
			protocol_version,
			message_type,
			sequence,
			Bytes::copy_from_slice(body),
		)])
	}
}

/// Walk the inflated bundle and pull out every well-formed mini-frame.
///
/// A malformed mini-header truncates extraction; frames already pulled
/// out are kept. Unknown operation codes are skipped, body included.
fn extract_bundle(inflated: &[u8], sequence: u32) -> Vec<Frame> {
	let mut frames = Vec::new();
	let mut pos = 0usize;

	while inflated.len() - pos >= HEADER_LEN {
		let msg_len = u32::from_be_bytes([inflated[pos], inflated[pos + 1], inflated[pos + 2], inflated[pos + 3]]) as usize;
		let version = u16::from_be_bytes([inflated[pos + 6], inflated[pos + 7]]);
		let op_code = u32::from_be_bytes([inflated[pos + 8], inflated[pos + 9], inflated[pos + 10], inflated[pos + 11]]);

		if msg_len < HEADER_LEN || pos + msg_len > inflated.len() {
			break;
		}

		let message_type = match op_code {
			3 => Some(MessageType::ServerHeartbeat),
			5 => Some(MessageType::Command),
			8 => Some(MessageType::Auth),
			_ => None,
		};

		if let Some(message_type) = message_type {
			let body = Bytes::copy_from_slice(&inflated[pos + HEADER_LEN..pos + msg_len]);
			frames.push(Frame::new(version, message_type, sequence, body));
		}

		pos += msg_len;
	}

	frames
}

/// Split and parse a whole socket payload.
///
/// Per-frame failures do not abort the siblings; every error is
/// collected alongside the frames that did decode.
pub fn decode_payload(src: &[u8], max_frame_size: usize) -> (Vec<Frame>, Vec<ProtocolError>) {
	let (raw_frames, split_err) = split_frames(src);

	let mut frames = Vec::new();
	let mut errors = Vec::new();

	for raw in raw_frames {
		match parse_frame(raw, max_frame_size) {
			Ok(mut decoded) => frames.append(&mut decoded),
			Err(e) => errors.push(e),
		}
	}

	if let Some(e) = split_err {
		errors.push(e);
	}

	(frames, errors)
}

/// Build the auth frame sent right after connecting.
pub fn make_auth_frame(uid: &str, room_id: u64, token: &str, client_version: &str) -> Result<Frame, ProtocolError> {
	let body = serde_json::to_vec(&serde_json::json!({
		"uid": uid,
		"roomid": room_id.to_string(),
		"protover": 2,
		"platform": "web",
		"clientver": client_version,
		"key": token,
	}))?;

	Ok(Frame::new(1, MessageType::Auth, 1, body))
}

/// Build a client heartbeat frame.
///
/// The body is empty (the header alone goes on the wire). The
/// broadcast server treats this the same as the literal `"{}"` body
/// some web clients send.
pub fn make_heartbeat_frame() -> Frame {
	Frame::new(1, MessageType::ClientHeartbeat, 1, Bytes::new())
}
