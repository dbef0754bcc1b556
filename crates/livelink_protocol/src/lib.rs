#![forbid(unsafe_code)]

pub mod framing;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, Frame, HEADER_LEN, MessageType, ProtocolError, decode_payload, encode_frame, make_auth_frame,
	make_heartbeat_frame, parse_frame, split_frames,
};
