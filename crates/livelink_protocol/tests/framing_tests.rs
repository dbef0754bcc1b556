use std::io::Write;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use livelink_protocol::{
	DEFAULT_MAX_FRAME_SIZE, Frame, HEADER_LEN, MessageType, ProtocolError, decode_payload, encode_frame, parse_frame,
	split_frames,
};
use proptest::prelude::*;

fn arb_message_type() -> impl Strategy<Value = MessageType> {
	prop_oneof![
		Just(MessageType::ClientHeartbeat),
		Just(MessageType::PopularityCount),
		Just(MessageType::Command),
		Just(MessageType::Auth),
		Just(MessageType::ServerHeartbeat),
	]
}

fn arb_frame() -> impl Strategy<Value = Frame> {
	// Protover 2 command frames are deflate bundles, not plain frames.
	(arb_message_type(), 0u16..2, any::<u32>(), proptest::collection::vec(any::<u8>(), 0..256)).prop_map(
		|(message_type, protocol_version, sequence, body)| Frame::new(protocol_version, message_type, sequence, body),
	)
}

proptest! {
	#[test]
	fn roundtrip_preserves_header_and_body(frame in arb_frame()) {
		let raw = encode_frame(&frame);
		let decoded = parse_frame(&raw, DEFAULT_MAX_FRAME_SIZE).expect("parse");

		prop_assert_eq!(decoded.len(), 1);
		prop_assert_eq!(decoded[0].protocol_version, frame.protocol_version);
		prop_assert_eq!(decoded[0].message_type, frame.message_type);
		prop_assert_eq!(decoded[0].sequence, frame.sequence);
		prop_assert_eq!(&decoded[0].body, &frame.body);
	}

	#[test]
	fn split_is_exact_over_concatenations(frames in proptest::collection::vec(arb_frame(), 1..8)) {
		let encoded: Vec<Vec<u8>> = frames.iter().map(encode_frame).collect();
		let mut joined = Vec::new();
		for e in &encoded {
			joined.extend_from_slice(e);
		}

		let (parts, err) = split_frames(&joined);
		prop_assert!(err.is_none());
		prop_assert_eq!(parts.len(), encoded.len());
		for (part, original) in parts.iter().zip(encoded.iter()) {
			prop_assert_eq!(*part, original.as_slice());
		}
	}

	#[test]
	fn truncated_payload_never_panics(frame in arb_frame(), cut in 1usize..16) {
		let raw = encode_frame(&frame);
		let cut = cut.min(raw.len());
		let truncated = &raw[..raw.len() - cut];

		// Salvage semantics only; no panics, no out-of-bounds reads.
		let (_frames, _errors) = decode_payload(truncated, DEFAULT_MAX_FRAME_SIZE);
	}
}

#[test]
fn oversized_frame_is_rejected() {
	let frame = Frame::new(1, MessageType::Command, 1, vec![0u8; 64]);
	let raw = encode_frame(&frame);

	let err = parse_frame(&raw, 32).unwrap_err();
	match err {
		ProtocolError::FrameTooLarge { len, max } => {
			assert_eq!(len, HEADER_LEN + 64);
			assert_eq!(max, 32);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn compressed_bundle_roundtrips_through_decode_payload() {
	let mini_bodies: [&[u8]; 2] = [b"{\"cmd\":\"DANMU_MSG\"}", b"{\"cmd\":\"NOTICE_MSG\"}"];

	let mut inner = Vec::new();
	for body in mini_bodies {
		inner.extend_from_slice(&((HEADER_LEN + body.len()) as u32).to_be_bytes());
		inner.extend_from_slice(&(HEADER_LEN as u16).to_be_bytes());
		inner.extend_from_slice(&0u16.to_be_bytes());
		inner.extend_from_slice(&5u32.to_be_bytes());
		inner.extend_from_slice(&1u32.to_be_bytes());
		inner.extend_from_slice(body);
	}

	let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
	enc.write_all(&inner).expect("deflate write");
	let deflated = enc.finish().expect("deflate finish");

	let mut body = vec![0x78, 0x9c];
	body.extend_from_slice(&deflated);
	let raw = encode_frame(&Frame::new(2, MessageType::Command, 3, body));

	let (frames, errors) = decode_payload(&raw, DEFAULT_MAX_FRAME_SIZE);
	assert!(errors.is_empty(), "unexpected errors: {errors:?}");
	assert_eq!(frames.len(), 2);
	assert!(frames.iter().all(|f| f.message_type == MessageType::Command));
	assert!(frames.iter().all(|f| f.sequence == 3));
	assert_eq!(frames[0].content(), "{\"cmd\":\"DANMU_MSG\"}");
	assert_eq!(frames[1].content(), "{\"cmd\":\"NOTICE_MSG\"}");
}

#[test]
fn popularity_body_carries_big_endian_count() {
	let frame = Frame::new(1, MessageType::PopularityCount, 1, Bytes::from_static(&[0, 0, 0x30, 0x39]));
	let raw = encode_frame(&frame);

	let decoded = parse_frame(&raw, DEFAULT_MAX_FRAME_SIZE).expect("parse");
	let body = &decoded[0].body;
	let count = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
	assert_eq!(count, 12345);
}
