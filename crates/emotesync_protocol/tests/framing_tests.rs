use emotesync_domain::{Channel, ChannelId, Platform, PortId};
use emotesync_protocol::port::{ChannelDelta, LogLevel, PortMessage, StateUpdate};
use emotesync_protocol::{DEFAULT_MAX_LINE_SIZE, decode_line, encode_line};
use proptest::prelude::*;

#[test]
fn encode_decode_roundtrip() {
	let msg = PortMessage::Init { id: PortId::new_v4() };

	let line = encode_line(&msg, DEFAULT_MAX_LINE_SIZE).expect("encode_line");
	let back = decode_line(&line, DEFAULT_MAX_LINE_SIZE).expect("decode_line");

	assert_eq!(back, msg);
}

#[test]
fn state_with_channel_add_roundtrip() {
	let msg = PortMessage::State {
		state: StateUpdate {
			channel: Some(ChannelDelta::Add {
				channel: Channel::new(ChannelId::new("42").expect("valid id"), Platform::Twitch),
				refetch: true,
			}),
			..StateUpdate::default()
		},
	};

	let line = encode_line(&msg, DEFAULT_MAX_LINE_SIZE).expect("encode_line");
	let back = decode_line(&line, DEFAULT_MAX_LINE_SIZE).expect("decode_line");
	assert_eq!(back, msg);
}

#[test]
fn unknown_type_is_a_decode_error() {
	let err = decode_line(r#"{"type":"NEBULA_FLARE"}"#, DEFAULT_MAX_LINE_SIZE).unwrap_err();
	assert!(err.to_string().contains("json error"), "got: {err}");
}

proptest! {
	#[test]
	fn log_messages_roundtrip(message in "[^\\p{Cc}]{0,200}") {
		let msg = PortMessage::Log {
			level: LogLevel::Debug,
			message,
		};
		let line = encode_line(&msg, DEFAULT_MAX_LINE_SIZE).unwrap();
		prop_assert_eq!(line.matches('\n').count(), 1);
		let back = decode_line(&line, DEFAULT_MAX_LINE_SIZE).unwrap();
		prop_assert_eq!(back, msg);
	}
}
