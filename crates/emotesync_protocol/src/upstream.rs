#![forbid(unsafe_code)]

//! Upstream real-time diff-sync protocol: JSON frames `{op, d, t?}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire opcodes for upstream frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
	Dispatch,
	Hello,
	Heartbeat,
	Reconnect,
	Ack,
	Error,
	EndOfStream,
	Identify,
	Resume,
	Subscribe,
	Unsubscribe,
	/// Extension op for out-of-band commands.
	Bridge,
	Unknown(u8),
}

impl Opcode {
	pub const fn as_op(self) -> u8 {
		match self {
			Opcode::Dispatch => 0,
			Opcode::Hello => 1,
			Opcode::Heartbeat => 2,
			Opcode::Reconnect => 4,
			Opcode::Ack => 5,
			Opcode::Error => 6,
			Opcode::EndOfStream => 7,
			Opcode::Identify => 33,
			Opcode::Resume => 34,
			Opcode::Subscribe => 35,
			Opcode::Unsubscribe => 36,
			Opcode::Bridge => 38,
			Opcode::Unknown(op) => op,
		}
	}

	pub const fn from_op(op: u8) -> Self {
		match op {
			0 => Opcode::Dispatch,
			1 => Opcode::Hello,
			2 => Opcode::Heartbeat,
			4 => Opcode::Reconnect,
			5 => Opcode::Ack,
			6 => Opcode::Error,
			7 => Opcode::EndOfStream,
			33 => Opcode::Identify,
			34 => Opcode::Resume,
			35 => Opcode::Subscribe,
			36 => Opcode::Unsubscribe,
			38 => Opcode::Bridge,
			other => Opcode::Unknown(other),
		}
	}
}

/// One upstream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
	pub op: u8,
	#[serde(default)]
	pub d: Value,
	/// Server timestamp tag, present on some frames.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub t: Option<String>,
}

impl Frame {
	pub fn new(op: Opcode, d: Value) -> Self {
		Self {
			op: op.as_op(),
			d,
			t: None,
		}
	}

	pub fn opcode(&self) -> Opcode {
		Opcode::from_op(self.op)
	}

	/// Deserialize the frame payload into a typed struct.
	pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		serde_json::from_value(self.d.clone())
	}

	pub fn heartbeat() -> Self {
		Self::new(Opcode::Heartbeat, Value::Null)
	}

	pub fn subscribe(payload: &SubscribePayload) -> Self {
		Self::new(Opcode::Subscribe, serde_json::to_value(payload).unwrap_or(Value::Null))
	}

	pub fn unsubscribe(payload: &SubscribePayload) -> Self {
		Self::new(Opcode::Unsubscribe, serde_json::to_value(payload).unwrap_or(Value::Null))
	}

	pub fn resume(session_id: &str) -> Self {
		Self::new(Opcode::Resume, serde_json::json!({ "session_id": session_id }))
	}
}

/// HELLO payload sent by the server after the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
	pub session_id: String,
	/// Interval between client HEARTBEAT sends, in milliseconds.
	pub heartbeat_interval: u64,
	#[serde(default)]
	pub subscription_limit: Option<u32>,
}

/// ACK payload confirming a prior client command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
	pub command: String,
	#[serde(default)]
	pub data: Value,
}

/// ERROR payload describing a rejected command or protocol fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
	#[serde(default)]
	pub message: String,
	#[serde(default)]
	pub data: Value,
}

/// Subscription condition: opaque key/value constraints, e.g. `object_id`.
pub type Condition = BTreeMap<String, String>;

/// SUBSCRIBE / UNSUBSCRIBE payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscribePayload {
	#[serde(rename = "type")]
	pub topic: String,
	#[serde(default)]
	pub condition: Condition,
}

impl SubscribePayload {
	pub fn new(topic: impl Into<String>, condition: Condition) -> Self {
		Self {
			topic: topic.into(),
			condition,
		}
	}

	/// Condition with a single `object_id` constraint.
	pub fn object_id(topic: impl Into<String>, object_id: impl Into<String>) -> Self {
		let mut condition = Condition::new();
		condition.insert("object_id".to_string(), object_id.into());
		Self::new(topic, condition)
	}
}

/// Dispatch event tags: `<object_kind>.<event_name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTag {
	#[serde(rename = "system.announcement")]
	SystemAnnouncement,
	#[serde(rename = "emote.create")]
	EmoteCreate,
	#[serde(rename = "emote.update")]
	EmoteUpdate,
	#[serde(rename = "emote.delete")]
	EmoteDelete,
	#[serde(rename = "emote_set.create")]
	EmoteSetCreate,
	#[serde(rename = "emote_set.update")]
	EmoteSetUpdate,
	#[serde(rename = "emote_set.delete")]
	EmoteSetDelete,
	#[serde(rename = "user.create")]
	UserCreate,
	#[serde(rename = "user.update")]
	UserUpdate,
	#[serde(rename = "user.delete")]
	UserDelete,
	#[serde(rename = "cosmetic.create")]
	CosmeticCreate,
	#[serde(rename = "cosmetic.update")]
	CosmeticUpdate,
	#[serde(rename = "cosmetic.delete")]
	CosmeticDelete,
	#[serde(rename = "entitlement.create")]
	EntitlementCreate,
	#[serde(rename = "entitlement.update")]
	EntitlementUpdate,
	#[serde(rename = "entitlement.delete")]
	EntitlementDelete,
	#[serde(rename = "entitlement.reset")]
	EntitlementReset,
	#[serde(other)]
	Unknown,
}

/// DISPATCH payload: one entity diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPayload {
	#[serde(rename = "type")]
	pub tag: EventTag,
	pub body: ChangeMap,
	/// Server-assigned subscription ids this dispatch matched.
	#[serde(default)]
	pub matches: Vec<String>,
}

/// A diff record describing one entity's mutation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeMap {
	pub id: String,
	#[serde(default)]
	pub kind: i32,
	/// User that caused the change, if known.
	#[serde(default)]
	pub actor: Option<Value>,
	/// Full snapshot of the entity after the change, if the server sent one.
	#[serde(default)]
	pub object: Option<Value>,
	#[serde(default)]
	pub added: Vec<ChangeField>,
	#[serde(default)]
	pub updated: Vec<ChangeField>,
	#[serde(default)]
	pub removed: Vec<ChangeField>,
	#[serde(default)]
	pub pushed: Vec<ChangeField>,
	#[serde(default)]
	pub pulled: Vec<ChangeField>,
}

/// One field-level change inside a [`ChangeMap`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeField {
	pub key: String,
	#[serde(default)]
	pub index: Option<i32>,
	/// Nested change: `value` holds further [`ChangeField`]s keyed under this field.
	#[serde(default)]
	pub nested: bool,
	#[serde(default)]
	pub value: Option<Value>,
	#[serde(default)]
	pub old_value: Option<Value>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn opcode_roundtrip_and_unknown() {
		for op in [0u8, 1, 2, 4, 5, 6, 7, 33, 34, 35, 36, 38] {
			assert_eq!(Opcode::from_op(op).as_op(), op);
		}
		assert_eq!(Opcode::from_op(99), Opcode::Unknown(99));
		assert_eq!(Opcode::Unknown(99).as_op(), 99);
	}

	#[test]
	fn hello_frame_decodes() {
		let raw = r#"{"op":1,"d":{"session_id":"abc","heartbeat_interval":45000,"subscription_limit":500}}"#;
		let frame: Frame = serde_json::from_str(raw).unwrap();
		assert_eq!(frame.opcode(), Opcode::Hello);

		let hello: HelloPayload = frame.payload().unwrap();
		assert_eq!(hello.session_id, "abc");
		assert_eq!(hello.heartbeat_interval, 45_000);
		assert_eq!(hello.subscription_limit, Some(500));
	}

	#[test]
	fn dispatch_frame_decodes_pushed_fields() {
		let raw = r#"{
			"op": 0,
			"d": {
				"type": "emote_set.update",
				"body": {
					"id": "set-1",
					"kind": 2,
					"pushed": [{"key": "emotes", "index": 2, "value": {"id": "e3", "name": "pog"}}]
				}
			}
		}"#;
		let frame: Frame = serde_json::from_str(raw).unwrap();
		let dispatch: DispatchPayload = frame.payload().unwrap();
		assert_eq!(dispatch.tag, EventTag::EmoteSetUpdate);
		assert_eq!(dispatch.body.id, "set-1");
		assert_eq!(dispatch.body.pushed.len(), 1);
		assert_eq!(dispatch.body.pushed[0].key, "emotes");
		assert!(dispatch.body.pulled.is_empty());
	}

	#[test]
	fn unknown_event_tag_falls_back() {
		let raw = r#"{"op":0,"d":{"type":"nebula.flare","body":{"id":"x"}}}"#;
		let frame: Frame = serde_json::from_str(raw).unwrap();
		let dispatch: DispatchPayload = frame.payload().unwrap();
		assert_eq!(dispatch.tag, EventTag::Unknown);
	}

	#[test]
	fn subscribe_frame_carries_condition() {
		let payload = SubscribePayload::object_id("emote_set.*", "set-42");
		let frame = Frame::subscribe(&payload);
		assert_eq!(frame.opcode(), Opcode::Subscribe);

		let text = serde_json::to_string(&frame).unwrap();
		assert!(text.contains("\"op\":35"));
		assert!(text.contains("\"type\":\"emote_set.*\""));
		assert!(text.contains("\"object_id\":\"set-42\""));

		let back: Frame = serde_json::from_str(&text).unwrap();
		let decoded: SubscribePayload = back.payload().unwrap();
		assert_eq!(decoded, payload);
	}
}
