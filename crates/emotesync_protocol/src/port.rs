#![forbid(unsafe_code)]

//! Client-facing port protocol: messages between the worker and one tab.

use emotesync_domain::{Channel, ChannelId, Cosmetic, EmoteSet, EmoteSetId, Entitlement, Platform, PortId, Provider, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Preferred emote image format declared by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageFormat {
	Avif,
	Webp,
	Gif,
	Png,
}

/// Authenticated identity a client reports for itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub user_id: UserId,
	#[serde(default)]
	pub username: String,
}

/// One channel mutation inside a STATE message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChannelDelta {
	Add {
		channel: Channel,
		/// Re-run the join even if the channel was already present.
		#[serde(default)]
		refetch: bool,
	},
	Remove {
		channel_id: ChannelId,
	},
}

/// Partial client state; only present fields are merged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateUpdate {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub platform: Option<Platform>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub providers: Option<Vec<Provider>>,
	/// Provider-specific extension blobs, keyed by provider.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub provider_extensions: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identity: Option<Identity>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_format: Option<ImageFormat>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub channel: Option<ChannelDelta>,
}

/// Severity for LOG messages piped to a client for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
	Debug,
	Info,
	Warn,
	Error,
}

/// Messages exchanged over a port, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortMessage {
	/// Worker → client: sent once after connect, carries the allocated port id.
	Init { id: PortId },
	/// Client → worker: partial state merge.
	State { state: StateUpdate },
	/// Worker → client: diagnostic line.
	Log { level: LogLevel, message: String },
	/// Either direction: orderly shutdown of the port.
	Close {
		#[serde(default)]
		reason: Option<String>,
	},
	ChannelFetched {
		channel: Channel,
	},
	ChannelActiveChatter {
		channel_id: ChannelId,
		user_id: UserId,
	},
	IdentityFetched {
		identity: Identity,
	},
	CosmeticCreated {
		cosmetic: Cosmetic,
	},
	EntitlementCreated {
		entitlement: Entitlement,
	},
	EntitlementDeleted {
		entitlement: Entitlement,
	},
	EntitlementReset {
		user_id: UserId,
	},
	StaticCosmeticsFetched {
		cosmetics: Vec<Cosmetic>,
	},
	EmoteSetUpdated {
		set_id: EmoteSetId,
		#[serde(default)]
		old_set_id: Option<EmoteSetId>,
		#[serde(default)]
		channel_id: Option<ChannelId>,
	},
	UserUpdated {
		user_id: UserId,
	},
	SyncTwitchSet {
		channel_id: ChannelId,
		#[serde(default)]
		emote_set: Option<EmoteSet>,
	},
}

impl PortMessage {
	/// Stable tag string, matching the wire discriminant.
	pub fn tag(&self) -> &'static str {
		match self {
			PortMessage::Init { .. } => "INIT",
			PortMessage::State { .. } => "STATE",
			PortMessage::Log { .. } => "LOG",
			PortMessage::Close { .. } => "CLOSE",
			PortMessage::ChannelFetched { .. } => "CHANNEL_FETCHED",
			PortMessage::ChannelActiveChatter { .. } => "CHANNEL_ACTIVE_CHATTER",
			PortMessage::IdentityFetched { .. } => "IDENTITY_FETCHED",
			PortMessage::CosmeticCreated { .. } => "COSMETIC_CREATED",
			PortMessage::EntitlementCreated { .. } => "ENTITLEMENT_CREATED",
			PortMessage::EntitlementDeleted { .. } => "ENTITLEMENT_DELETED",
			PortMessage::EntitlementReset { .. } => "ENTITLEMENT_RESET",
			PortMessage::StaticCosmeticsFetched { .. } => "STATIC_COSMETICS_FETCHED",
			PortMessage::EmoteSetUpdated { .. } => "EMOTE_SET_UPDATED",
			PortMessage::UserUpdated { .. } => "USER_UPDATED",
			PortMessage::SyncTwitchSet { .. } => "SYNC_TWITCH_SET",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use emotesync_domain::now_unix;

	#[test]
	fn state_merge_message_roundtrip() {
		let msg = PortMessage::State {
			state: StateUpdate {
				platform: Some(Platform::Twitch),
				providers: Some(vec![Provider::SevenTv, Provider::Bttv]),
				channel: Some(ChannelDelta::Add {
					channel: Channel::new(ChannelId::new("42").unwrap(), Platform::Twitch),
					refetch: false,
				}),
				..StateUpdate::default()
			},
		};

		let text = serde_json::to_string(&msg).unwrap();
		assert!(text.contains("\"type\":\"STATE\""));
		assert!(text.contains("\"op\":\"add\""));

		let back: PortMessage = serde_json::from_str(&text).unwrap();
		assert_eq!(back, msg);
	}

	#[test]
	fn tag_matches_wire_discriminant() {
		let msg = PortMessage::EntitlementReset {
			user_id: UserId::new("u1").unwrap(),
		};
		let value = serde_json::to_value(&msg).unwrap();
		assert_eq!(value["type"], msg.tag());
	}

	#[test]
	fn absent_state_fields_stay_absent() {
		let msg = PortMessage::State {
			state: StateUpdate {
				image_format: Some(ImageFormat::Webp),
				..StateUpdate::default()
			},
		};
		let text = serde_json::to_string(&msg).unwrap();
		assert!(!text.contains("identity"));
		assert!(!text.contains("providers"));
		assert!(text.contains("\"image_format\":\"WEBP\""));
	}

	#[test]
	fn channel_fetched_carries_timestamp() {
		let mut channel = Channel::new(ChannelId::new("42").unwrap(), Platform::Kick);
		channel.timestamp = now_unix();
		let msg = PortMessage::ChannelFetched { channel: channel.clone() };
		let back: PortMessage = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
		assert_eq!(back, PortMessage::ChannelFetched { channel });
	}
}
