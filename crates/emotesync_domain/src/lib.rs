#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Twitch,
	Kick,
	YouTube,
}

impl Platform {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
			Platform::Kick => "kick",
			Platform::YouTube => "youtube",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("unknown provider: {0}")]
	UnknownProvider(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(Platform::Twitch),
			"kick" => Ok(Platform::Kick),
			"youtube" | "you_tube" | "yt" => Ok(Platform::YouTube),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Emote/cosmetic providers a client can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
	SevenTv,
	Bttv,
	Ffz,
	/// The chat platform's own emotes.
	Platform,
}

impl Provider {
	pub const fn as_str(self) -> &'static str {
		match self {
			Provider::SevenTv => "seven_tv",
			Provider::Bttv => "bttv",
			Provider::Ffz => "ffz",
			Provider::Platform => "platform",
		}
	}
}

impl fmt::Display for Provider {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Provider {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"seven_tv" | "seventv" | "7tv" => Ok(Provider::SevenTv),
			"bttv" => Ok(Provider::Bttv),
			"ffz" => Ok(Provider::Ffz),
			"platform" => Ok(Provider::Platform),
			other => Err(ParseIdError::UnknownProvider(other.to_string())),
		}
	}
}

/// Scope of an emote set or entitlement, ordered by merge priority.
///
/// Higher scopes win when multiple providers contribute data for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
	Global,
	Channel,
	Follower,
	Sub,
	Personal,
}

impl Scope {
	/// Merge priority; higher overrides lower.
	pub const fn priority(self) -> i32 {
		match self {
			Scope::Global => 0,
			Scope::Channel => 1,
			Scope::Follower => 2,
			Scope::Sub => 3,
			Scope::Personal => 4,
		}
	}
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty identifier.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Platform-native channel (room) identifier.
	ChannelId
);
string_id!(
	/// Provider emote set identifier.
	EmoteSetId
);
string_id!(
	/// Provider emote identifier.
	EmoteId
);
string_id!(
	/// Provider user identifier.
	UserId
);
string_id!(
	/// Cosmetic identifier.
	CosmeticId
);
string_id!(
	/// Entitlement identifier.
	EntitlementId
);

/// Identifier of one connected client port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub uuid::Uuid);

impl PortId {
	/// Create a new random port id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for PortId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Unix-seconds timestamp carried by every cache row.
pub fn now_unix() -> i64 {
	chrono::Utc::now().timestamp()
}

/// A chat channel known to the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
	pub id: ChannelId,
	pub platform: Platform,
	/// Emote sets active in this channel, across all providers.
	#[serde(default)]
	pub set_ids: Vec<EmoteSetId>,
	#[serde(default = "now_unix")]
	pub timestamp: i64,
}

impl Channel {
	pub fn new(id: ChannelId, platform: Platform) -> Self {
		Self {
			id,
			platform,
			set_ids: Vec::new(),
			timestamp: now_unix(),
		}
	}
}

/// Where an emote's images are hosted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageHost {
	pub url: String,
	#[serde(default)]
	pub files: Vec<String>,
}

/// A single emote inside an emote set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emote {
	pub id: EmoteId,
	pub name: String,
	#[serde(default)]
	pub owner: Option<UserId>,
	#[serde(default)]
	pub host: ImageHost,
	#[serde(default = "now_unix")]
	pub timestamp: i64,
}

/// A provider emote set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmoteSet {
	pub id: EmoteSetId,
	pub provider: Provider,
	pub scope: Scope,
	/// Merge priority; defaults to the scope's priority.
	pub priority: i32,
	#[serde(default)]
	pub emotes: Vec<Emote>,
	#[serde(default = "now_unix")]
	pub timestamp: i64,
}

impl EmoteSet {
	pub fn new(id: EmoteSetId, provider: Provider, scope: Scope) -> Self {
		Self {
			id,
			provider,
			scope,
			priority: scope.priority(),
			emotes: Vec::new(),
			timestamp: now_unix(),
		}
	}
}

/// Kinds of user cosmetics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CosmeticKind {
	Badge,
	Paint,
	Avatar,
}

impl CosmeticKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			CosmeticKind::Badge => "BADGE",
			CosmeticKind::Paint => "PAINT",
			CosmeticKind::Avatar => "AVATAR",
		}
	}
}

/// A cosmetic (badge, paint, avatar) and the users wearing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cosmetic {
	pub id: CosmeticId,
	pub kind: CosmeticKind,
	/// Provider-specific render data, stored verbatim.
	#[serde(default)]
	pub data: serde_json::Value,
	#[serde(default)]
	pub user_ids: Vec<UserId>,
	#[serde(default = "now_unix")]
	pub timestamp: i64,
}

/// Kinds of entitlements granted to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementKind {
	Badge,
	Paint,
	EmoteSet,
}

/// A grant binding a user to a cosmetic or emote set within a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
	pub id: EntitlementId,
	pub kind: EntitlementKind,
	pub user_id: UserId,
	/// The granted object (cosmetic or emote set id).
	pub ref_id: String,
	/// Scope string, e.g. `channel:<id>` or `GLOBAL`.
	pub scope: String,
	#[serde(default = "now_unix")]
	pub timestamp: i64,
}

impl Entitlement {
	/// Scope string for a channel-scoped entitlement.
	pub fn channel_scope(channel: &ChannelId) -> String {
		format!("channel:{channel}")
	}

	/// Whether this entitlement is scoped to the given channel.
	pub fn scoped_to(&self, channel: &ChannelId) -> bool {
		self.scope == Self::channel_scope(channel)
	}
}

/// A provider user record linked to a platform account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConnection {
	pub id: UserId,
	pub platform: Platform,
	/// Platform-native account id this provider user is linked to.
	pub platform_id: ChannelId,
	#[serde(default)]
	pub username: String,
	/// The user's currently active emote set, if any.
	#[serde(default)]
	pub emote_set_id: Option<EmoteSetId>,
}
