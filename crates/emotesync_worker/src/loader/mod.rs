#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use emotesync_domain::{ChannelId, Cosmetic, EmoteSet, EmoteSetId, Platform, UserConnection};
use tracing::debug;

/// Bulk loader failures. Always handled as partial results, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
	#[error("http request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("not found: {0}")]
	NotFound(String),
	#[error("loader disabled")]
	Disabled,
}

/// REST collaborator that resolves channel ids into full entities.
#[async_trait]
pub trait BulkLoader: Send + Sync {
	/// Resolve a platform channel id to its user connection.
	async fn load_user_connection(&self, platform: Platform, id: &ChannelId) -> Result<UserConnection, LoaderError>;

	/// Fetch a full emote set by id.
	async fn load_emote_set(&self, id: &EmoteSetId) -> Result<EmoteSet, LoaderError>;

	/// Fetch the provider-wide global set.
	async fn load_global_set(&self) -> Result<EmoteSet, LoaderError>;

	/// Fetch the static cosmetics catalog.
	async fn load_static_cosmetics(&self) -> Result<Vec<Cosmetic>, LoaderError>;
}

/// HTTP bulk loader against the provider REST API.
pub struct HttpBulkLoader {
	client: reqwest::Client,
	base_url: String,
}

impl HttpBulkLoader {
	pub fn new(base_url: impl Into<String>) -> Result<Self, LoaderError> {
		let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
		Ok(Self {
			client,
			base_url: base_url.into().trim_end_matches('/').to_string(),
		})
	}

	async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, LoaderError> {
		let url = format!("{}{path}", self.base_url);
		debug!(%url, "bulk loader fetch");
		let response = self.client.get(&url).send().await?;
		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Err(LoaderError::NotFound(url));
		}
		Ok(response.error_for_status()?.json::<T>().await?)
	}
}

#[async_trait]
impl BulkLoader for HttpBulkLoader {
	async fn load_user_connection(&self, platform: Platform, id: &ChannelId) -> Result<UserConnection, LoaderError> {
		self.get_json(&format!("/users/{}/{}", platform.as_str(), id.as_str())).await
	}

	async fn load_emote_set(&self, id: &EmoteSetId) -> Result<EmoteSet, LoaderError> {
		self.get_json(&format!("/emote-sets/{}", id.as_str())).await
	}

	async fn load_global_set(&self) -> Result<EmoteSet, LoaderError> {
		self.get_json("/emote-sets/global").await
	}

	async fn load_static_cosmetics(&self) -> Result<Vec<Cosmetic>, LoaderError> {
		self.get_json("/cosmetics").await
	}
}

/// Loader used when no REST endpoint is configured: every fetch fails and
/// callers fall back to whatever the cache already holds.
pub struct NullBulkLoader;

#[async_trait]
impl BulkLoader for NullBulkLoader {
	async fn load_user_connection(&self, _platform: Platform, _id: &ChannelId) -> Result<UserConnection, LoaderError> {
		Err(LoaderError::Disabled)
	}

	async fn load_emote_set(&self, _id: &EmoteSetId) -> Result<EmoteSet, LoaderError> {
		Err(LoaderError::Disabled)
	}

	async fn load_global_set(&self) -> Result<EmoteSet, LoaderError> {
		Err(LoaderError::Disabled)
	}

	async fn load_static_cosmetics(&self) -> Result<Vec<Cosmetic>, LoaderError> {
		Err(LoaderError::Disabled)
	}
}

/// In-memory loader for tests.
#[derive(Default)]
pub struct MemoryBulkLoader {
	inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
	connections: HashMap<(Platform, ChannelId), UserConnection>,
	sets: HashMap<EmoteSetId, EmoteSet>,
	global: Option<EmoteSet>,
	cosmetics: Vec<Cosmetic>,
}

impl MemoryBulkLoader {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert_connection(&self, platform: Platform, id: ChannelId, connection: UserConnection) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.connections.insert((platform, id), connection);
		}
	}

	pub fn insert_set(&self, set: EmoteSet) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.sets.insert(set.id.clone(), set);
		}
	}

	pub fn set_global(&self, set: EmoteSet) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.global = Some(set);
		}
	}

	pub fn set_cosmetics(&self, cosmetics: Vec<Cosmetic>) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.cosmetics = cosmetics;
		}
	}
}

#[async_trait]
impl BulkLoader for MemoryBulkLoader {
	async fn load_user_connection(&self, platform: Platform, id: &ChannelId) -> Result<UserConnection, LoaderError> {
		self.inner
			.lock()
			.ok()
			.and_then(|inner| inner.connections.get(&(platform, id.clone())).cloned())
			.ok_or_else(|| LoaderError::NotFound(format!("connection {}", id.as_str())))
	}

	async fn load_emote_set(&self, id: &EmoteSetId) -> Result<EmoteSet, LoaderError> {
		self.inner
			.lock()
			.ok()
			.and_then(|inner| inner.sets.get(id).cloned())
			.ok_or_else(|| LoaderError::NotFound(format!("emote set {}", id.as_str())))
	}

	async fn load_global_set(&self) -> Result<EmoteSet, LoaderError> {
		self.inner
			.lock()
			.ok()
			.and_then(|inner| inner.global.clone())
			.ok_or_else(|| LoaderError::NotFound("global set".to_string()))
	}

	async fn load_static_cosmetics(&self) -> Result<Vec<Cosmetic>, LoaderError> {
		self.inner
			.lock()
			.map(|inner| inner.cosmetics.clone())
			.map_err(|_| LoaderError::NotFound("cosmetics".to_string()))
	}
}
