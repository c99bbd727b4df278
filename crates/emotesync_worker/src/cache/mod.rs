#![forbid(unsafe_code)]

use std::collections::HashSet;

use anyhow::Context as _;
use emotesync_domain::{
	Channel, ChannelId, Cosmetic, CosmeticId, Emote, EmoteId, EmoteSet, EmoteSetId, Entitlement, EntitlementId, UserId,
	now_unix,
};
use sqlx::SqlitePool;
use tracing::{debug, info};


/// Channel rows older than this are eligible for expiry.
pub const CHANNEL_TTL_SECS: i64 = 60 * 60;
/// Cosmetic rows older than this are deleted unconditionally.
pub const COSMETIC_TTL_SECS: i64 = 24 * 60 * 60;

/// Counts of rows removed by one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireStats {
	pub channels: u64,
	pub emote_sets: u64,
	pub entitlements: u64,
	pub cosmetics: u64,
}

/// Persistent keyed store of domain entities, shared by every component.
///
/// Rows keep the serialized entity in a `payload` column beside the indexed
/// columns; schema versions are additive only so old and new processes can
/// open the same store.
#[derive(Debug, Clone)]
pub struct Cache {
	pool: SqlitePool,
}

impl Cache {
	/// Open the store and run pending migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let mut options = sqlx::sqlite::SqlitePoolOptions::new();
		// An in-memory database lives and dies with its connection; pin the
		// pool to exactly one.
		if database_url.contains(":memory:") || database_url.contains("mode=memory") {
			options = options
				.max_connections(1)
				.min_connections(1)
				.idle_timeout(None)
				.max_lifetime(None);
		}
		let pool = options.connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		Ok(Self { pool })
	}

	pub async fn put_channel(&self, channel: &Channel) -> anyhow::Result<()> {
		let payload = serde_json::to_string(channel).context("serialize channel")?;
		let insert = sqlx::query("INSERT INTO channels (id, payload, timestamp) VALUES (?, ?, ?)")
			.bind(channel.id.as_str())
			.bind(&payload)
			.bind(channel.timestamp)
			.execute(&self.pool)
			.await;

		match insert {
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => {
				sqlx::query("UPDATE channels SET payload = ?, timestamp = ? WHERE id = ?")
					.bind(&payload)
					.bind(channel.timestamp)
					.bind(channel.id.as_str())
					.execute(&self.pool)
					.await
					.context("update channel after conflict")?;
				Ok(())
			}
			Err(e) => Err(e).context("insert channel"),
		}
	}

	pub async fn get_channel(&self, id: &ChannelId) -> anyhow::Result<Option<Channel>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM channels WHERE id = ?")
			.bind(id.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select channel")?;

		decode_row(row)
	}

	pub async fn put_emote_set(&self, set: &EmoteSet) -> anyhow::Result<()> {
		let payload = serde_json::to_string(set).context("serialize emote set")?;
		let insert = sqlx::query(
			"INSERT INTO emote_sets (id, payload, timestamp, priority, provider, scope) VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(set.id.as_str())
		.bind(&payload)
		.bind(set.timestamp)
		.bind(set.priority)
		.bind(set.provider.as_str())
		.bind(serde_json::to_string(&set.scope).context("serialize scope")?)
		.execute(&self.pool)
		.await;

		match insert {
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => {
				sqlx::query("UPDATE emote_sets SET payload = ?, timestamp = ?, priority = ? WHERE id = ?")
					.bind(&payload)
					.bind(set.timestamp)
					.bind(set.priority)
					.bind(set.id.as_str())
					.execute(&self.pool)
					.await
					.context("update emote set after conflict")?;
				Ok(())
			}
			Err(e) => Err(e).context("insert emote set"),
		}
	}

	pub async fn get_emote_set(&self, id: &EmoteSetId) -> anyhow::Result<Option<EmoteSet>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM emote_sets WHERE id = ?")
			.bind(id.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select emote set")?;

		decode_row(row)
	}

	pub async fn delete_emote_set(&self, id: &EmoteSetId) -> anyhow::Result<bool> {
		let res = sqlx::query("DELETE FROM emote_sets WHERE id = ?")
			.bind(id.as_str())
			.execute(&self.pool)
			.await
			.context("delete emote set")?;
		Ok(res.rows_affected() > 0)
	}

	pub async fn put_emote(&self, emote: &Emote) -> anyhow::Result<()> {
		let payload = serde_json::to_string(emote).context("serialize emote")?;
		let insert = sqlx::query("INSERT INTO emotes (id, payload, timestamp, name, owner_id) VALUES (?, ?, ?, ?, ?)")
			.bind(emote.id.as_str())
			.bind(&payload)
			.bind(emote.timestamp)
			.bind(&emote.name)
			.bind(emote.owner.as_ref().map(|o| o.as_str().to_string()))
			.execute(&self.pool)
			.await;

		match insert {
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => {
				sqlx::query("UPDATE emotes SET payload = ?, timestamp = ?, name = ? WHERE id = ?")
					.bind(&payload)
					.bind(emote.timestamp)
					.bind(&emote.name)
					.bind(emote.id.as_str())
					.execute(&self.pool)
					.await
					.context("update emote after conflict")?;
				Ok(())
			}
			Err(e) => Err(e).context("insert emote"),
		}
	}

	pub async fn delete_emote(&self, id: &EmoteId) -> anyhow::Result<bool> {
		let res = sqlx::query("DELETE FROM emotes WHERE id = ?")
			.bind(id.as_str())
			.execute(&self.pool)
			.await
			.context("delete emote")?;
		Ok(res.rows_affected() > 0)
	}

	pub async fn get_emote(&self, id: &EmoteId) -> anyhow::Result<Option<Emote>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM emotes WHERE id = ?")
			.bind(id.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select emote")?;

		decode_row(row)
	}

	pub async fn put_cosmetic(&self, cosmetic: &Cosmetic) -> anyhow::Result<()> {
		let payload = serde_json::to_string(cosmetic).context("serialize cosmetic")?;
		let insert = sqlx::query("INSERT INTO cosmetics (id, payload, timestamp, kind) VALUES (?, ?, ?, ?)")
			.bind(cosmetic.id.as_str())
			.bind(&payload)
			.bind(cosmetic.timestamp)
			.bind(cosmetic.kind.as_str())
			.execute(&self.pool)
			.await;

		match insert {
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => {
				sqlx::query("UPDATE cosmetics SET payload = ?, timestamp = ?, kind = ? WHERE id = ?")
					.bind(&payload)
					.bind(cosmetic.timestamp)
					.bind(cosmetic.kind.as_str())
					.bind(cosmetic.id.as_str())
					.execute(&self.pool)
					.await
					.context("update cosmetic after conflict")?;
				Ok(())
			}
			Err(e) => Err(e).context("insert cosmetic"),
		}
	}

	pub async fn get_cosmetic(&self, id: &CosmeticId) -> anyhow::Result<Option<Cosmetic>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM cosmetics WHERE id = ?")
			.bind(id.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select cosmetic")?;

		decode_row(row)
	}

	pub async fn delete_cosmetic(&self, id: &CosmeticId) -> anyhow::Result<bool> {
		let res = sqlx::query("DELETE FROM cosmetics WHERE id = ?")
			.bind(id.as_str())
			.execute(&self.pool)
			.await
			.context("delete cosmetic")?;
		Ok(res.rows_affected() > 0)
	}

	pub async fn put_entitlement(&self, ent: &Entitlement) -> anyhow::Result<()> {
		let payload = serde_json::to_string(ent).context("serialize entitlement")?;
		let insert = sqlx::query("INSERT INTO entitlements (id, payload, scope, timestamp, user_id) VALUES (?, ?, ?, ?, ?)")
			.bind(ent.id.as_str())
			.bind(&payload)
			.bind(&ent.scope)
			.bind(ent.timestamp)
			.bind(ent.user_id.as_str())
			.execute(&self.pool)
			.await;

		match insert {
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => {
				sqlx::query("UPDATE entitlements SET payload = ?, scope = ?, timestamp = ?, user_id = ? WHERE id = ?")
					.bind(&payload)
					.bind(&ent.scope)
					.bind(ent.timestamp)
					.bind(ent.user_id.as_str())
					.bind(ent.id.as_str())
					.execute(&self.pool)
					.await
					.context("update entitlement after conflict")?;
				Ok(())
			}
			Err(e) => Err(e).context("insert entitlement"),
		}
	}

	pub async fn get_entitlement(&self, id: &EntitlementId) -> anyhow::Result<Option<Entitlement>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM entitlements WHERE id = ?")
			.bind(id.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select entitlement")?;

		decode_row(row)
	}

	pub async fn delete_entitlement(&self, id: &EntitlementId) -> anyhow::Result<bool> {
		let res = sqlx::query("DELETE FROM entitlements WHERE id = ?")
			.bind(id.as_str())
			.execute(&self.pool)
			.await
			.context("delete entitlement")?;
		Ok(res.rows_affected() > 0)
	}

	pub async fn delete_entitlements_for_user(&self, user_id: &UserId) -> anyhow::Result<u64> {
		let res = sqlx::query("DELETE FROM entitlements WHERE user_id = ?")
			.bind(user_id.as_str())
			.execute(&self.pool)
			.await
			.context("delete entitlements for user")?;
		Ok(res.rows_affected())
	}

	/// Replace `old` with `new` in the `set_ids` of every channel holding it.
	pub async fn swap_channel_set(&self, old: &EmoteSetId, new: &EmoteSetId) -> anyhow::Result<u64> {
		let rows: Vec<(String,)> = sqlx::query_as("SELECT payload FROM channels")
			.fetch_all(&self.pool)
			.await
			.context("select channels")?;

		let mut swapped = 0u64;
		for (payload,) in rows {
			let Ok(mut channel) = serde_json::from_str::<Channel>(&payload) else {
				continue;
			};
			if !channel.set_ids.contains(old) {
				continue;
			}
			channel.set_ids.retain(|s| s != old);
			if !channel.set_ids.contains(new) {
				channel.set_ids.push(new.clone());
			}
			channel.timestamp = now_unix();
			self.put_channel(&channel).await?;
			swapped += 1;
		}
		Ok(swapped)
	}

	pub async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
			.bind(key)
			.fetch_optional(&self.pool)
			.await
			.context("select setting")?;
		Ok(row.map(|(v,)| v))
	}

	pub async fn put_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
			.bind(key)
			.bind(value)
			.execute(&self.pool)
			.await
			.context("upsert setting")?;
		Ok(())
	}

	/// Sweep stale rows.
	///
	/// Channels older than [`CHANNEL_TTL_SECS`] and not in `exempt` are
	/// removed together with their emote sets and channel-scoped
	/// entitlements; cosmetics older than [`COSMETIC_TTL_SECS`] are removed
	/// regardless of exemption.
	pub async fn expire_documents(&self, exempt: &HashSet<ChannelId>) -> anyhow::Result<ExpireStats> {
		let now = now_unix();
		let channel_threshold = now - CHANNEL_TTL_SECS;
		let cosmetic_threshold = now - COSMETIC_TTL_SECS;

		let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, payload FROM channels WHERE timestamp < ?")
			.bind(channel_threshold)
			.fetch_all(&self.pool)
			.await
			.context("select stale channels")?;

		let mut stats = ExpireStats::default();

		for (id, payload) in rows {
			let Ok(channel_id) = ChannelId::new(id) else {
				continue;
			};
			if exempt.contains(&channel_id) {
				debug!(channel = %channel_id, "expiry: channel exempt");
				continue;
			}

			if let Ok(channel) = serde_json::from_str::<Channel>(&payload) {
				for set_id in &channel.set_ids {
					let res = sqlx::query("DELETE FROM emote_sets WHERE id = ?")
						.bind(set_id.as_str())
						.execute(&self.pool)
						.await
						.context("delete expired emote set")?;
					stats.emote_sets += res.rows_affected();
				}
			}

			let res = sqlx::query("DELETE FROM entitlements WHERE scope = ?")
				.bind(Entitlement::channel_scope(&channel_id))
				.execute(&self.pool)
				.await
				.context("delete expired entitlements")?;
			stats.entitlements += res.rows_affected();

			let res = sqlx::query("DELETE FROM channels WHERE id = ?")
				.bind(channel_id.as_str())
				.execute(&self.pool)
				.await
				.context("delete expired channel")?;
			stats.channels += res.rows_affected();
		}

		let res = sqlx::query("DELETE FROM cosmetics WHERE timestamp < ?")
			.bind(cosmetic_threshold)
			.execute(&self.pool)
			.await
			.context("delete expired cosmetics")?;
		stats.cosmetics += res.rows_affected();

		if stats != ExpireStats::default() {
			info!(
				channels = stats.channels,
				emote_sets = stats.emote_sets,
				entitlements = stats.entitlements,
				cosmetics = stats.cosmetics,
				"expiry sweep removed stale rows"
			);
		}
		metrics::counter!("emotesync_cache_expired_rows_total")
			.increment(stats.channels + stats.emote_sets + stats.entitlements + stats.cosmetics);

		Ok(stats)
	}
}

fn decode_row<T: serde::de::DeserializeOwned>(row: Option<(String,)>) -> anyhow::Result<Option<T>> {
	match row {
		Some((payload,)) => Ok(Some(serde_json::from_str(&payload).context("decode payload")?)),
		None => Ok(None),
	}
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
	match e {
		sqlx::Error::Database(db) => db.is_unique_violation(),
		_ => false,
	}
}
