#![forbid(unsafe_code)]

use std::sync::Arc;

use emotesync_domain::{
	Cosmetic, CosmeticId, Emote, EmoteId, EmoteSet, EmoteSetId, Entitlement, EntitlementId, PortId, UserId,
};
use emotesync_protocol::port::{LogLevel, PortMessage};
use emotesync_protocol::upstream::{ChangeField, ChangeMap, DispatchPayload, EventTag};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::loader::BulkLoader;
use crate::ports::PortRegistry;

#[cfg(test)]
mod tests;

/// Applies DISPATCH diffs to the cache and notifies interested ports.
///
/// Driven by one task, strictly in arrival order. A failing write is logged
/// and skipped; it never aborts the rest of the change map or the next
/// dispatch.
pub struct ChangeApplier {
	cache: Cache,
	loader: Arc<dyn BulkLoader>,
	ports: PortRegistry,
}

impl ChangeApplier {
	pub fn new(cache: Cache, loader: Arc<dyn BulkLoader>, ports: PortRegistry) -> Self {
		Self { cache, loader, ports }
	}

	/// `targets` carries the ports resolved from the dispatch's match list;
	/// `None` means the match list resolved to nothing and notifications fan
	/// out to every port.
	pub async fn apply(&self, dispatch: DispatchPayload, targets: Option<&[PortId]>) {
		metrics::counter!("emotesync_dispatches_applied_total").increment(1);
		let result = match dispatch.tag {
			EventTag::EmoteSetCreate | EventTag::EmoteSetUpdate => self.apply_emote_set(&dispatch.body, targets).await,
			EventTag::EmoteSetDelete => self.apply_emote_set_delete(&dispatch.body).await,
			EventTag::UserCreate | EventTag::UserUpdate => self.apply_user(&dispatch.body, targets).await,
			EventTag::UserDelete => {
				debug!(id = %dispatch.body.id, "user delete ignored");
				Ok(())
			}
			EventTag::EmoteCreate | EventTag::EmoteUpdate => self.apply_emote(&dispatch.body).await,
			EventTag::EmoteDelete => self.apply_emote_delete(&dispatch.body).await,
			EventTag::CosmeticCreate | EventTag::CosmeticUpdate => self.apply_cosmetic(&dispatch.body, targets).await,
			EventTag::CosmeticDelete => self.apply_cosmetic_delete(&dispatch.body).await,
			EventTag::EntitlementCreate | EventTag::EntitlementUpdate => {
				self.apply_entitlement(&dispatch.body, targets).await
			}
			EventTag::EntitlementDelete => self.apply_entitlement_delete(&dispatch.body, targets).await,
			EventTag::EntitlementReset => self.apply_entitlement_reset(&dispatch.body, targets).await,
			EventTag::SystemAnnouncement => self.apply_announcement(&dispatch.body, targets).await,
			EventTag::Unknown => {
				warn!(id = %dispatch.body.id, "unknown dispatch tag dropped");
				metrics::counter!("emotesync_dispatches_unknown_total").increment(1);
				Ok(())
			}
		};
		if let Err(err) = result {
			warn!(id = %dispatch.body.id, error = %err, "dispatch apply failed; skipped");
			metrics::counter!("emotesync_dispatch_failures_total").increment(1);
		}
	}

	async fn notify(&self, targets: Option<&[PortId]>, msg: PortMessage) {
		match targets {
			Some(ports) => {
				for port in ports {
					self.ports.send_to(*port, msg.clone()).await;
				}
			}
			None => self.ports.broadcast(msg).await,
		}
	}

	/// Apply an emote set diff: pushed appends, pulled removes all entries
	/// matching the old value's id, updated replaces by index or id.
	async fn apply_emote_set(&self, body: &ChangeMap, targets: Option<&[PortId]>) -> anyhow::Result<()> {
		let set_id = EmoteSetId::new(body.id.as_str())?;

		let mut set = match snapshot::<EmoteSet>(body) {
			Some(set) => set,
			None => match self.cache.get_emote_set(&set_id).await? {
				Some(set) => set,
				None => {
					debug!(set = %set_id, "diff for uncached emote set dropped");
					return Ok(());
				}
			},
		};

		for field in body.pushed.iter().filter(|f| f.key == "emotes") {
			match parse_value::<Emote>(field) {
				Some(emote) => set.emotes.push(emote),
				None => warn!(set = %set_id, "unparseable pushed emote skipped"),
			}
		}

		for field in body.pulled.iter().filter(|f| f.key == "emotes") {
			match old_value_id(field) {
				Some(id) => set.emotes.retain(|e| e.id.as_str() != id),
				None => warn!(set = %set_id, "pulled emote without id skipped"),
			}
		}

		for field in body.updated.iter().filter(|f| f.key == "emotes") {
			let Some(emote) = parse_value::<Emote>(field) else {
				warn!(set = %set_id, "unparseable updated emote skipped");
				continue;
			};
			let index = field.index.and_then(|i| usize::try_from(i).ok());
			match index.filter(|i| *i < set.emotes.len()) {
				Some(i) => set.emotes[i] = emote,
				None => match old_value_id(field) {
					Some(old_id) => {
						for slot in set.emotes.iter_mut().filter(|e| e.id.as_str() == old_id) {
							*slot = emote.clone();
						}
					}
					None => set.emotes.push(emote),
				},
			}
		}

		self.cache.put_emote_set(&set).await?;
		self.notify(
			targets,
			PortMessage::EmoteSetUpdated {
				set_id,
				old_set_id: None,
				channel_id: None,
			},
		)
		.await;
		Ok(())
	}

	async fn apply_emote_set_delete(&self, body: &ChangeMap) -> anyhow::Result<()> {
		let set_id = EmoteSetId::new(body.id.as_str())?;
		self.cache.delete_emote_set(&set_id).await?;
		Ok(())
	}

	/// Apply a user diff. An active-set change on a connection fetches the
	/// replacement set, persists it, rewrites channel references and emits
	/// an update carrying both ids.
	async fn apply_user(&self, body: &ChangeMap, targets: Option<&[PortId]>) -> anyhow::Result<()> {
		let user_id = UserId::new(body.id.as_str())?;

		for field in body.updated.iter().chain(body.pushed.iter()) {
			if field.key != "connections" {
				continue;
			}
			let new_set = field.value.as_ref().and_then(connection_set_id);
			let old_set = field.old_value.as_ref().and_then(connection_set_id);
			if new_set == old_set {
				continue;
			}

			let Some(new_id) = new_set else {
				continue;
			};
			let new_id = EmoteSetId::new(new_id)?;

			match self.loader.load_emote_set(&new_id).await {
				Ok(set) => {
					if let Err(err) = self.cache.put_emote_set(&set).await {
						warn!(set = %new_id, error = %err, "active set persist failed");
					}
				}
				Err(err) => warn!(set = %new_id, error = %err, "active set fetch failed"),
			}

			let old_id = match old_set {
				Some(old) => Some(EmoteSetId::new(old)?),
				None => None,
			};
			if let Some(old) = &old_id {
				if let Err(err) = self.cache.swap_channel_set(old, &new_id).await {
					warn!(old = %old, new = %new_id, error = %err, "channel set swap failed");
				}
			}

			self.notify(
				targets,
				PortMessage::EmoteSetUpdated {
					set_id: new_id,
					old_set_id: old_id,
					channel_id: None,
				},
			)
			.await;
		}

		self.notify(targets, PortMessage::UserUpdated { user_id }).await;
		Ok(())
	}

	async fn apply_emote(&self, body: &ChangeMap) -> anyhow::Result<()> {
		let id = EmoteId::new(body.id.as_str())?;

		let mut emote = match snapshot::<Emote>(body) {
			Some(emote) => emote,
			None => match self.cache.get_emote(&id).await? {
				Some(emote) => emote,
				None => {
					debug!(id = %body.id, "diff for uncached emote dropped");
					return Ok(());
				}
			},
		};

		for field in body.updated.iter().filter(|f| f.key == "name") {
			if let Some(name) = field.value.as_ref().and_then(|v| v.as_str()) {
				emote.name = name.to_string();
			}
		}

		self.cache.put_emote(&emote).await
	}

	async fn apply_emote_delete(&self, body: &ChangeMap) -> anyhow::Result<()> {
		let id = EmoteId::new(body.id.as_str())?;
		self.cache.delete_emote(&id).await?;
		Ok(())
	}

	async fn apply_cosmetic(&self, body: &ChangeMap, targets: Option<&[PortId]>) -> anyhow::Result<()> {
		let cosmetic_id = CosmeticId::new(body.id.as_str())?;

		let mut cosmetic = match snapshot::<Cosmetic>(body) {
			Some(cosmetic) => cosmetic,
			None => match self.cache.get_cosmetic(&cosmetic_id).await? {
				Some(cosmetic) => cosmetic,
				None => {
					debug!(cosmetic = %cosmetic_id, "diff for uncached cosmetic dropped");
					return Ok(());
				}
			},
		};

		for field in body.pushed.iter().filter(|f| f.key == "user_ids") {
			match parse_value::<UserId>(field) {
				Some(user) => cosmetic.user_ids.push(user),
				None => warn!(cosmetic = %cosmetic_id, "unparseable pushed user skipped"),
			}
		}
		for field in body.pulled.iter().filter(|f| f.key == "user_ids") {
			let old: Option<UserId> = field.old_value.clone().and_then(|v| serde_json::from_value(v).ok());
			match old {
				Some(user) => cosmetic.user_ids.retain(|u| u != &user),
				None => warn!(cosmetic = %cosmetic_id, "pulled user without id skipped"),
			}
		}

		self.cache.put_cosmetic(&cosmetic).await?;
		self.notify(targets, PortMessage::CosmeticCreated { cosmetic }).await;
		Ok(())
	}

	async fn apply_cosmetic_delete(&self, body: &ChangeMap) -> anyhow::Result<()> {
		let id = CosmeticId::new(body.id.as_str())?;
		self.cache.delete_cosmetic(&id).await?;
		Ok(())
	}

	async fn apply_entitlement(&self, body: &ChangeMap, targets: Option<&[PortId]>) -> anyhow::Result<()> {
		let Some(entitlement) = snapshot::<Entitlement>(body) else {
			debug!(id = %body.id, "entitlement diff without snapshot dropped");
			return Ok(());
		};
		self.cache.put_entitlement(&entitlement).await?;
		self.notify(targets, PortMessage::EntitlementCreated { entitlement }).await;
		Ok(())
	}

	async fn apply_entitlement_delete(&self, body: &ChangeMap, targets: Option<&[PortId]>) -> anyhow::Result<()> {
		let id = EntitlementId::new(body.id.as_str())?;
		let entitlement = match snapshot::<Entitlement>(body) {
			Some(entitlement) => Some(entitlement),
			None => self.cache.get_entitlement(&id).await?,
		};
		self.cache.delete_entitlement(&id).await?;
		if let Some(entitlement) = entitlement {
			self.notify(targets, PortMessage::EntitlementDeleted { entitlement }).await;
		}
		Ok(())
	}

	/// Reset: the change map's id names the user whose grants are wiped.
	async fn apply_entitlement_reset(&self, body: &ChangeMap, targets: Option<&[PortId]>) -> anyhow::Result<()> {
		let user_id = UserId::new(body.id.as_str())?;
		let removed = self.cache.delete_entitlements_for_user(&user_id).await?;
		debug!(user = %user_id, removed, "entitlements reset");
		self.notify(targets, PortMessage::EntitlementReset { user_id }).await;
		Ok(())
	}

	async fn apply_announcement(&self, body: &ChangeMap, targets: Option<&[PortId]>) -> anyhow::Result<()> {
		let message = body
			.object
			.as_ref()
			.and_then(|o| o.get("message"))
			.and_then(|m| m.as_str())
			.unwrap_or("system announcement")
			.to_string();
		self.notify(
			targets,
			PortMessage::Log {
				level: LogLevel::Info,
				message,
			},
		)
		.await;
		Ok(())
	}
}

/// Parse the full entity snapshot, when the server sent one.
fn snapshot<T: serde::de::DeserializeOwned>(body: &ChangeMap) -> Option<T> {
	body.object.clone().and_then(|o| serde_json::from_value(o).ok())
}

fn parse_value<T: serde::de::DeserializeOwned>(field: &ChangeField) -> Option<T> {
	field.value.clone().and_then(|v| serde_json::from_value(v).ok())
}

/// Identity key of a pulled entry: its `id` field, or the value itself when
/// it is a bare string.
fn old_value_id(field: &ChangeField) -> Option<String> {
	let old = field.old_value.as_ref()?;
	if let Some(id) = old.get("id").and_then(|v| v.as_str()) {
		return Some(id.to_string());
	}
	old.as_str().map(str::to_string)
}

/// Active emote set id inside a user connection value.
fn connection_set_id(value: &Value) -> Option<String> {
	if let Some(id) = value.get("emote_set").and_then(|s| s.get("id")).and_then(|v| v.as_str()) {
		return Some(id.to_string());
	}
	value.get("emote_set_id").and_then(|v| v.as_str()).map(str::to_string)
}
