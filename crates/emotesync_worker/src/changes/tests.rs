#![forbid(unsafe_code)]

use std::sync::Arc;

use emotesync_domain::{
	Channel, ChannelId, Cosmetic, CosmeticId, CosmeticKind, Emote, EmoteId, EmoteSet, EmoteSetId, Entitlement,
	EntitlementId, EntitlementKind, Platform, PortId, Provider, Scope, UserId, now_unix,
};
use emotesync_protocol::port::PortMessage;
use emotesync_protocol::upstream::{ChangeField, ChangeMap, DispatchPayload, EventTag};
use tokio::sync::mpsc;

use crate::cache::Cache;
use crate::changes::ChangeApplier;
use crate::loader::MemoryBulkLoader;
use crate::ports::PortRegistry;

async fn applier_with_port() -> (ChangeApplier, Cache, Arc<MemoryBulkLoader>, mpsc::Receiver<PortMessage>) {
	let cache = Cache::connect("sqlite::memory:").await.unwrap();
	let loader = Arc::new(MemoryBulkLoader::new());
	let ports = PortRegistry::new();
	let (tx, rx) = mpsc::channel(64);
	ports.register(PortId::new_v4(), tx).await;
	let applier = ChangeApplier::new(cache.clone(), loader.clone(), ports);
	(applier, cache, loader, rx)
}

fn emote(id: &str, name: &str) -> Emote {
	Emote {
		id: EmoteId::new(id).unwrap(),
		name: name.to_string(),
		owner: None,
		host: Default::default(),
		timestamp: now_unix(),
	}
}

fn set_with(id: &str, emotes: Vec<Emote>) -> EmoteSet {
	let mut set = EmoteSet::new(EmoteSetId::new(id).unwrap(), Provider::SevenTv, Scope::Channel);
	set.emotes = emotes;
	set
}

fn dispatch(tag: EventTag, body: ChangeMap) -> DispatchPayload {
	DispatchPayload {
		tag,
		body,
		matches: Vec::new(),
	}
}

fn drain(rx: &mut mpsc::Receiver<PortMessage>) -> Vec<PortMessage> {
	let mut out = Vec::new();
	while let Ok(msg) = rx.try_recv() {
		out.push(msg);
	}
	out
}

#[tokio::test]
async fn pushed_appends_and_pulled_removes_all_matching() {
	let (applier, cache, _loader, mut rx) = applier_with_port().await;
	let set = set_with("s1", vec![emote("a", "Kappa"), emote("b", "Pog"), emote("a", "KappaHD")]);
	cache.put_emote_set(&set).await.unwrap();

	applier
		.apply(dispatch(
			EventTag::EmoteSetUpdate,
			ChangeMap {
				id: "s1".to_string(),
				pushed: vec![ChangeField {
					key: "emotes".to_string(),
					value: Some(serde_json::to_value(emote("c", "LUL")).unwrap()),
					..Default::default()
				}],
				pulled: vec![ChangeField {
					key: "emotes".to_string(),
					old_value: Some(serde_json::json!({"id": "a"})),
					..Default::default()
				}],
				..Default::default()
			},
		), None)
		.await;

	let stored = cache.get_emote_set(&EmoteSetId::new("s1").unwrap()).await.unwrap().unwrap();
	let names: Vec<&str> = stored.emotes.iter().map(|e| e.name.as_str()).collect();
	assert_eq!(names, vec!["Pog", "LUL"], "pull removes every entry with the old id");

	let msgs = drain(&mut rx);
	assert!(msgs.iter().any(|m| matches!(m, PortMessage::EmoteSetUpdated { set_id, .. } if set_id.as_str() == "s1")));
}

#[tokio::test]
async fn updated_replaces_by_index() {
	let (applier, cache, _loader, _rx) = applier_with_port().await;
	cache
		.put_emote_set(&set_with("s2", vec![emote("a", "Old"), emote("b", "Keep")]))
		.await
		.unwrap();

	applier
		.apply(dispatch(
			EventTag::EmoteSetUpdate,
			ChangeMap {
				id: "s2".to_string(),
				updated: vec![ChangeField {
					key: "emotes".to_string(),
					index: Some(0),
					value: Some(serde_json::to_value(emote("a", "Renamed")).unwrap()),
					old_value: Some(serde_json::json!({"id": "a"})),
					..Default::default()
				}],
				..Default::default()
			},
		), None)
		.await;

	let stored = cache.get_emote_set(&EmoteSetId::new("s2").unwrap()).await.unwrap().unwrap();
	assert_eq!(stored.emotes[0].name, "Renamed");
	assert_eq!(stored.emotes[1].name, "Keep");
}

#[tokio::test]
async fn diff_for_uncached_set_is_dropped() {
	let (applier, cache, _loader, mut rx) = applier_with_port().await;

	applier
		.apply(dispatch(
			EventTag::EmoteSetUpdate,
			ChangeMap {
				id: "ghost".to_string(),
				pushed: vec![ChangeField {
					key: "emotes".to_string(),
					value: Some(serde_json::to_value(emote("x", "X")).unwrap()),
					..Default::default()
				}],
				..Default::default()
			},
		), None)
		.await;

	assert!(cache.get_emote_set(&EmoteSetId::new("ghost").unwrap()).await.unwrap().is_none());
	assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn snapshot_seeds_unknown_set() {
	let (applier, cache, _loader, _rx) = applier_with_port().await;
	let set = set_with("s3", vec![emote("a", "Kappa")]);

	applier
		.apply(dispatch(
			EventTag::EmoteSetCreate,
			ChangeMap {
				id: "s3".to_string(),
				object: Some(serde_json::to_value(&set).unwrap()),
				..Default::default()
			},
		), None)
		.await;

	let stored = cache.get_emote_set(&EmoteSetId::new("s3").unwrap()).await.unwrap().unwrap();
	assert_eq!(stored, set);
}

#[tokio::test]
async fn user_update_fetches_and_swaps_active_set() {
	let (applier, cache, loader, mut rx) = applier_with_port().await;

	let mut channel = Channel::new(ChannelId::new("chan-1").unwrap(), Platform::Twitch);
	channel.set_ids = vec![EmoteSetId::new("old-set").unwrap()];
	cache.put_channel(&channel).await.unwrap();
	loader.insert_set(set_with("new-set", vec![emote("n", "New")]));

	applier
		.apply(dispatch(
			EventTag::UserUpdate,
			ChangeMap {
				id: "user-1".to_string(),
				updated: vec![ChangeField {
					key: "connections".to_string(),
					index: Some(0),
					value: Some(serde_json::json!({"emote_set": {"id": "new-set"}})),
					old_value: Some(serde_json::json!({"emote_set": {"id": "old-set"}})),
					..Default::default()
				}],
				..Default::default()
			},
		), None)
		.await;

	let stored = cache.get_emote_set(&EmoteSetId::new("new-set").unwrap()).await.unwrap();
	assert!(stored.is_some(), "replacement set fetched and persisted");

	let channel = cache.get_channel(&ChannelId::new("chan-1").unwrap()).await.unwrap().unwrap();
	assert_eq!(channel.set_ids, vec![EmoteSetId::new("new-set").unwrap()]);

	let msgs = drain(&mut rx);
	assert!(msgs.iter().any(|m| matches!(
		m,
		PortMessage::EmoteSetUpdated { set_id, old_set_id: Some(old), .. }
			if set_id.as_str() == "new-set" && old.as_str() == "old-set"
	)));
	assert!(msgs.iter().any(|m| matches!(m, PortMessage::UserUpdated { user_id } if user_id.as_str() == "user-1")));
}

#[tokio::test]
async fn cosmetic_user_list_push_and_pull() {
	let (applier, cache, _loader, mut rx) = applier_with_port().await;
	let cosmetic = Cosmetic {
		id: CosmeticId::new("c1").unwrap(),
		kind: CosmeticKind::Badge,
		data: serde_json::json!({}),
		user_ids: vec![UserId::new("u1").unwrap()],
		timestamp: now_unix(),
	};
	cache.put_cosmetic(&cosmetic).await.unwrap();

	applier
		.apply(dispatch(
			EventTag::CosmeticUpdate,
			ChangeMap {
				id: "c1".to_string(),
				pushed: vec![ChangeField {
					key: "user_ids".to_string(),
					value: Some(serde_json::json!("u2")),
					..Default::default()
				}],
				pulled: vec![ChangeField {
					key: "user_ids".to_string(),
					old_value: Some(serde_json::json!("u1")),
					..Default::default()
				}],
				..Default::default()
			},
		), None)
		.await;

	let stored = cache.get_cosmetic(&CosmeticId::new("c1").unwrap()).await.unwrap().unwrap();
	assert_eq!(stored.user_ids, vec![UserId::new("u2").unwrap()]);
	assert!(drain(&mut rx)
		.iter()
		.any(|m| matches!(m, PortMessage::CosmeticCreated { .. })));
}

#[tokio::test]
async fn entitlement_lifecycle() {
	let (applier, cache, _loader, mut rx) = applier_with_port().await;
	let ent = Entitlement {
		id: EntitlementId::new("e1").unwrap(),
		kind: EntitlementKind::Badge,
		user_id: UserId::new("u1").unwrap(),
		ref_id: "badge-1".to_string(),
		scope: "GLOBAL".to_string(),
		timestamp: now_unix(),
	};

	applier
		.apply(dispatch(
			EventTag::EntitlementCreate,
			ChangeMap {
				id: "e1".to_string(),
				object: Some(serde_json::to_value(&ent).unwrap()),
				..Default::default()
			},
		), None)
		.await;
	assert!(cache.get_entitlement(&ent.id).await.unwrap().is_some());

	applier
		.apply(dispatch(
			EventTag::EntitlementReset,
			ChangeMap {
				id: "u1".to_string(),
				..Default::default()
			},
		), None)
		.await;
	assert!(cache.get_entitlement(&ent.id).await.unwrap().is_none());

	let msgs = drain(&mut rx);
	assert!(msgs.iter().any(|m| matches!(m, PortMessage::EntitlementCreated { .. })));
	assert!(msgs.iter().any(|m| matches!(m, PortMessage::EntitlementReset { user_id } if user_id.as_str() == "u1")));
}

#[tokio::test]
async fn emote_rename_updates_cached_row() {
	let (applier, cache, _loader, _rx) = applier_with_port().await;
	cache.put_emote(&emote("e1", "OldName")).await.unwrap();

	applier
		.apply(dispatch(
			EventTag::EmoteUpdate,
			ChangeMap {
				id: "e1".to_string(),
				updated: vec![ChangeField {
					key: "name".to_string(),
					value: Some(serde_json::json!("NewName")),
					old_value: Some(serde_json::json!("OldName")),
					..Default::default()
				}],
				..Default::default()
			},
		), None)
		.await;

	let stored = cache.get_emote(&EmoteId::new("e1").unwrap()).await.unwrap().unwrap();
	assert_eq!(stored.name, "NewName");
}

#[tokio::test]
async fn targeted_dispatch_skips_unrelated_ports() {
	let cache = Cache::connect("sqlite::memory:").await.unwrap();
	let loader = Arc::new(MemoryBulkLoader::new());
	let ports = PortRegistry::new();

	let interested = PortId::new_v4();
	let (tx_a, mut rx_a) = mpsc::channel(64);
	ports.register(interested, tx_a).await;
	let (tx_b, mut rx_b) = mpsc::channel(64);
	ports.register(PortId::new_v4(), tx_b).await;

	let applier = ChangeApplier::new(cache.clone(), loader, ports);
	let set = set_with("s9", vec![]);
	applier
		.apply(
			dispatch(
				EventTag::EmoteSetCreate,
				ChangeMap {
					id: "s9".to_string(),
					object: Some(serde_json::to_value(&set).unwrap()),
					..Default::default()
				},
			),
			Some(&[interested]),
		)
		.await;

	assert!(drain(&mut rx_a)
		.iter()
		.any(|m| matches!(m, PortMessage::EmoteSetUpdated { set_id, .. } if set_id.as_str() == "s9")));
	assert!(drain(&mut rx_b).is_empty(), "unmatched port sees nothing");
}

#[tokio::test]
async fn failure_never_aborts_subsequent_dispatches() {
	let (applier, cache, _loader, _rx) = applier_with_port().await;

	// Empty id fails validation; the failure is logged and swallowed.
	applier
		.apply(dispatch(
			EventTag::EmoteSetDelete,
			ChangeMap {
				id: String::new(),
				..Default::default()
			},
		), None)
		.await;

	let set = set_with("after", vec![]);
	applier
		.apply(dispatch(
			EventTag::EmoteSetCreate,
			ChangeMap {
				id: "after".to_string(),
				object: Some(serde_json::to_value(&set).unwrap()),
				..Default::default()
			},
		), None)
		.await;
	assert!(cache.get_emote_set(&set.id).await.unwrap().is_some());
}

#[tokio::test]
async fn unknown_tag_is_dropped() {
	let (applier, _cache, _loader, mut rx) = applier_with_port().await;
	applier
		.apply(dispatch(
			EventTag::Unknown,
			ChangeMap {
				id: "whatever".to_string(),
				..Default::default()
			},
		), None)
		.await;
	assert!(drain(&mut rx).is_empty());
}
