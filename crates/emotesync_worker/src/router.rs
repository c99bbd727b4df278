#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use emotesync_domain::{Channel, Cosmetic, PortId};
use emotesync_protocol::port::{Identity, LogLevel, PortMessage};
use emotesync_protocol::upstream::{Condition, ErrorPayload, Frame, SubscribePayload};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::changes::ChangeApplier;
use crate::loader::BulkLoader;
use crate::ports::{ChannelInterest, PortRegistry, PortRequest};
use crate::subscriptions::{RejectOutcome, SUBSCRIBE_RETRY_DELAY_MS, SubscriptionRegistry};
use crate::upstream::{UpstreamEvent, UpstreamHandle};


/// Central coordinator task.
///
/// Sole owner of the [`SubscriptionRegistry`]; every subscribe, unsubscribe
/// and dispatch flows through its single loop, which keeps DISPATCH
/// application strictly sequential.
pub struct Router {
	cache: Cache,
	loader: Arc<dyn BulkLoader>,
	ports: PortRegistry,
	upstream: UpstreamHandle,
	applier: ChangeApplier,
	registry: SubscriptionRegistry,
	static_cosmetics: Option<Vec<Cosmetic>>,
	retry_tx: mpsc::UnboundedSender<SubscribePayload>,
	retry_rx: mpsc::UnboundedReceiver<SubscribePayload>,
}

impl Router {
	pub fn new(
		cache: Cache,
		loader: Arc<dyn BulkLoader>,
		ports: PortRegistry,
		upstream: UpstreamHandle,
		applier: ChangeApplier,
	) -> Self {
		let (retry_tx, retry_rx) = mpsc::unbounded_channel();
		Self {
			cache,
			loader,
			ports,
			upstream,
			applier,
			registry: SubscriptionRegistry::default(),
			static_cosmetics: None,
			retry_tx,
			retry_rx,
		}
	}

	pub async fn run(
		mut self,
		mut events_rx: mpsc::UnboundedReceiver<UpstreamEvent>,
		mut requests_rx: mpsc::UnboundedReceiver<PortRequest>,
	) {
		loop {
			tokio::select! {
				event = events_rx.recv() => {
					let Some(event) = event else {
						info!("upstream event channel closed; router exiting");
						return;
					};
					self.on_upstream_event(event).await;
				}
				request = requests_rx.recv() => {
					let Some(request) = request else {
						info!("port request channel closed; router exiting");
						return;
					};
					self.on_port_request(request).await;
				}
				Some(key) = self.retry_rx.recv() => {
					// Retry only while the record is still wanted.
					if self.registry.record(&key).is_some() {
						self.upstream.send(Frame::subscribe(&key));
					}
				}
			}
		}
	}

	async fn on_upstream_event(&mut self, event: UpstreamEvent) {
		match event {
			UpstreamEvent::Ready(hello) => {
				let keys = self.registry.replay_keys();
				info!(session = %hello.session_id, replayed = keys.len(), "session ready; replaying subscriptions");
				for key in keys {
					self.upstream.send(Frame::subscribe(&key));
				}
			}
			UpstreamEvent::Dispatch(dispatch) => {
				let targets = self.dispatch_targets(&dispatch.matches);
				self.applier.apply(dispatch, targets.as_deref()).await;
			}
			UpstreamEvent::Ack(ack) => {
				self.registry.confirm_from_ack(&ack);
			}
			UpstreamEvent::ServerError(err) => self.on_server_error(err).await,
			UpstreamEvent::Closed => {
				debug!("upstream session closed");
			}
		}
	}

	/// Resolve a DISPATCH match list to the ports subscribed to the matched
	/// records. Ids minted by a previous session resolve to nothing; those
	/// dispatches fall back to full fan-out rather than being dropped.
	fn dispatch_targets(&self, matches: &[String]) -> Option<Vec<PortId>> {
		if matches.is_empty() {
			return None;
		}
		let ports: HashSet<PortId> = matches
			.iter()
			.filter_map(|id| self.registry.resolve_match(id))
			.flat_map(|key| self.registry.ports_for(key))
			.collect();
		if ports.is_empty() {
			return None;
		}
		Some(ports.into_iter().collect())
	}

	/// A server ERROR that names a subscription is a rejection; anything
	/// else is logged and dropped.
	async fn on_server_error(&mut self, err: ErrorPayload) {
		let Ok(key) = serde_json::from_value::<SubscribePayload>(err.data.clone()) else {
			warn!(message = %err.message, "upstream error without subscription context");
			return;
		};
		match self.registry.reject(&key) {
			RejectOutcome::Retry { attempt } => {
				debug!(topic = %key.topic, attempt, "subscription rejected; retrying");
				let tx = self.retry_tx.clone();
				tokio::spawn(async move {
					tokio::time::sleep(Duration::from_millis(SUBSCRIBE_RETRY_DELAY_MS)).await;
					let _ = tx.send(key);
				});
			}
			RejectOutcome::Surface { ports } => {
				warn!(topic = %key.topic, message = %err.message, "subscription rejected; giving up");
				let log = PortMessage::Log {
					level: LogLevel::Error,
					message: format!("subscription to {} rejected: {}", key.topic, err.message),
				};
				for port in ports {
					self.ports.send_to(port, log.clone()).await;
				}
			}
			RejectOutcome::Untracked => {
				debug!(topic = %key.topic, "rejection for untracked subscription ignored");
			}
		}
	}

	async fn on_port_request(&mut self, request: PortRequest) {
		match request {
			PortRequest::Connected { id, tx } => {
				self.ports.register(id, tx).await;
				self.ports.send_to(id, PortMessage::Init { id }).await;
				let cosmetics = self.static_cosmetics().await;
				if !cosmetics.is_empty() {
					self.ports.send_to(id, PortMessage::StaticCosmeticsFetched { cosmetics }).await;
				}
			}
			PortRequest::Message { id, msg } => self.on_port_message(id, msg).await,
			PortRequest::Disconnected { id } => self.disconnect_port(id).await,
		}
	}

	async fn on_port_message(&mut self, id: PortId, msg: PortMessage) {
		match msg {
			PortMessage::State { state } => {
				let effects = self.ports.apply_state(id, state).await;
				if let Some(identity) = effects.identity_changed {
					self.on_identity(id, identity).await;
				}
				if let Some(interest) = effects.part {
					self.part_channel(id, interest);
				}
				if let Some((channel, refetch)) = effects.join {
					self.join_channel(id, channel, refetch).await;
				}
			}
			PortMessage::Close { reason } => {
				debug!(port = %id, ?reason, "port requested close");
				self.disconnect_port(id).await;
			}
			// Chatter activity fans out to the other ports in that channel.
			PortMessage::ChannelActiveChatter { channel_id, user_id } => {
				self.ports
					.publish_channel(&channel_id, PortMessage::ChannelActiveChatter { channel_id: channel_id.clone(), user_id })
					.await;
			}
			other => {
				debug!(port = %id, tag = other.tag(), "unexpected client message dropped");
			}
		}
	}

	/// Seed the cache for a newly joined channel and issue its
	/// subscriptions. Provider fetch failures drop that provider's
	/// contribution only.
	async fn join_channel(&mut self, port: PortId, mut channel: Channel, refetch: bool) {
		info!(port = %port, channel = %channel.id, refetch, "joining channel");
		metrics::counter!("emotesync_channel_joins_total").increment(1);

		let mut subs: Vec<SubscribePayload> = Vec::new();

		match self.loader.load_user_connection(channel.platform, &channel.id).await {
			Ok(connection) => {
				subs.push(SubscribePayload::object_id("user.*", connection.id.as_str()));
				if let Some(set_id) = &connection.emote_set_id {
					if !channel.set_ids.contains(set_id) {
						channel.set_ids.push(set_id.clone());
					}
					match self.loader.load_emote_set(set_id).await {
						Ok(set) => {
							if let Err(err) = self.cache.put_emote_set(&set).await {
								warn!(set = %set_id, error = %err, "active set persist failed");
							}
						}
						Err(err) => warn!(set = %set_id, error = %err, "active set fetch failed"),
					}
				}
			}
			Err(err) => warn!(channel = %channel.id, error = %err, "user connection fetch failed"),
		}

		match self.loader.load_global_set().await {
			Ok(set) => {
				if !channel.set_ids.contains(&set.id) {
					channel.set_ids.push(set.id.clone());
				}
				if let Err(err) = self.cache.put_emote_set(&set).await {
					warn!(error = %err, "global set persist failed");
				}
			}
			Err(err) => debug!(error = %err, "global set fetch failed"),
		}

		for set_id in &channel.set_ids {
			subs.push(SubscribePayload::object_id("emote_set.*", set_id.as_str()));
		}

		let mut channel_condition = Condition::new();
		channel_condition.insert("ctx".to_string(), "channel".to_string());
		channel_condition.insert("platform".to_string(), channel.platform.as_str().to_string());
		channel_condition.insert("id".to_string(), channel.id.as_str().to_string());
		subs.push(SubscribePayload::new("cosmetic.*", channel_condition.clone()));
		subs.push(SubscribePayload::new("entitlement.*", channel_condition));

		if let Err(err) = self.cache.put_channel(&channel).await {
			warn!(channel = %channel.id, error = %err, "channel persist failed");
		}

		for key in &subs {
			if self.registry.subscribe(key.clone(), port) {
				self.upstream.send(Frame::subscribe(key));
			}
		}

		// A re-join replaces the port's interest; keys the new fetch no
		// longer wants must release their refcounts now, not at disconnect.
		if let Some(previous) = self.ports.take_channel(port, &channel.id).await {
			for key in previous.subs.iter().filter(|k| !subs.contains(k)) {
				if self.registry.unsubscribe(key, port) {
					self.upstream.send(Frame::unsubscribe(key));
				}
			}
		}

		self.ports
			.record_channel(
				port,
				ChannelInterest {
					channel: channel.clone(),
					subs,
				},
			)
			.await;
		self.ports.send_to(port, PortMessage::ChannelFetched { channel }).await;
	}

	fn part_channel(&mut self, port: PortId, interest: ChannelInterest) {
		debug!(port = %port, channel = %interest.channel.id, "leaving channel");
		for key in &interest.subs {
			if self.registry.unsubscribe(key, port) {
				self.upstream.send(Frame::unsubscribe(key));
			}
		}
	}

	/// An identity change subscribes the port to its own user events.
	async fn on_identity(&mut self, port: PortId, identity: Identity) {
		let key = SubscribePayload::object_id("user.*", identity.user_id.as_str());
		if self.registry.subscribe(key.clone(), port) {
			self.upstream.send(Frame::subscribe(&key));
		}
		self.ports.send_to(port, PortMessage::IdentityFetched { identity }).await;
	}

	async fn disconnect_port(&mut self, id: PortId) {
		let held = self.ports.remove(id).await;
		debug!(port = %id, channels = held.len(), "port disconnected; cascading unsubscribes");
		for key in self.registry.remove_port(id) {
			self.upstream.send(Frame::unsubscribe(&key));
		}
	}

	/// Static cosmetics catalog, fetched once per process and reused.
	async fn static_cosmetics(&mut self) -> Vec<Cosmetic> {
		if let Some(cosmetics) = &self.static_cosmetics {
			return cosmetics.clone();
		}
		match self.loader.load_static_cosmetics().await {
			Ok(cosmetics) => {
				self.static_cosmetics = Some(cosmetics.clone());
				cosmetics
			}
			Err(err) => {
				debug!(error = %err, "static cosmetics fetch failed");
				Vec::new()
			}
		}
	}
}
