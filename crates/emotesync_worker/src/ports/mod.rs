#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use emotesync_domain::{Channel, ChannelId, Platform, PortId, Provider};
use emotesync_protocol::framing::{DEFAULT_MAX_LINE_SIZE, decode_line, encode_line};
use emotesync_protocol::port::{ChannelDelta, Identity, ImageFormat, PortMessage, StateUpdate};
use emotesync_protocol::upstream::SubscribePayload;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};


/// Outbound queue depth per port before messages are dropped.
const PORT_SEND_BUFFER: usize = 64;

/// A channel one port has joined, with the subscriptions issued for it.
#[derive(Debug, Clone)]
pub struct ChannelInterest {
	pub channel: Channel,
	pub subs: Vec<SubscribePayload>,
}

#[derive(Debug)]
struct PortEntry {
	tx: mpsc::Sender<PortMessage>,
	platform: Option<Platform>,
	providers: Vec<Provider>,
	provider_extensions: Option<Value>,
	identity: Option<Identity>,
	user: Option<Value>,
	image_format: Option<ImageFormat>,
	channels: HashMap<ChannelId, ChannelInterest>,
}

/// Merged per-port state, as seen from outside the registry.
#[derive(Debug, Clone)]
pub struct PortSnapshot {
	pub platform: Option<Platform>,
	pub providers: Vec<Provider>,
	pub provider_extensions: Option<Value>,
	pub identity: Option<Identity>,
	pub user: Option<Value>,
	pub image_format: Option<ImageFormat>,
	pub channels: Vec<ChannelId>,
}

/// What a merged STATE message asks the router to do.
#[derive(Debug, Default)]
pub struct StateEffects {
	/// Channel to join, with the refetch flag.
	pub join: Option<(Channel, bool)>,
	/// Channel left by the port, with the interests it held.
	pub part: Option<ChannelInterest>,
	/// Identity that changed with this update.
	pub identity_changed: Option<Identity>,
}

/// Registry of connected ports and their per-port state.
///
/// Fanout prunes ports whose outbound queue is gone; a dropped receiver is
/// treated as a disconnect in progress.
#[derive(Clone, Default)]
pub struct PortRegistry {
	inner: Arc<Mutex<HashMap<PortId, PortEntry>>>,
}

impl PortRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn register(&self, id: PortId, tx: mpsc::Sender<PortMessage>) {
		let mut inner = self.inner.lock().await;
		inner.insert(
			id,
			PortEntry {
				tx,
				platform: None,
				providers: Vec::new(),
				provider_extensions: None,
				identity: None,
				user: None,
				image_format: None,
				channels: HashMap::new(),
			},
		);
		metrics::gauge!("emotesync_ports_connected").set(inner.len() as f64);
	}

	/// Remove a port, returning every channel interest it still held.
	pub async fn remove(&self, id: PortId) -> Vec<ChannelInterest> {
		let mut inner = self.inner.lock().await;
		let held = inner
			.remove(&id)
			.map(|entry| entry.channels.into_values().collect())
			.unwrap_or_default();
		metrics::gauge!("emotesync_ports_connected").set(inner.len() as f64);
		held
	}

	/// Merge a partial STATE update into the port's record.
	///
	/// Only present fields are touched. At most one channel delta per
	/// message; a join effect is produced for an unknown channel or when
	/// `refetch` forces a re-run.
	pub async fn apply_state(&self, id: PortId, state: StateUpdate) -> StateEffects {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.get_mut(&id) else {
			return StateEffects::default();
		};

		let mut effects = StateEffects::default();

		if let Some(platform) = state.platform {
			entry.platform = Some(platform);
		}
		if let Some(providers) = state.providers {
			entry.providers = providers;
		}
		if let Some(extensions) = state.provider_extensions {
			entry.provider_extensions = Some(extensions);
		}
		if let Some(identity) = state.identity {
			if entry.identity.as_ref() != Some(&identity) {
				effects.identity_changed = Some(identity.clone());
			}
			entry.identity = Some(identity);
		}
		if let Some(user) = state.user {
			entry.user = Some(user);
		}
		if let Some(format) = state.image_format {
			entry.image_format = Some(format);
		}
		match state.channel {
			Some(ChannelDelta::Add { channel, refetch }) => {
				if refetch || !entry.channels.contains_key(&channel.id) {
					effects.join = Some((channel, refetch));
				}
			}
			Some(ChannelDelta::Remove { channel_id }) => {
				effects.part = entry.channels.remove(&channel_id);
			}
			None => {}
		}

		effects
	}

	/// Record a completed join with the subscriptions it issued.
	pub async fn record_channel(&self, id: PortId, interest: ChannelInterest) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.get_mut(&id) {
			entry.channels.insert(interest.channel.id.clone(), interest);
		}
	}

	/// Remove one channel interest from a port.
	pub async fn take_channel(&self, id: PortId, channel_id: &ChannelId) -> Option<ChannelInterest> {
		let mut inner = self.inner.lock().await;
		inner.get_mut(&id).and_then(|entry| entry.channels.remove(channel_id))
	}

	/// Copy of the merged state held for one port.
	pub async fn snapshot(&self, id: PortId) -> Option<PortSnapshot> {
		let inner = self.inner.lock().await;
		inner.get(&id).map(|entry| PortSnapshot {
			platform: entry.platform,
			providers: entry.providers.clone(),
			provider_extensions: entry.provider_extensions.clone(),
			identity: entry.identity.clone(),
			user: entry.user.clone(),
			image_format: entry.image_format,
			channels: entry.channels.keys().cloned().collect(),
		})
	}

	/// Send to one port. A full queue drops the message; a closed queue
	/// prunes the entry.
	pub async fn send_to(&self, id: PortId, msg: PortMessage) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.get(&id) else {
			return false;
		};
		match entry.tx.try_send(msg) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(msg)) => {
				warn!(port = %id, tag = msg.tag(), "port queue full; message dropped");
				metrics::counter!("emotesync_port_messages_dropped_total").increment(1);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				debug!(port = %id, "port queue closed; pruning");
				inner.remove(&id);
				false
			}
		}
	}

	/// Fan a message out to every connected port.
	pub async fn broadcast(&self, msg: PortMessage) {
		let mut inner = self.inner.lock().await;
		let mut dead = Vec::new();
		for (id, entry) in inner.iter() {
			match entry.tx.try_send(msg.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					warn!(port = %id, tag = msg.tag(), "port queue full; broadcast dropped");
					metrics::counter!("emotesync_port_messages_dropped_total").increment(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
			}
		}
		for id in dead {
			inner.remove(&id);
		}
	}

	/// Fan a message out to every port holding `channel_id`.
	pub async fn publish_channel(&self, channel_id: &ChannelId, msg: PortMessage) {
		let mut inner = self.inner.lock().await;
		let mut dead = Vec::new();
		for (id, entry) in inner.iter() {
			if !entry.channels.contains_key(channel_id) {
				continue;
			}
			match entry.tx.try_send(msg.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					warn!(port = %id, tag = msg.tag(), "port queue full; publish dropped");
					metrics::counter!("emotesync_port_messages_dropped_total").increment(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
			}
		}
		for id in dead {
			inner.remove(&id);
		}
	}

	/// Channels any connected port currently holds; the expiry sweep's
	/// exemption set.
	pub async fn active_channels(&self) -> HashSet<ChannelId> {
		let inner = self.inner.lock().await;
		inner.values().flat_map(|entry| entry.channels.keys().cloned()).collect()
	}

	pub async fn count(&self) -> usize {
		self.inner.lock().await.len()
	}
}

/// Connection lifecycle and traffic from the port transport.
#[derive(Debug)]
pub enum PortRequest {
	Connected { id: PortId, tx: mpsc::Sender<PortMessage> },
	Message { id: PortId, msg: PortMessage },
	Disconnected { id: PortId },
}

/// Accept loop for the newline-delimited JSON port transport.
pub async fn run_port_server(listener: TcpListener, requests_tx: mpsc::UnboundedSender<PortRequest>) {
	loop {
		let (stream, addr) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(err) => {
				warn!(error = %err, "port accept failed");
				continue;
			}
		};
		let id = PortId::new_v4();
		info!(port = %id, %addr, "port connected");
		metrics::counter!("emotesync_port_connections_total").increment(1);
		tokio::spawn(run_port_connection(stream, id, requests_tx.clone()));
	}
}

async fn run_port_connection(
	stream: tokio::net::TcpStream,
	id: PortId,
	requests_tx: mpsc::UnboundedSender<PortRequest>,
) {
	let (read_half, mut write_half) = stream.into_split();

	let (tx, mut rx) = mpsc::channel::<PortMessage>(PORT_SEND_BUFFER);
	if requests_tx.send(PortRequest::Connected { id, tx }).is_err() {
		return;
	}

	let writer = tokio::spawn(async move {
		while let Some(msg) = rx.recv().await {
			let line = match encode_line(&msg, DEFAULT_MAX_LINE_SIZE) {
				Ok(line) => line,
				Err(err) => {
					warn!(port = %id, error = %err, "failed to encode port message");
					continue;
				}
			};
			if write_half.write_all(line.as_bytes()).await.is_err() {
				break;
			}
		}
		let _ = write_half.shutdown().await;
	});

	let mut lines = BufReader::new(read_half).lines();
	loop {
		match lines.next_line().await {
			Ok(Some(line)) => match decode_line(&line, DEFAULT_MAX_LINE_SIZE) {
				Ok(msg) => {
					if requests_tx.send(PortRequest::Message { id, msg }).is_err() {
						break;
					}
				}
				Err(err) => {
					// Malformed client line: drop it, keep the port.
					warn!(port = %id, error = %err, "malformed port line dropped");
				}
			},
			Ok(None) => break,
			Err(err) => {
				debug!(port = %id, error = %err, "port read error");
				break;
			}
		}
	}

	let _ = requests_tx.send(PortRequest::Disconnected { id });
	writer.abort();
	info!(port = %id, "port disconnected");
}
