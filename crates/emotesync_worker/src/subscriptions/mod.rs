#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use emotesync_domain::PortId;
use emotesync_protocol::upstream::{AckPayload, SubscribePayload};
use tracing::debug;


/// Attempts before a rejected SUBSCRIBE is surfaced to its ports.
pub const MAX_SUBSCRIBE_ATTEMPTS: u32 = 3;
/// Spacing between SUBSCRIBE retry attempts, in milliseconds.
pub const SUBSCRIBE_RETRY_DELAY_MS: u64 = 1_000;

/// One ref-counted upstream subscription.
#[derive(Debug, Default)]
pub struct Subscription {
	ref_count: usize,
	subscribers: HashSet<PortId>,
	upstream_id: Option<String>,
	confirmed: bool,
	attempts: u32,
}

impl Subscription {
	pub fn ref_count(&self) -> usize {
		self.ref_count
	}

	pub fn confirmed(&self) -> bool {
		self.confirmed
	}

	pub fn upstream_id(&self) -> Option<&str> {
		self.upstream_id.as_deref()
	}
}

/// Outcome of a server-side SUBSCRIBE rejection.
#[derive(Debug, PartialEq, Eq)]
pub enum RejectOutcome {
	/// Resend the SUBSCRIBE after [`SUBSCRIBE_RETRY_DELAY_MS`].
	Retry { attempt: u32 },
	/// Attempts exhausted; record dropped, surface to these ports.
	Surface { ports: Vec<PortId> },
	/// No record tracked this key.
	Untracked,
}

/// Ref-counted mapping from `(topic, condition)` to interested ports.
///
/// Sole writer of `ref_count` and `confirmed`. Identical interest from N
/// ports collapses to one upstream subscription; the record is removed and
/// unsubscribed upstream exactly when its ref count reaches zero.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
	subs: HashMap<SubscribePayload, Subscription>,
	by_upstream_id: HashMap<String, SubscribePayload>,
}

impl SubscriptionRegistry {
	/// Register `port`'s interest. Returns `true` when a SUBSCRIBE must be
	/// sent upstream (first subscriber for this key).
	pub fn subscribe(&mut self, key: SubscribePayload, port: PortId) -> bool {
		let is_new = !self.subs.contains_key(&key);
		let entry = self.subs.entry(key).or_default();
		if entry.subscribers.insert(port) {
			entry.ref_count += 1;
		}
		debug_assert_eq!(entry.ref_count, entry.subscribers.len());
		metrics::gauge!("emotesync_subscriptions_tracked").set(self.subs.len() as f64);
		is_new
	}

	/// Drop `port`'s interest. Returns `true` when the record reached zero
	/// and an UNSUBSCRIBE must be sent upstream.
	pub fn unsubscribe(&mut self, key: &SubscribePayload, port: PortId) -> bool {
		let Some(entry) = self.subs.get_mut(key) else {
			return false;
		};
		if entry.subscribers.remove(&port) {
			entry.ref_count -= 1;
		}
		debug_assert_eq!(entry.ref_count, entry.subscribers.len());

		if entry.ref_count == 0 {
			if let Some(id) = self.subs.remove(key).and_then(|s| s.upstream_id) {
				self.by_upstream_id.remove(&id);
			}
			metrics::gauge!("emotesync_subscriptions_tracked").set(self.subs.len() as f64);
			return true;
		}
		false
	}

	/// Drop every interest held by a disconnecting port. Returns the keys
	/// whose records reached zero and need an upstream UNSUBSCRIBE.
	pub fn remove_port(&mut self, port: PortId) -> Vec<SubscribePayload> {
		let held: Vec<SubscribePayload> = self
			.subs
			.iter()
			.filter(|(_, s)| s.subscribers.contains(&port))
			.map(|(k, _)| k.clone())
			.collect();

		let mut to_unsubscribe = Vec::new();
		for key in held {
			if self.unsubscribe(&key, port) {
				to_unsubscribe.push(key);
			}
		}
		to_unsubscribe
	}

	/// Mark a pending record confirmed and remember its server-assigned id.
	pub fn confirm(&mut self, key: &SubscribePayload, upstream_id: Option<String>) -> bool {
		let Some(entry) = self.subs.get_mut(key) else {
			return false;
		};
		entry.confirmed = true;
		entry.attempts = 0;
		if let Some(id) = upstream_id {
			entry.upstream_id = Some(id.clone());
			self.by_upstream_id.insert(id, key.clone());
		}
		true
	}

	/// Resolve a SUBSCRIBE ACK to its local record and confirm it.
	///
	/// ACK data carries the echoed `{type, condition}` plus the
	/// server-assigned `id`.
	pub fn confirm_from_ack(&mut self, ack: &AckPayload) -> Option<SubscribePayload> {
		if !ack.command.eq_ignore_ascii_case("subscribe") {
			return None;
		}
		let key: SubscribePayload = serde_json::from_value(ack.data.clone()).ok()?;
		let upstream_id = ack.data.get("id").and_then(|v| v.as_str()).map(str::to_string);
		if self.confirm(&key, upstream_id) {
			debug!(topic = %key.topic, "subscription confirmed");
			Some(key)
		} else {
			None
		}
	}

	/// Record a server rejection of a SUBSCRIBE for `key`.
	pub fn reject(&mut self, key: &SubscribePayload) -> RejectOutcome {
		let Some(entry) = self.subs.get_mut(key) else {
			return RejectOutcome::Untracked;
		};
		entry.attempts += 1;
		if entry.attempts < MAX_SUBSCRIBE_ATTEMPTS {
			RejectOutcome::Retry { attempt: entry.attempts }
		} else {
			let entry = self.subs.remove(key).unwrap_or_default();
			if let Some(id) = entry.upstream_id {
				self.by_upstream_id.remove(&id);
			}
			metrics::gauge!("emotesync_subscriptions_tracked").set(self.subs.len() as f64);
			RejectOutcome::Surface {
				ports: entry.subscribers.into_iter().collect(),
			}
		}
	}

	/// Keys to replay after a reconnect: exactly one per tracked record,
	/// regardless of subscriber count. Confirmation state is reset because
	/// server-assigned ids do not survive a new session.
	pub fn replay_keys(&mut self) -> Vec<SubscribePayload> {
		self.by_upstream_id.clear();
		for entry in self.subs.values_mut() {
			entry.confirmed = false;
			entry.upstream_id = None;
			entry.attempts = 0;
		}
		self.subs.keys().cloned().collect()
	}

	/// Resolve a DISPATCH match-list entry to the local record it refers to.
	pub fn resolve_match(&self, upstream_id: &str) -> Option<&SubscribePayload> {
		self.by_upstream_id.get(upstream_id)
	}

	/// Ports currently subscribed to `key`.
	pub fn ports_for(&self, key: &SubscribePayload) -> Vec<PortId> {
		self.subs
			.get(key)
			.map(|s| s.subscribers.iter().copied().collect())
			.unwrap_or_default()
	}

	pub fn record(&self, key: &SubscribePayload) -> Option<&Subscription> {
		self.subs.get(key)
	}

	pub fn len(&self) -> usize {
		self.subs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.subs.is_empty()
	}
}
