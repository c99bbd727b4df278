#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};


/// Role of this process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	/// Owner of the single upstream connection.
	Primary,
	Secondary,
}

/// How the primary is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMode {
	/// One shared process per deployment: unconditionally primary, no
	/// election traffic. The default.
	Single,
	/// Id-max voting between independent instances.
	Vote,
}

/// Messages exchanged between peer instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
	State(PeerState),
	Ping { from: u64 },
	Pong { from: u64 },
}

/// One instance's broadcast state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
	pub id: u64,
	pub online: bool,
	pub primary: bool,
	pub primary_vote: Option<u64>,
}

/// Transport between peer instances.
#[async_trait]
pub trait PeerBus: Send {
	async fn broadcast(&mut self, msg: PeerMessage);
	/// Next message from another peer; `None` when the bus is gone.
	async fn recv(&mut self) -> Option<PeerMessage>;
}

/// In-process peer bus for tests and embedded multi-instance setups.
#[derive(Debug, Clone)]
pub struct LocalBusNetwork {
	tx: broadcast::Sender<(u64, PeerMessage)>,
}

impl LocalBusNetwork {
	pub fn new() -> Self {
		let (tx, _) = broadcast::channel(256);
		Self { tx }
	}

	pub fn join(&self, id: u64) -> LocalPeerBus {
		LocalPeerBus {
			id,
			tx: self.tx.clone(),
			rx: self.tx.subscribe(),
		}
	}
}

impl Default for LocalBusNetwork {
	fn default() -> Self {
		Self::new()
	}
}

pub struct LocalPeerBus {
	id: u64,
	tx: broadcast::Sender<(u64, PeerMessage)>,
	rx: broadcast::Receiver<(u64, PeerMessage)>,
}

#[async_trait]
impl PeerBus for LocalPeerBus {
	async fn broadcast(&mut self, msg: PeerMessage) {
		let _ = self.tx.send((self.id, msg));
	}

	async fn recv(&mut self) -> Option<PeerMessage> {
		loop {
			match self.rx.recv().await {
				Ok((from, _)) if from == self.id => continue,
				Ok((_, msg)) => return Some(msg),
				Err(broadcast::error::RecvError::Lagged(n)) => {
					warn!(dropped = n, "peer bus lagged");
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}
}

/// Election intervals; compressed in tests.
#[derive(Debug, Clone)]
pub struct ElectionTiming {
	/// Debounce before the election timer fires.
	pub election_delay: Duration,
	/// Re-run delay while the vote set is incomplete.
	pub revote_delay: Duration,
	/// Liveness ping broadcast interval.
	pub ping_interval: Duration,
}

impl Default for ElectionTiming {
	fn default() -> Self {
		Self {
			election_delay: Duration::from_secs(1),
			revote_delay: Duration::from_millis(500),
			ping_interval: Duration::from_millis(6_000),
		}
	}
}

impl ElectionTiming {
	/// A peer silent for longer than this is evicted (1.25x ping interval).
	pub fn eviction_timeout(&self) -> Duration {
		self.ping_interval + self.ping_interval / 4
	}

	/// Millisecond-scale timing for tests.
	pub fn fast() -> Self {
		Self {
			election_delay: Duration::from_millis(40),
			revote_delay: Duration::from_millis(20),
			ping_interval: Duration::from_millis(60),
		}
	}
}

/// One tracked peer instance.
#[derive(Debug, Clone)]
pub struct PeerInstance {
	pub id: u64,
	pub online: bool,
	pub primary: bool,
	pub primary_vote: Option<u64>,
	pub last_seen_at: Instant,
}

/// Outcome of one election timer expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	Primary,
	Secondary,
	/// Vote set incomplete: rebroadcast our ballot and re-run.
	Revote { ballot: u64 },
}

/// Result of a liveness sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EvictReport {
	pub evicted: Vec<u64>,
	pub primary_lost: bool,
}

/// The voting state machine, free of timers and transport.
///
/// Owns the `PeerInstance` records. The invariant it converges to: exactly
/// one online peer has `primary = true` when at least one is online.
#[derive(Debug)]
pub struct ElectionState {
	self_id: u64,
	peers: HashMap<u64, PeerInstance>,
}

impl ElectionState {
	pub fn new(self_id: u64, now: Instant) -> Self {
		let mut peers = HashMap::new();
		peers.insert(
			self_id,
			PeerInstance {
				id: self_id,
				online: true,
				primary: false,
				primary_vote: None,
				last_seen_at: now,
			},
		);
		Self { self_id, peers }
	}

	pub fn self_state(&self) -> PeerState {
		let me = &self.peers[&self.self_id];
		PeerState {
			id: me.id,
			online: me.online,
			primary: me.primary,
			primary_vote: me.primary_vote,
		}
	}

	pub fn is_primary(&self) -> bool {
		self.peers[&self.self_id].primary
	}

	pub fn peer_count(&self) -> usize {
		self.peers.len()
	}

	/// Record a STATE broadcast from another peer. Returns `true` when the
	/// observation changed the peer set or a peer's claim; a repeat of an
	/// already-known state only refreshes liveness.
	pub fn observe(&mut self, st: PeerState, now: Instant) -> bool {
		if st.id == self.self_id {
			return false;
		}
		if !st.online {
			return self.peers.remove(&st.id).is_some();
		}
		if let Some(existing) = self.peers.get_mut(&st.id) {
			let changed = existing.primary != st.primary || existing.primary_vote != st.primary_vote;
			existing.primary = st.primary;
			existing.primary_vote = st.primary_vote;
			existing.last_seen_at = now;
			return changed;
		}
		self.peers.insert(
			st.id,
			PeerInstance {
				id: st.id,
				online: true,
				primary: st.primary,
				primary_vote: st.primary_vote,
				last_seen_at: now,
			},
		);
		true
	}

	/// Refresh a peer's liveness (PONG or any traffic).
	pub fn touch(&mut self, id: u64, now: Instant) {
		if let Some(peer) = self.peers.get_mut(&id) {
			peer.last_seen_at = now;
		}
	}

	/// Id of the online peer currently claiming primary, if any. Concurrent
	/// claims resolve to the highest id; the others step down.
	pub fn known_primary(&self) -> Option<u64> {
		self.peers.values().filter(|p| p.online && p.primary).map(|p| p.id).max()
	}

	fn mark_self_primary(&mut self, primary: bool) {
		if let Some(me) = self.peers.get_mut(&self.self_id) {
			me.primary = primary;
		}
	}

	/// Run the election step after the timer fires.
	pub fn decide(&mut self) -> Decision {
		if let Some(primary) = self.known_primary() {
			if primary == self.self_id {
				return Decision::Primary;
			}
			self.mark_self_primary(false);
			return Decision::Secondary;
		}

		// Sole instance: primary unconditionally.
		if self.peers.len() == 1 {
			self.mark_self_primary(true);
			return Decision::Primary;
		}

		// Vote for the numerically highest id observed.
		let ballot = self.peers.keys().copied().max().unwrap_or(self.self_id);
		if let Some(me) = self.peers.get_mut(&self.self_id) {
			me.primary_vote = Some(ballot);
		}

		let votes_complete = self.peers.values().all(|p| p.primary_vote.is_some());
		if !votes_complete {
			return Decision::Revote { ballot };
		}

		let max_vote = self.peers.values().filter_map(|p| p.primary_vote).max().unwrap_or(ballot);
		if max_vote == self.self_id {
			self.mark_self_primary(true);
			Decision::Primary
		} else {
			self.mark_self_primary(false);
			Decision::Secondary
		}
	}

	/// Evict peers silent for longer than `timeout`.
	pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> EvictReport {
		let stale: Vec<u64> = self
			.peers
			.values()
			.filter(|p| p.id != self.self_id && now.duration_since(p.last_seen_at) > timeout)
			.map(|p| p.id)
			.collect();

		let mut report = EvictReport::default();
		for id in stale {
			if let Some(peer) = self.peers.remove(&id) {
				if peer.primary {
					report.primary_lost = true;
				}
				report.evicted.push(id);
			}
		}
		// A shrunk peer set invalidates collected ballots.
		if !report.evicted.is_empty() {
			for peer in self.peers.values_mut() {
				peer.primary_vote = None;
			}
		}
		report
	}
}

/// Handle on a spawned election coordinator.
pub struct ElectionHandle {
	role_rx: watch::Receiver<Role>,
	task: Option<tokio::task::JoinHandle<()>>,
}

impl ElectionHandle {
	pub fn role_rx(&self) -> watch::Receiver<Role> {
		self.role_rx.clone()
	}

	pub fn role(&self) -> Role {
		*self.role_rx.borrow()
	}

	/// Abort the coordinator task; peers will evict this instance.
	pub fn abort(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

/// Start the election coordinator.
///
/// `Single` mode resolves immediately: the lone worker is primary and no
/// election traffic is generated.
pub fn spawn_election(
	mode: ElectionMode,
	instance_id: u64,
	bus: impl PeerBus + 'static,
	timing: ElectionTiming,
) -> ElectionHandle {
	match mode {
		ElectionMode::Single => {
			info!("single-process mode: this instance is primary");
			let (_role_tx, role_rx) = watch::channel(Role::Primary);
			// Keep the sender alive for the life of the process.
			let task = tokio::spawn(async move {
				let _role_tx = _role_tx;
				std::future::pending::<()>().await;
			});
			ElectionHandle {
				role_rx,
				task: Some(task),
			}
		}
		ElectionMode::Vote => {
			let (role_tx, role_rx) = watch::channel(Role::Secondary);
			let task = tokio::spawn(run_election(instance_id, bus, timing, role_tx));
			ElectionHandle {
				role_rx,
				task: Some(task),
			}
		}
	}
}

async fn run_election(
	self_id: u64,
	mut bus: impl PeerBus,
	timing: ElectionTiming,
	role_tx: watch::Sender<Role>,
) {
	// Elections never fail terminally; lack of convergence only delays the
	// upstream connection.
	let far_future = Duration::from_secs(3_600);
	let mut state = ElectionState::new(self_id, Instant::now());

	bus.broadcast(PeerMessage::State(state.self_state())).await;
	let mut election_deadline = Instant::now() + timing.election_delay;

	let mut ping = tokio::time::interval(timing.ping_interval);
	ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			msg = bus.recv() => {
				let Some(msg) = msg else {
					debug!(self_id, "peer bus closed; election coordinator exiting");
					return;
				};
				match msg {
					PeerMessage::State(st) => {
						let had_primary = state.known_primary();
						let changed = state.observe(st, Instant::now());
						// Debounced election: only a STATE that changed the
						// peer set re-arms the timer. Repeats of a standing
						// ballot must not starve peers whose timers are
						// about to fire.
						if changed {
							election_deadline = Instant::now() + timing.election_delay;
						}
						if had_primary == Some(st.id) && !st.online {
							// Graceful primary shutdown: re-elect now.
							election_deadline = Instant::now();
						}
					}
					PeerMessage::Ping { from } => {
						state.touch(from, Instant::now());
						bus.broadcast(PeerMessage::Pong { from: self_id }).await;
					}
					PeerMessage::Pong { from } => {
						state.touch(from, Instant::now());
					}
				}
			}

			_ = tokio::time::sleep_until(election_deadline) => {
				match state.decide() {
					Decision::Primary => {
						if *role_tx.borrow() != Role::Primary {
							info!(self_id, peers = state.peer_count(), "elected primary");
						}
						if role_tx.send(Role::Primary).is_err() {
							return;
						}
						bus.broadcast(PeerMessage::State(state.self_state())).await;
						election_deadline = Instant::now() + far_future;
					}
					Decision::Secondary => {
						if role_tx.send(Role::Secondary).is_err() {
							return;
						}
						// Late joiners still need this instance's ballot to
						// complete their vote set.
						bus.broadcast(PeerMessage::State(state.self_state())).await;
						election_deadline = Instant::now() + far_future;
					}
					Decision::Revote { ballot } => {
						debug!(self_id, ballot, "vote set incomplete; revoting");
						bus.broadcast(PeerMessage::State(state.self_state())).await;
						election_deadline = Instant::now() + timing.revote_delay;
					}
				}
			}

			_ = ping.tick() => {
				bus.broadcast(PeerMessage::Ping { from: self_id }).await;
				let report = state.evict_stale(Instant::now(), timing.eviction_timeout());
				if !report.evicted.is_empty() {
					info!(self_id, evicted = ?report.evicted, primary_lost = report.primary_lost, "evicted silent peers");
					// Re-run the election excluding the evicted peers.
					if report.primary_lost || state.known_primary().is_none() {
						election_deadline = Instant::now();
					}
				}
			}
		}
	}
}
