#![forbid(unsafe_code)]

//! End-to-end smoke test: a real port client and a fake upstream server
//! around the full worker wiring.

use std::sync::Arc;
use std::time::Duration;

use emotesync_domain::{
	Channel, ChannelId, Cosmetic, CosmeticId, CosmeticKind, EmoteId, EmoteSet, EmoteSetId, Platform, Provider, Scope,
	UserConnection, UserId, now_unix,
};
use emotesync_protocol::framing::{DEFAULT_MAX_LINE_SIZE, decode_line, encode_line};
use emotesync_protocol::port::{ChannelDelta, PortMessage, StateUpdate};
use emotesync_protocol::upstream::{Frame, Opcode, SubscribePayload};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::cache::Cache;
use crate::context::WorkerContext;
use crate::election::Role;
use crate::loader::{BulkLoader, MemoryBulkLoader};
use crate::ports::PortRegistry;
use crate::upstream::{ConnectionConfig, spawn_connection_manager};

const WAIT: Duration = Duration::from_secs(10);

/// Fake upstream: accepts one socket, sends HELLO, ACKs every SUBSCRIBE and
/// forwards injected frames to the client.
async fn spawn_fake_upstream() -> (String, mpsc::UnboundedReceiver<Frame>, mpsc::UnboundedSender<Frame>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let (seen_tx, seen_rx) = mpsc::unbounded_channel();
	let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<Frame>();

	tokio::spawn(async move {
		let Ok((stream, _)) = listener.accept().await else {
			return;
		};
		let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

		let hello = Frame::new(
			Opcode::Hello,
			json!({"session_id": "sess-1", "heartbeat_interval": 30_000}),
		);
		ws.send(Message::Text(serde_json::to_string(&hello).unwrap().into()))
			.await
			.unwrap();

		loop {
			tokio::select! {
				frame = inject_rx.recv() => {
					let Some(frame) = frame else { break };
					let text = serde_json::to_string(&frame).unwrap();
					if ws.send(Message::Text(text.into())).await.is_err() {
						break;
					}
				}
				msg = ws.next() => {
					let Some(Ok(Message::Text(text))) = msg else { break };
					let frame: Frame = serde_json::from_str(&text).unwrap();
					if frame.opcode() == Opcode::Subscribe {
						let payload: SubscribePayload = frame.payload().unwrap();
						let mut data = serde_json::to_value(&payload).unwrap();
						data["id"] = json!(format!("up-{}", payload.topic));
						let ack = Frame::new(Opcode::Ack, json!({"command": "SUBSCRIBE", "data": data}));
						let _ = ws.send(Message::Text(serde_json::to_string(&ack).unwrap().into())).await;
					}
					let _ = seen_tx.send(frame);
				}
			}
		}
	});

	(format!("ws://{addr}"), seen_rx, inject_tx)
}

struct PortClient {
	lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
	writer: tokio::net::tcp::OwnedWriteHalf,
}

impl PortClient {
	async fn connect(addr: std::net::SocketAddr) -> Self {
		let stream = TcpStream::connect(addr).await.unwrap();
		let (read_half, writer) = stream.into_split();
		Self {
			lines: BufReader::new(read_half).lines(),
			writer,
		}
	}

	async fn send(&mut self, msg: &PortMessage) {
		let line = encode_line(msg, DEFAULT_MAX_LINE_SIZE).unwrap();
		self.writer.write_all(line.as_bytes()).await.unwrap();
	}

	async fn next(&mut self) -> PortMessage {
		let line = tokio::time::timeout(WAIT, self.lines.next_line())
			.await
			.expect("timed out waiting for port message")
			.unwrap()
			.expect("port closed");
		decode_line(&line, DEFAULT_MAX_LINE_SIZE).unwrap()
	}

	/// Read messages until one matches, discarding the rest.
	async fn wait_for(&mut self, mut pred: impl FnMut(&PortMessage) -> bool) -> PortMessage {
		loop {
			let msg = self.next().await;
			if pred(&msg) {
				return msg;
			}
		}
	}
}

fn emote(id: &str, name: &str) -> emotesync_domain::Emote {
	emotesync_domain::Emote {
		id: EmoteId::new(id).unwrap(),
		name: name.to_string(),
		owner: None,
		host: Default::default(),
		timestamp: now_unix(),
	}
}

/// Wait until a SUBSCRIBE has been seen for every `(topic, object_id)`
/// pair. Order-independent, and tolerant of duplicates: a join that lands
/// before HELLO sends its keys once directly and once via session replay.
async fn wait_for_subscribes(seen_rx: &mut mpsc::UnboundedReceiver<Frame>, expected: &[(&str, &str)]) {
	let mut pending: Vec<(&str, &str)> = expected.to_vec();
	let deadline = tokio::time::Instant::now() + WAIT;
	while !pending.is_empty() {
		let frame = tokio::time::timeout_at(deadline, seen_rx.recv())
			.await
			.unwrap_or_else(|_| panic!("timed out; still waiting for SUBSCRIBE {pending:?}"))
			.expect("fake upstream gone");
		if frame.opcode() != Opcode::Subscribe {
			continue;
		}
		let payload: SubscribePayload = frame.payload().unwrap();
		let object_id = payload.condition.get("object_id").map(String::as_str).unwrap_or("");
		pending.retain(|(topic, id)| !(payload.topic == *topic && object_id == *id));
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_end_to_end() {
	let cache = Cache::connect("sqlite::memory:").await.unwrap();

	let loader = Arc::new(MemoryBulkLoader::new());
	let channel_id = ChannelId::new("42").unwrap();
	loader.insert_connection(
		Platform::Twitch,
		channel_id.clone(),
		UserConnection {
			id: UserId::new("u-77").unwrap(),
			platform: Platform::Twitch,
			platform_id: channel_id.clone(),
			username: "streamer".to_string(),
			emote_set_id: Some(EmoteSetId::new("set-active").unwrap()),
		},
	);
	let mut active = EmoteSet::new(EmoteSetId::new("set-active").unwrap(), Provider::SevenTv, Scope::Channel);
	active.emotes = vec![emote("e-1", "Kappa")];
	loader.insert_set(active);
	loader.set_global(EmoteSet::new(
		EmoteSetId::new("set-global").unwrap(),
		Provider::SevenTv,
		Scope::Global,
	));
	loader.set_cosmetics(vec![Cosmetic {
		id: CosmeticId::new("badge-1").unwrap(),
		kind: CosmeticKind::Badge,
		data: json!({}),
		user_ids: vec![],
		timestamp: now_unix(),
	}]);

	let (url, mut seen_rx, inject_tx) = spawn_fake_upstream().await;

	let (_role_tx, role_rx) = watch::channel(Role::Primary);
	let (events_tx, events_rx) = mpsc::unbounded_channel();
	let upstream = spawn_connection_manager(
		ConnectionConfig {
			url,
			heartbeat_fallback: Duration::from_secs(30),
		},
		role_rx,
		events_tx,
	);

	let ports = PortRegistry::new();
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let bind_addr = listener.local_addr().unwrap();
	let (requests_tx, requests_rx) = mpsc::unbounded_channel();
	tokio::spawn(crate::ports::run_port_server(listener, requests_tx));

	let loader: Arc<dyn BulkLoader> = loader;
	let context = WorkerContext::new(cache.clone(), loader, ports, upstream);
	tokio::spawn(context.router().run(events_rx, requests_rx));

	let mut client = PortClient::connect(bind_addr).await;
	let init = client.next().await;
	assert!(matches!(init, PortMessage::Init { .. }), "first message is INIT, got {init:?}");

	// The static catalog follows INIT.
	let catalog = client
		.wait_for(|m| matches!(m, PortMessage::StaticCosmeticsFetched { .. }))
		.await;
	let PortMessage::StaticCosmeticsFetched { cosmetics } = catalog else {
		unreachable!();
	};
	assert_eq!(cosmetics.len(), 1);
	assert_eq!(cosmetics[0].id.as_str(), "badge-1");

	client
		.send(&PortMessage::State {
			state: StateUpdate {
				platform: Some(Platform::Twitch),
				channel: Some(ChannelDelta::Add {
					channel: Channel::new(channel_id.clone(), Platform::Twitch),
					refetch: false,
				}),
				..StateUpdate::default()
			},
		})
		.await;

	let fetched = client
		.wait_for(|m| matches!(m, PortMessage::ChannelFetched { .. }))
		.await;
	let PortMessage::ChannelFetched { channel } = fetched else {
		unreachable!();
	};
	assert_eq!(channel.id, channel_id);
	assert!(channel.set_ids.contains(&EmoteSetId::new("set-active").unwrap()));
	assert!(channel.set_ids.contains(&EmoteSetId::new("set-global").unwrap()));

	// The join collapsed into upstream subscriptions on the live socket.
	wait_for_subscribes(&mut seen_rx, &[("emote_set.*", "set-active"), ("user.*", "u-77")]).await;

	// A pushed emote flows through the applier into the cache and out to
	// the client.
	inject_tx
		.send(Frame::new(
			Opcode::Dispatch,
			json!({
				"type": "emote_set.update",
				"body": {
					"id": "set-active",
					"pushed": [{
						"key": "emotes",
						"value": serde_json::to_value(emote("e-2", "PogChamp")).unwrap(),
					}],
				},
			}),
		))
		.unwrap();

	let updated = client
		.wait_for(|m| matches!(m, PortMessage::EmoteSetUpdated { set_id, .. } if set_id.as_str() == "set-active"))
		.await;
	assert!(matches!(updated, PortMessage::EmoteSetUpdated { .. }));

	let stored = cache
		.get_emote_set(&EmoteSetId::new("set-active").unwrap())
		.await
		.unwrap()
		.unwrap();
	let names: Vec<&str> = stored.emotes.iter().map(|e| e.name.as_str()).collect();
	assert!(names.contains(&"PogChamp"), "pushed emote persisted, got {names:?}");
}
