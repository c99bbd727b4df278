#![forbid(unsafe_code)]

use std::time::Duration;

use emotesync_protocol::upstream::{AckPayload, DispatchPayload, ErrorPayload, Frame, HelloPayload, Opcode};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::election::Role;
use crate::upstream::backoff::Backoff;

pub mod backoff;


/// Delay before a send against a non-open socket is retried.
pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
	/// Upstream event WebSocket URL.
	pub url: String,
	/// Heartbeat interval used until HELLO advertises one.
	pub heartbeat_fallback: Duration,
}

/// Commands accepted by the connection manager task.
#[derive(Debug)]
pub enum UpstreamCommand {
	Send(Frame),
}

/// Events emitted by the connection manager task.
#[derive(Debug)]
pub enum UpstreamEvent {
	/// Handshake complete; subscriptions must be replayed.
	Ready(HelloPayload),
	Dispatch(DispatchPayload),
	Ack(AckPayload),
	ServerError(ErrorPayload),
	Closed,
}

/// Cloneable handle for sending frames upstream.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
	cmd_tx: mpsc::UnboundedSender<UpstreamCommand>,
}

impl UpstreamHandle {
	pub fn send(&self, frame: Frame) {
		let _ = self.cmd_tx.send(UpstreamCommand::Send(frame));
	}
}

/// Detached handle whose command stream is read directly, without a socket.
#[cfg(test)]
pub(crate) fn detached_handle() -> (UpstreamHandle, mpsc::UnboundedReceiver<UpstreamCommand>) {
	let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
	(UpstreamHandle { cmd_tx }, cmd_rx)
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Spawn the connection manager task.
///
/// Only the PRIMARY instance holds a live socket; the task idles while the
/// role watch reads `Secondary` and closes the socket if the role is lost.
pub fn spawn_connection_manager(
	cfg: ConnectionConfig,
	role_rx: watch::Receiver<Role>,
	events_tx: mpsc::UnboundedSender<UpstreamEvent>,
) -> UpstreamHandle {
	let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
	let handle = UpstreamHandle { cmd_tx: cmd_tx.clone() };
	tokio::spawn(run_connection(cfg, cmd_tx, cmd_rx, role_rx, events_tx));
	handle
}

async fn run_connection(
	cfg: ConnectionConfig,
	cmd_tx: mpsc::UnboundedSender<UpstreamCommand>,
	mut cmd_rx: mpsc::UnboundedReceiver<UpstreamCommand>,
	mut role_rx: watch::Receiver<Role>,
	events_tx: mpsc::UnboundedSender<UpstreamEvent>,
) {
	let mut backoff = Backoff::new();
	let mut last_session: Option<String> = None;

	'reconnect: loop {
		while *role_rx.borrow() != Role::Primary {
			tokio::select! {
				changed = role_rx.changed() => {
					if changed.is_err() {
						return;
					}
				}
				cmd = cmd_rx.recv() => {
					match cmd {
						None => return,
						Some(UpstreamCommand::Send(frame)) => defer_send(&cmd_tx, frame),
					}
				}
			}
		}

		info!(url = %cfg.url, "connecting upstream");
		metrics::counter!("emotesync_upstream_connect_attempts_total").increment(1);

		let (mut ws, _) = match tokio_tungstenite::connect_async(&cfg.url).await {
			Ok(result) => result,
			Err(err) => {
				let delay = backoff.next_delay();
				warn!(error = %err, delay_ms = delay.as_millis() as u64, "upstream connect failed");
				tokio::time::sleep(delay).await;
				continue;
			}
		};

		// Best-effort session resume; the registry replays its
		// subscriptions on the HELLO either way.
		if let Some(session_id) = &last_session {
			debug!(%session_id, "resuming previous upstream session");
			let _ = send_frame(&mut ws, &Frame::resume(session_id)).await;
		}

		let mut session: Option<HelloPayload> = None;
		let mut heartbeat = tokio::time::interval(cfg.heartbeat_fallback);
		heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				changed = role_rx.changed() => {
					if changed.is_err() || *role_rx.borrow() != Role::Primary {
						info!("primary role lost; closing upstream socket");
						let _ = ws.close(None).await;
						let _ = events_tx.send(UpstreamEvent::Closed);
						continue 'reconnect;
					}
				}

				cmd = cmd_rx.recv() => {
					let Some(UpstreamCommand::Send(frame)) = cmd else {
						return;
					};
					if send_frame(&mut ws, &frame).await.is_err() {
						// Socket died mid-send; queue the frame for the next session.
						defer_send(&cmd_tx, frame);
						break;
					}
				}

				_ = heartbeat.tick() => {
					if session.is_some() && send_frame(&mut ws, &Frame::heartbeat()).await.is_err() {
						break;
					}
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						warn!("upstream websocket closed");
						break;
					};
					match msg {
						Ok(Message::Text(text)) => {
							match serde_json::from_str::<Frame>(&text) {
								Ok(frame) => {
									if handle_frame(frame, &mut session, &mut last_session, &mut heartbeat, &mut backoff, &events_tx) {
										break;
									}
								}
								Err(err) => {
									// Malformed frame: drop it, keep the connection.
									warn!(error = %err, "malformed upstream frame dropped");
									metrics::counter!("emotesync_upstream_protocol_errors_total").increment(1);
								}
							}
						}
						Ok(Message::Close(frame)) => {
							warn!(?frame, "upstream websocket closed by server");
							break;
						}
						Ok(_) => {}
						Err(err) => {
							warn!(error = %err, "upstream websocket error");
							break;
						}
					}
				}
			}
		}

		let _ = events_tx.send(UpstreamEvent::Closed);
		let delay = backoff.next_delay();
		warn!(delay_ms = delay.as_millis() as u64, "upstream closed; reconnecting after backoff");
		metrics::counter!("emotesync_upstream_disconnects_total").increment(1);
		tokio::time::sleep(delay).await;
	}
}

/// Handle one decoded frame. Returns `true` when the connection must cycle.
fn handle_frame(
	frame: Frame,
	session: &mut Option<HelloPayload>,
	last_session: &mut Option<String>,
	heartbeat: &mut tokio::time::Interval,
	backoff: &mut Backoff,
	events_tx: &mpsc::UnboundedSender<UpstreamEvent>,
) -> bool {
	match frame.opcode() {
		Opcode::Hello => match frame.payload::<HelloPayload>() {
			Ok(hello) => {
				info!(session_id = %hello.session_id, heartbeat_ms = hello.heartbeat_interval, "upstream hello");
				let mut interval =
					tokio::time::interval(Duration::from_millis(hello.heartbeat_interval.max(1_000)));
				interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
				*heartbeat = interval;
				*session = Some(hello.clone());
				*last_session = Some(hello.session_id.clone());
				backoff.reset();
				let _ = events_tx.send(UpstreamEvent::Ready(hello));
				false
			}
			Err(err) => {
				warn!(error = %err, "malformed HELLO payload dropped");
				false
			}
		},
		Opcode::Dispatch => match frame.payload::<DispatchPayload>() {
			Ok(dispatch) => {
				let _ = events_tx.send(UpstreamEvent::Dispatch(dispatch));
				false
			}
			Err(err) => {
				warn!(error = %err, "malformed DISPATCH payload dropped");
				metrics::counter!("emotesync_upstream_protocol_errors_total").increment(1);
				false
			}
		},
		Opcode::Ack => match frame.payload::<AckPayload>() {
			Ok(ack) => {
				let _ = events_tx.send(UpstreamEvent::Ack(ack));
				false
			}
			Err(err) => {
				warn!(error = %err, "malformed ACK payload dropped");
				false
			}
		},
		Opcode::Error => {
			let payload = frame.payload::<ErrorPayload>().unwrap_or_else(|_| ErrorPayload {
				message: "unparseable error payload".to_string(),
				data: frame.d.clone(),
			});
			warn!(message = %payload.message, "upstream error frame");
			let _ = events_tx.send(UpstreamEvent::ServerError(payload));
			false
		}
		Opcode::Heartbeat => {
			debug!("upstream heartbeat");
			false
		}
		Opcode::Reconnect => {
			warn!("upstream requested reconnect");
			true
		}
		Opcode::EndOfStream => {
			warn!("upstream end of stream");
			true
		}
		Opcode::Identify | Opcode::Resume | Opcode::Subscribe | Opcode::Unsubscribe | Opcode::Bridge => {
			debug!(op = frame.op, "client-direction opcode from server ignored");
			false
		}
		Opcode::Unknown(op) => {
			warn!(op, "unknown upstream opcode; frame dropped");
			false
		}
	}
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<(), ()> {
	let text = match serde_json::to_string(frame) {
		Ok(text) => text,
		Err(err) => {
			warn!(error = %err, "failed to encode upstream frame");
			return Ok(());
		}
	};
	ws.send(Message::Text(text.into())).await.map_err(|err| {
		warn!(error = %err, "upstream send failed");
	})
}

/// Requeue a frame after [`SEND_RETRY_DELAY`]; sends never fail, they wait
/// for the socket to come back.
fn defer_send(cmd_tx: &mpsc::UnboundedSender<UpstreamCommand>, frame: Frame) {
	let tx = cmd_tx.clone();
	tokio::spawn(async move {
		tokio::time::sleep(SEND_RETRY_DELAY).await;
		let _ = tx.send(UpstreamCommand::Send(frame));
	});
}
