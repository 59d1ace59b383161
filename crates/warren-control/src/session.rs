// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ControlError, Result};
use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};
use warren_common::{ControlMessage, NodeStatus};

/// Liveness cadence: `status_update{online}` every 30 seconds.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Transport keepalive: a WebSocket ping from the writer every 54 seconds.
const TRANSPORT_PING_INTERVAL: Duration = Duration::from_secs(54);

/// Outbound queue depth shared by heartbeat, acks and pongs.
const OUTBOUND_QUEUE_SIZE: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Applies a topology snapshot. Implemented by the supervisor.
///
/// Application is serialized: the session never calls `apply` concurrently,
/// and the acknowledgement for a snapshot is sent only after `apply`
/// returns.
#[async_trait]
pub trait SnapshotHandler<T>: Send + Sync {
	async fn apply(&self, snapshot: T) -> anyhow::Result<()>;
}

/// An authenticated control session ready to enter steady state.
pub struct ControlSession<T> {
	ws: WsStream,
	_marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for ControlSession<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ControlSession").finish_non_exhaustive()
	}
}

impl<T> ControlSession<T>
where
	T: DeserializeOwned + Serialize + Send + 'static,
{
	pub(crate) fn new(ws: WsStream) -> Self {
		Self {
			ws,
			_marker: std::marker::PhantomData,
		}
	}

	/// Runs the session until the transport fails, Control closes, or
	/// `shutdown` fires. Three flows cooperate on the one connection: this
	/// reader, a writer draining the outbound queue, and a heartbeat.
	#[instrument(skip_all)]
	pub async fn run(
		self,
		handler: Arc<dyn SnapshotHandler<T>>,
		mut shutdown: watch::Receiver<bool>,
	) -> Result<()> {
		let (sink, stream) = self.ws.split();
		let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_SIZE);

		// Session-local cancellation: when the reader exits, the writer and
		// heartbeat follow.
		let (done_tx, done_rx) = watch::channel(false);

		let writer = tokio::spawn(run_writer(sink, outbound_rx, done_rx.clone()));
		let heartbeat = tokio::spawn(run_heartbeat::<T>(outbound_tx.clone(), done_rx));

		let result = read_loop(stream, handler, &outbound_tx, &mut shutdown).await;

		let _ = done_tx.send(true);
		drop(outbound_tx);
		let _ = heartbeat.await;
		let _ = writer.await;

		info!("control session ended");
		result
	}
}

async fn read_loop<T>(
	mut stream: SplitStream<WsStream>,
	handler: Arc<dyn SnapshotHandler<T>>,
	outbound: &mpsc::Sender<Message>,
	shutdown: &mut watch::Receiver<bool>,
) -> Result<()>
where
	T: DeserializeOwned + Serialize + Send + 'static,
{
	loop {
		tokio::select! {
			biased;

			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					info!("control session shutting down");
					return Ok(());
				}
			}

			frame = stream.next() => {
				match frame {
					Some(Ok(Message::Text(text))) => {
						handle_frame(&text, &handler, outbound).await;
					}
					Some(Ok(Message::Ping(data))) => {
						if outbound.send(Message::Pong(data)).await.is_err() {
							return Err(ControlError::ConnectionClosed);
						}
					}
					Some(Ok(Message::Pong(_))) => {}
					Some(Ok(Message::Close(_))) | None => {
						return Err(ControlError::ConnectionClosed);
					}
					Some(Ok(_)) => {
						warn!("ignoring non-text frame from control");
					}
					Some(Err(e)) => {
						return Err(ControlError::Transport(e));
					}
				}
			}
		}
	}
}

async fn handle_frame<T>(
	text: &str,
	handler: &Arc<dyn SnapshotHandler<T>>,
	outbound: &mpsc::Sender<Message>,
) where
	T: DeserializeOwned + Serialize + Send + 'static,
{
	let message = match ControlMessage::<T>::from_json(text) {
		Ok(message) => message,
		Err(e) => {
			// Unknown type and malformed JSON both land here; neither may
			// take the session down.
			let kind = serde_json::from_str::<serde_json::Value>(text)
				.ok()
				.and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from));
			match kind {
				Some(kind) => warn!(msg_type = %kind, error = %e, "dropping unrecognized message"),
				None => warn!(error = %e, "dropping malformed frame"),
			}
			return;
		}
	};

	debug!(msg_type = message.type_name(), "received message");

	match message {
		ControlMessage::Ping { .. } => {
			let pong: ControlMessage<T> = ControlMessage::pong();
			queue(outbound, pong).await;
		}
		ControlMessage::ConfigUpdate { config, .. } => {
			info!("received configuration update");

			// Serialized by construction: the reader does not consume the
			// next frame until apply returns, and the ack carries the
			// outcome of exactly this snapshot.
			let result = handler.apply(config).await;
			if let Err(ref e) = result {
				error!(error = %e, "failed to apply configuration");
			}

			let ack: ControlMessage<T> =
				ControlMessage::config_ack(result.map_err(|e| e.to_string()));
			queue(outbound, ack).await;
		}
		ControlMessage::Error { error, .. } => {
			error!(%error, "error from control");
		}
		other => {
			warn!(msg_type = other.type_name(), "unexpected message in steady state");
		}
	}
}

/// Best-effort enqueue: a full or closed queue is logged, never fatal.
async fn queue<T: Serialize>(outbound: &mpsc::Sender<Message>, message: ControlMessage<T>) {
	match message.to_json() {
		Ok(text) => {
			if outbound.send(Message::Text(text)).await.is_err() {
				warn!(msg_type = message.type_name(), "outbound queue closed, dropping message");
			}
		}
		Err(e) => {
			warn!(error = %e, "failed to serialize outbound message");
		}
	}
}

/// Drains the outbound queue and keeps the transport warm with periodic
/// pings.
async fn run_writer<S>(
	mut sink: S,
	mut outbound: mpsc::Receiver<Message>,
	mut done: watch::Receiver<bool>,
) where
	S: Sink<Message> + Unpin,
	S::Error: std::fmt::Display,
{
	let mut ping_timer = tokio::time::interval(TRANSPORT_PING_INTERVAL);
	ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	// The first tick of an interval fires immediately.
	ping_timer.tick().await;

	loop {
		tokio::select! {
			biased;

			_ = done.changed() => {
				if *done.borrow() {
					break;
				}
			}

			message = outbound.recv() => {
				match message {
					Some(message) => {
						if let Err(e) = sink.send(message).await {
							error!(error = %e, "control write error");
							break;
						}
					}
					None => break,
				}
			}

			_ = ping_timer.tick() => {
				if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
					debug!(error = %e, "transport ping failed");
					break;
				}
			}
		}
	}

	let _ = sink.close().await;
}

/// Emits `status_update{online}` every 30 seconds.
async fn run_heartbeat<T>(outbound: mpsc::Sender<Message>, mut done: watch::Receiver<bool>)
where
	T: Serialize,
{
	let mut timer = tokio::time::interval(HEARTBEAT_INTERVAL);
	timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	timer.tick().await;

	loop {
		tokio::select! {
			biased;

			_ = done.changed() => {
				if *done.borrow() {
					break;
				}
			}

			_ = timer.tick() => {
				let status: ControlMessage<T> = ControlMessage::status(NodeStatus::Online);
				queue(&outbound, status).await;
			}
		}
	}
}
