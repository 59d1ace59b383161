// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ControlError, Result};
use crate::session::ControlSession;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, instrument};
use url::Url;
use warren_common::{ClientType, ControlMessage, SecretString};

/// How long Control gets to answer the `auth` frame.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ControlConfig {
	pub url: Url,
	pub api_key: SecretString,
	pub client_type: ClientType,
	pub public_key: Option<String>,
}

/// Connects to Control and completes the authentication handshake.
///
/// The client sends `auth` and then reads exactly one protocol frame under
/// a 10-second deadline: `auth_success` yields a steady-state session,
/// `auth_error` surfaces the rejection, anything else is a handshake
/// failure. The deadline is cleared before steady state; no further read
/// deadlines are imposed.
#[instrument(skip(config), fields(url = %config.url, client_type = %config.client_type))]
pub async fn connect<T>(config: ControlConfig) -> Result<ControlSession<T>>
where
	T: DeserializeOwned + Serialize + Send + 'static,
{
	info!("connecting to control");

	let (mut ws, _) = connect_async(config.url.as_str())
		.await
		.map_err(ControlError::Connect)?;

	let auth: ControlMessage<T> = ControlMessage::auth(
		config.api_key.expose().to_string(),
		config.client_type,
		config.public_key.clone(),
	);
	ws.send(Message::Text(auth.to_json()?))
		.await
		.map_err(ControlError::Transport)?;

	let response = tokio::time::timeout(HANDSHAKE_DEADLINE, read_protocol_frame(&mut ws))
		.await
		.map_err(|_| ControlError::HandshakeTimeout)??;

	match ControlMessage::<T>::from_json(&response)? {
		ControlMessage::AuthSuccess {
			client_id,
			client_type,
			..
		} => {
			info!(%client_id, ?client_type, "authenticated with control");
			Ok(ControlSession::new(ws))
		}
		ControlMessage::AuthError { error, .. } => Err(ControlError::AuthRejected(error)),
		other => Err(ControlError::UnexpectedFrame(other.type_name().to_string())),
	}
}

/// Reads the next protocol (text) frame, letting transport-level control
/// frames pass underneath.
async fn read_protocol_frame(
	ws: &mut tokio_tungstenite::WebSocketStream<
		tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
	>,
) -> Result<String> {
	loop {
		match ws.next().await {
			Some(Ok(Message::Text(text))) => return Ok(text),
			Some(Ok(Message::Ping(data))) => {
				debug!("answering transport ping during handshake");
				ws.send(Message::Pong(data))
					.await
					.map_err(ControlError::Transport)?;
			}
			Some(Ok(Message::Pong(_))) => {}
			Some(Ok(Message::Close(_))) | None => return Err(ControlError::ConnectionClosed),
			Some(Ok(other)) => {
				return Err(ControlError::UnexpectedFrame(format!("{:?}", other)));
			}
			Some(Err(e)) => return Err(ControlError::Transport(e)),
		}
	}
}
