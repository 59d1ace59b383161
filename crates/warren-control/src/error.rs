// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
	#[error("failed to connect to control: {0}")]
	Connect(tokio_tungstenite::tungstenite::Error),

	#[error("authentication rejected: {0}")]
	AuthRejected(String),

	#[error("no auth response within the handshake deadline")]
	HandshakeTimeout,

	#[error("unexpected frame during handshake: {0}")]
	UnexpectedFrame(String),

	#[error("malformed frame: {0}")]
	Protocol(#[from] serde_json::Error),

	#[error("transport error: {0}")]
	Transport(tokio_tungstenite::tungstenite::Error),

	#[error("control closed the connection")]
	ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ControlError>;
