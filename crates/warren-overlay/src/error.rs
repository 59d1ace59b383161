// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
	#[error("device error: {0}")]
	Device(String),

	#[error("overlay device is closed")]
	Closed,

	#[error("no endpoint known for peer {0}")]
	NoEndpoint(String),

	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error("`{command}` failed: {stderr}")]
	CommandFailed { command: String, stderr: String },
}

pub type Result<T> = std::result::Result<T, OverlayError>;
