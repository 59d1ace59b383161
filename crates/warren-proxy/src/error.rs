// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("failed to bind listener: {0}")]
	Bind(std::io::Error),

	#[error("server error: {0}")]
	Serve(std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
