// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use thiserror::Error;
use url::Url;
use warren_common::SecretString;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("missing environment variable: {0}")]
	MissingEnv(String),

	#[error("parse error: {0}")]
	Parse(String),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
	pub control_url: Url,
	pub api_key: SecretString,
	pub wireguard_private_key: Option<String>,
	pub state_dir: PathBuf,
	pub docker_enabled: bool,
}

impl AgentConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		let control_url: Url = std::env::var("CONTROL_URL")
			.map_err(|_| ConfigError::MissingEnv("CONTROL_URL".to_string()))?
			.parse()
			.map_err(|e| ConfigError::Parse(format!("invalid CONTROL_URL: {e}")))?;

		let api_key = std::env::var("API_KEY")
			.map_err(|_| ConfigError::MissingEnv("API_KEY".to_string()))
			.map(SecretString::new)?;

		let wireguard_private_key = std::env::var("WIREGUARD_PRIVATE_KEY").ok();

		let state_dir = match std::env::var("WARREN_STATE_DIR") {
			Ok(dir) => PathBuf::from(dir),
			Err(_) => default_state_dir()?,
		};

		let docker_enabled = std::env::var("DOCKER_ENABLED")
			.map(|v| v == "1" || v.to_lowercase() == "true")
			.unwrap_or(false);

		Ok(Self {
			control_url,
			api_key,
			wireguard_private_key,
			state_dir,
			docker_enabled,
		})
	}
}

pub fn default_state_dir() -> Result<PathBuf, ConfigError> {
	dirs::home_dir()
		.map(|home| home.join(".warren"))
		.ok_or_else(|| ConfigError::Parse("failed to determine home directory".to_string()))
}
