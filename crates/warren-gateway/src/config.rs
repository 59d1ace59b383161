// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use thiserror::Error;
use url::Url;
use warren_common::SecretString;

/// Placeholder contact that keeps TLS off until an operator sets a real one.
pub const DEFAULT_ACME_EMAIL: &str = "admin@example.com";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("missing environment variable: {0}")]
	MissingEnv(String),

	#[error("parse error: {0}")]
	Parse(String),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
	pub control_url: Url,
	pub api_key: SecretString,
	pub wireguard_private_key: Option<String>,
	pub state_dir: PathBuf,
	pub wireguard_port: u16,
	pub wireguard_interface: String,
	pub http_port: u16,
	pub https_port: u16,
	pub acme_email: String,
	pub acme_staging: bool,
	pub acme_cache_dir: PathBuf,
}

impl GatewayConfig {
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
			Err(_) => dirs::home_dir()
				.map(|home| home.join(".warren"))
				.ok_or_else(|| {
					ConfigError::Parse("failed to determine home directory".to_string())
				})?,
		};

		let wireguard_port = parse_port("WIREGUARD_PORT", 51820)?;
		let wireguard_interface =
			std::env::var("WIREGUARD_INTERFACE").unwrap_or_else(|_| "wg0".to_string());

		let http_port = parse_port("HTTP_PORT", 80)?;
		let https_port = parse_port("HTTPS_PORT", 443)?;

		let acme_email =
			std::env::var("ACME_EMAIL").unwrap_or_else(|_| DEFAULT_ACME_EMAIL.to_string());
		let acme_staging = std::env::var("ACME_STAGING")
			.map(|v| v == "1" || v.to_lowercase() == "true")
			.unwrap_or(false);
		let acme_cache_dir = std::env::var("ACME_CACHE_DIR")
			.map(PathBuf::from)
			.unwrap_or_else(|_| PathBuf::from("./certs"));

		Ok(Self {
			control_url,
			api_key,
			wireguard_private_key,
			state_dir,
			wireguard_port,
			wireguard_interface,
			http_port,
			https_port,
			acme_email,
			acme_staging,
			acme_cache_dir,
		})
	}

	/// TLS termination is desired exactly when an operator supplied a real
	/// contact address.
	pub fn acme_enabled(&self) -> bool {
		!self.acme_email.is_empty() && self.acme_email != DEFAULT_ACME_EMAIL
	}
}

fn parse_port(var: &str, default: u16) -> Result<u16, ConfigError> {
	match std::env::var(var) {
		Ok(value) => value
			.parse()
			.map_err(|e| ConfigError::Parse(format!("invalid {var}: {e}"))),
		Err(_) => Ok(default),
	}
}
