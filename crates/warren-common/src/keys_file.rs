// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{KeyError, WgKeyPair};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{instrument, warn};

/// On-disk name of the node identity inside the state directory.
pub const KEY_FILENAME: &str = "wireguard.key";

#[derive(Debug, Error)]
pub enum KeyFileError {
	#[error("failed to read key file: {0}")]
	Read(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] KeyError),
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_node_key(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let content = fs::read_to_string(path.as_ref()).await?;
	Ok(WgKeyPair::from_base64(content.trim())?)
}

#[instrument(skip(key), fields(path = %path.as_ref().display()))]
pub async fn save_node_key(key: &WgKeyPair, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();

	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}

	let content = format!("{}\n", key.private_key().to_base64());

	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content).await?;
	}

	Ok(())
}

/// Resolves the node identity from the state directory.
///
/// A readable, well-formed `wireguard.key` wins. A corrupted file is
/// discarded with a warning. A missing or discarded key falls through to
/// generation; the fresh key is persisted with owner-only permissions, and
/// a persistence failure leaves the node running on an ephemeral identity.
#[instrument(skip(state_dir), fields(dir = %state_dir.as_ref().display()))]
pub async fn get_or_create_node_key(state_dir: impl AsRef<Path>) -> WgKeyPair {
	let key_path = state_dir.as_ref().join(KEY_FILENAME);

	if key_path.exists() {
		match load_node_key(&key_path).await {
			Ok(key) => return key,
			Err(e) => {
				warn!(error = %e, path = %key_path.display(), "discarding corrupted node key");
			}
		}
	}

	let keypair = WgKeyPair::generate();
	if let Err(e) = save_node_key(&keypair, &key_path).await {
		warn!(
			error = %e,
			path = %key_path.display(),
			"failed to persist node key, continuing with ephemeral identity"
		);
	}
	keypair
}
