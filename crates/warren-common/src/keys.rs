// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use defguard_boringtun::x25519::{PublicKey, StaticSecret};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
	#[error("invalid base64: {0}")]
	Base64(#[from] base64::DecodeError),

	#[error("key must decode to 32 bytes, got {0}")]
	Length(usize),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode32(s: &str) -> Result<[u8; 32]> {
	let bytes = BASE64.decode(s.trim())?;
	let len = bytes.len();
	bytes.try_into().map_err(|_| KeyError::Length(len))
}

/// The private half of a WireGuard identity. Never serialized, never logged.
#[derive(Clone)]
pub struct WgPrivateKey([u8; 32]);

impl WgPrivateKey {
	pub fn from_base64(s: &str) -> Result<Self> {
		decode32(s).map(Self)
	}

	pub fn to_base64(&self) -> String {
		BASE64.encode(self.0)
	}

	/// Raw scalar bytes, handed only to the overlay library.
	pub fn expose_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.0);
		WgPublicKey(*PublicKey::from(&secret).as_bytes())
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPrivateKey(..)")
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgPublicKey([u8; 32]);

impl WgPublicKey {
	pub fn from_base64(s: &str) -> Result<Self> {
		decode32(s).map(Self)
	}

	pub fn to_base64(&self) -> String {
		BASE64.encode(self.0)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	/// Short prefix for log context; enough to identify a peer, not enough
	/// to reconstruct the key.
	pub fn short(&self) -> String {
		let b64 = self.to_base64();
		b64.chars().take(8).collect()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_base64())
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPublicKey({})", self.short())
	}
}

/// A full WireGuard identity. The public half is derived once at
/// construction so the two halves can never drift apart.
#[derive(Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		let mut bytes = [0u8; 32];
		OsRng.fill_bytes(&mut bytes);
		Self::from_private_key(WgPrivateKey(bytes))
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self::from_private_key(WgPrivateKey::from_base64(s)?))
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("public", &self.public)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generate_derives_stable_public_key() {
		let pair = WgKeyPair::generate();
		let again = WgKeyPair::from_base64(&pair.private_key().to_base64()).unwrap();
		assert_eq!(pair.public_key(), again.public_key());
	}

	#[test]
	fn base64_roundtrip() {
		let pair = WgKeyPair::generate();
		let b64 = pair.public_key().to_base64();
		let parsed = WgPublicKey::from_base64(&b64).unwrap();
		assert_eq!(*pair.public_key(), parsed);
	}

	#[test]
	fn rejects_wrong_length() {
		let err = WgPublicKey::from_base64("aGVsbG8=").unwrap_err();
		assert!(matches!(err, KeyError::Length(5)));
	}

	#[test]
	fn rejects_bad_base64() {
		let err = WgPublicKey::from_base64("not base64!!!").unwrap_err();
		assert!(matches!(err, KeyError::Base64(_)));
	}

	#[test]
	fn short_is_a_prefix() {
		let pair = WgKeyPair::generate();
		let full = pair.public_key().to_base64();
		assert!(full.starts_with(&pair.public_key().short()));
		assert_eq!(pair.public_key().short().len(), 8);
	}

	#[test]
	fn debug_never_prints_private_material() {
		let pair = WgKeyPair::generate();
		let dbg = format!("{:?}", pair);
		assert!(!dbg.contains(&pair.private_key().to_base64()));
	}
}
