// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{OverlayError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};
use warren_common::WgPublicKey;

#[derive(Default)]
struct PeerAddrs {
	by_key: HashMap<WgPublicKey, SocketAddr>,
	by_addr: HashMap<SocketAddr, WgPublicKey>,
}

/// UDP transport for the user-space overlay.
///
/// One unconnected socket carries traffic for every peer. Outbound datagrams
/// go to the peer's configured endpoint; inbound datagrams are attributed by
/// source address, and datagrams from unknown sources are dropped.
pub struct OverlayConn {
	socket: UdpSocket,
	peers: RwLock<PeerAddrs>,
}

impl OverlayConn {
	#[instrument]
	pub async fn bind() -> Result<Self> {
		let socket = UdpSocket::bind("0.0.0.0:0").await?;
		debug!(local = %socket.local_addr()?, "bound overlay transport socket");
		Ok(Self {
			socket,
			peers: RwLock::new(PeerAddrs::default()),
		})
	}

	/// Replaces the endpoint map wholesale, mirroring a peer-set swap.
	pub async fn set_peers(&self, peers: impl IntoIterator<Item = (WgPublicKey, Option<SocketAddr>)>) {
		let mut map = PeerAddrs::default();
		for (key, endpoint) in peers {
			if let Some(addr) = endpoint {
				map.by_key.insert(key, addr);
				map.by_addr.insert(addr, key);
			}
		}
		*self.peers.write().await = map;
	}

	pub async fn send(&self, key: &WgPublicKey, data: &[u8]) -> Result<()> {
		let addr = {
			let peers = self.peers.read().await;
			peers
				.by_key
				.get(key)
				.copied()
				.ok_or_else(|| OverlayError::NoEndpoint(key.short()))?
		};
		self.socket.send_to(data, addr).await?;
		Ok(())
	}

	/// Receives the next datagram from a known peer.
	pub async fn recv(&self, buf: &mut [u8]) -> Result<(WgPublicKey, usize)> {
		loop {
			let (len, addr) = self.socket.recv_from(buf).await?;
			let peers = self.peers.read().await;
			match peers.by_addr.get(&addr) {
				Some(key) => return Ok((*key, len)),
				None => {
					trace!(%addr, len, "dropping datagram from unknown source");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use warren_common::WgKeyPair;

	#[tokio::test]
	async fn send_without_endpoint_fails() {
		let conn = OverlayConn::bind().await.unwrap();
		let key = *WgKeyPair::generate().public_key();

		let err = conn.send(&key, b"data").await.unwrap_err();
		assert!(matches!(err, OverlayError::NoEndpoint(_)));
	}

	async fn bind_loopback() -> OverlayConn {
		OverlayConn {
			socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
			peers: RwLock::new(PeerAddrs::default()),
		}
	}

	#[tokio::test]
	async fn roundtrip_between_two_conns() {
		let a = bind_loopback().await;
		let b = bind_loopback().await;

		let key_a = *WgKeyPair::generate().public_key();
		let key_b = *WgKeyPair::generate().public_key();

		let addr_a = a.socket.local_addr().unwrap();
		let addr_b = b.socket.local_addr().unwrap();

		a.set_peers([(key_b, Some(addr_b))]).await;
		b.set_peers([(key_a, Some(addr_a))]).await;

		a.send(&key_b, b"hello").await.unwrap();

		let mut buf = [0u8; 64];
		let (from, len) = b.recv(&mut buf).await.unwrap();
		assert_eq!(from, key_a);
		assert_eq!(&buf[..len], b"hello");
	}

	#[tokio::test]
	async fn set_peers_replaces_previous_endpoints() {
		let conn = OverlayConn::bind().await.unwrap();
		let old = *WgKeyPair::generate().public_key();
		let new = *WgKeyPair::generate().public_key();

		conn
			.set_peers([(old, Some("127.0.0.1:4000".parse().unwrap()))])
			.await;
		conn
			.set_peers([(new, Some("127.0.0.1:4001".parse().unwrap()))])
			.await;

		let err = conn.send(&old, b"data").await.unwrap_err();
		assert!(matches!(err, OverlayError::NoEndpoint(_)));
	}
}
