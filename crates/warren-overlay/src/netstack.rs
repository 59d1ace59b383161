// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::conn::OverlayConn;
use crate::device::{NetStack, NetstackListener};
use crate::error::{OverlayError, Result};
use crate::peers::{DeviceState, OverlayPeer};
use defguard_boringtun::noise::{Tunn, TunnResult};
use defguard_boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};
use warren_common::{WgKeyPair, WgPublicKey};

/// Netstack MTU; leaves room for WireGuard framing inside a 1500-byte path.
pub const DEFAULT_MTU: u16 = 1420;

pub struct NetstackConfig {
	pub keypair: WgKeyPair,
	pub address: Ipv4Addr,
	pub subnet: Ipv4Net,
	pub mtu: u16,
}

struct PeerTunnel {
	tunn: Mutex<Tunn>,
	public_key: WgPublicKey,
	allowed_ips: Vec<Ipv4Net>,
}

/// The agent-side overlay device: one boringtun tunnel per gateway peer on
/// top of a user-space network stack.
///
/// The peer set always equals the last successfully applied snapshot.
/// [`NetstackOverlay::replace_peers`] swaps the whole set under a write
/// lock, keeping established noise sessions for keys that survive the swap.
pub struct NetstackOverlay {
	keypair: WgKeyPair,
	address: Ipv4Addr,
	subnet: Ipv4Net,
	stack: NetStack,
	conn: OverlayConn,
	tunnels: RwLock<Vec<PeerTunnel>>,
	state: Mutex<DeviceState>,
	next_index: AtomicU32,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl NetstackOverlay {
	#[instrument(skip(config), fields(address = %config.address, subnet = %config.subnet, mtu = config.mtu))]
	pub async fn new(config: NetstackConfig) -> Result<Self> {
		let stack = NetStack::new(config.address, config.subnet.prefix_len(), config.mtu)?;
		let conn = OverlayConn::bind().await?;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		info!(public_key = %config.keypair.public_key(), "created netstack overlay device");

		Ok(Self {
			keypair: config.keypair,
			address: config.address,
			subnet: config.subnet,
			stack,
			conn,
			tunnels: RwLock::new(Vec::new()),
			state: Mutex::new(DeviceState::Configured),
			next_index: AtomicU32::new(0),
			shutdown_tx,
			shutdown_rx,
		})
	}

	/// Atomically replaces the peer set with `peers`.
	///
	/// Keys already present keep their noise session; keys absent from the
	/// new set are torn down. Reconfiguration is serialized, and a closed
	/// device refuses further changes.
	#[instrument(skip(self, peers), fields(count = peers.len()))]
	pub async fn replace_peers(&self, peers: Vec<OverlayPeer>) -> Result<()> {
		let mut state = self.state.lock().await;
		if *state == DeviceState::Closed {
			return Err(OverlayError::Closed);
		}
		*state = DeviceState::Reconfiguring;

		{
			let mut tunnels = self.tunnels.write().await;
			let mut existing: HashMap<WgPublicKey, PeerTunnel> = tunnels
				.drain(..)
				.map(|t| (t.public_key, t))
				.collect();

			for peer in &peers {
				match existing.remove(&peer.public_key) {
					Some(kept) => {
						trace!(peer = %peer.public_key.short(), "keeping established tunnel");
						tunnels.push(PeerTunnel {
							tunn: kept.tunn,
							public_key: peer.public_key,
							allowed_ips: peer.allowed_ips.clone(),
						});
					}
					None => {
						let index = self.next_index.fetch_add(1, Ordering::Relaxed);
						let tunn = Tunn::new(
							StaticSecret::from(*self.keypair.private_key().expose_bytes()),
							PublicKey::from(*peer.public_key.as_bytes()),
							None,
							Some(peer.keepalive()),
							index,
							None,
						);
						debug!(peer = %peer.public_key.short(), "created tunnel for new peer");
						tunnels.push(PeerTunnel {
							tunn: Mutex::new(tunn),
							public_key: peer.public_key,
							allowed_ips: peer.allowed_ips.clone(),
						});
					}
				}
			}

			for (key, _) in existing {
				debug!(peer = %key.short(), "tore down tunnel for removed peer");
			}
		}

		self
			.conn
			.set_peers(peers.iter().map(|p| (p.public_key, p.endpoint)))
			.await;

		*state = DeviceState::Configured;
		info!(peers = peers.len(), "replaced overlay peer set");
		Ok(())
	}

	/// Decrypts datagrams from the transport into the network stack.
	pub fn spawn_recv_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let overlay = Arc::clone(&self);
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut buf = vec![0u8; 65536];
			let mut dst_buf = vec![0u8; 65536];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("overlay recv loop shutting down");
							break;
						}
					}

					result = overlay.conn.recv(&mut buf) => {
						match result {
							Ok((peer, len)) => {
								overlay.handle_datagram(&peer, &buf[..len], &mut dst_buf).await;
							}
							Err(e) => {
								warn!(error = %e, "overlay transport recv error");
							}
						}
					}
				}
			}
		})
	}

	async fn handle_datagram(&self, peer: &WgPublicKey, datagram: &[u8], dst_buf: &mut [u8]) {
		let tunnels = self.tunnels.read().await;
		let Some(tunnel) = tunnels.iter().find(|t| t.public_key == *peer) else {
			trace!(peer = %peer.short(), "datagram for unknown tunnel");
			return;
		};

		let mut tunn = tunnel.tunn.lock().await;

		match tunn.decapsulate(None, datagram, dst_buf) {
			TunnResult::Done => {}
			TunnResult::WriteToNetwork(data) => {
				if let Err(e) = self.conn.send(peer, data).await {
					warn!(peer = %peer.short(), error = %e, "failed to send handshake response");
					return;
				}
				// Drain any packets queued behind the handshake.
				loop {
					match tunn.decapsulate(None, &[], dst_buf) {
						TunnResult::WriteToNetwork(data) => {
							if let Err(e) = self.conn.send(peer, data).await {
								warn!(peer = %peer.short(), error = %e, "failed to drain handshake queue");
								break;
							}
						}
						_ => break,
					}
				}
			}
			TunnResult::WriteToTunnelV4(data, _) => {
				if let Err(e) = self.stack.receive_packet(data) {
					warn!(error = %e, "failed to inject packet into network stack");
				}
			}
			TunnResult::WriteToTunnelV6(data, _) => {
				trace!(len = data.len(), "dropping IPv6 packet from overlay");
			}
			TunnResult::Err(e) => {
				debug!(peer = %peer.short(), ?e, "tunnel decapsulate error");
			}
		}
	}

	/// Encrypts packets leaving the network stack toward their peer.
	pub fn spawn_send_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let overlay = Arc::clone(&self);
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; 65536];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("overlay send loop shutting down");
							break;
						}
					}

					_ = tokio::time::sleep(std::time::Duration::from_millis(1)) => {
						while let Some(packet) = overlay.stack.transmit_packet() {
							if packet.len() < 20 {
								continue;
							}

							let Some(dst) = extract_ipv4_dst(&packet) else {
								continue;
							};

							let tunnels = overlay.tunnels.read().await;
							let Some(tunnel) = route_packet(&tunnels, dst) else {
								trace!(%dst, "no peer route for outbound packet");
								continue;
							};

							let mut tunn = tunnel.tunn.lock().await;
							match tunn.encapsulate(&packet, &mut dst_buf) {
								TunnResult::WriteToNetwork(data) => {
									let key = tunnel.public_key;
									if let Err(e) = overlay.conn.send(&key, data).await {
										warn!(peer = %key.short(), error = %e, "failed to send encrypted packet");
									}
								}
								TunnResult::Done => {}
								TunnResult::Err(e) => {
									debug!(peer = %tunnel.public_key.short(), ?e, "tunnel encapsulate error");
								}
								_ => {}
							}
						}
					}
				}
			}
		})
	}

	/// Drives boringtun's timers: handshake retries and persistent keepalive.
	pub fn spawn_timer_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let overlay = Arc::clone(&self);
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; 65536];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("overlay timer loop shutting down");
							break;
						}
					}

					_ = tokio::time::sleep(std::time::Duration::from_millis(250)) => {
						let tunnels = overlay.tunnels.read().await;
						for tunnel in tunnels.iter() {
							let mut tunn = tunnel.tunn.lock().await;
							let result = tunn.update_timers(&mut dst_buf);
							drop(tunn);

							match result {
								TunnResult::WriteToNetwork(data) => {
									let key = tunnel.public_key;
									if let Err(e) = overlay.conn.send(&key, data).await {
										warn!(peer = %key.short(), error = %e, "failed to send timer packet");
									}
								}
								TunnResult::Done => {}
								TunnResult::Err(e) => {
									debug!(peer = %tunnel.public_key.short(), ?e, "timer update error");
								}
								_ => {}
							}
						}
					}
				}
			}
		})
	}

	/// Opens a TCP listener on the stack; this is the handle the request
	/// router binds to.
	pub async fn tcp_listener(&self, port: u16) -> Result<NetstackListener> {
		let state = self.state.lock().await;
		if *state == DeviceState::Closed {
			return Err(OverlayError::Closed);
		}
		self.stack.listen(port)
	}

	pub fn public_key(&self) -> &WgPublicKey {
		self.keypair.public_key()
	}

	pub fn address(&self) -> Ipv4Addr {
		self.address
	}

	pub fn subnet(&self) -> Ipv4Net {
		self.subnet
	}

	pub async fn peer_count(&self) -> usize {
		self.tunnels.read().await.len()
	}

	pub async fn state(&self) -> DeviceState {
		*self.state.lock().await
	}

	/// Terminal and idempotent.
	#[instrument(skip(self))]
	pub async fn close(&self) {
		let mut state = self.state.lock().await;
		if *state == DeviceState::Closed {
			return;
		}
		*state = DeviceState::Closed;
		drop(state);

		let _ = self.shutdown_tx.send(true);
		self.tunnels.write().await.clear();
		info!("closed netstack overlay device");
	}
}

fn route_packet(tunnels: &[PeerTunnel], dst: Ipv4Addr) -> Option<&PeerTunnel> {
	tunnels
		.iter()
		.filter_map(|t| {
			t.allowed_ips
				.iter()
				.filter(|net| net.contains(&dst))
				.map(|net| net.prefix_len())
				.max()
				.map(|len| (len, t))
		})
		.max_by_key(|(len, _)| *len)
		.map(|(_, t)| t)
}

fn extract_ipv4_dst(packet: &[u8]) -> Option<Ipv4Addr> {
	if packet.len() < 20 {
		return None;
	}

	if packet[0] >> 4 != 4 {
		return None;
	}

	let mut dst = [0u8; 4];
	dst.copy_from_slice(&packet[16..20]);
	Some(Ipv4Addr::from(dst))
}
