// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::Context;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};
use warren_common::{AgentTopology, WgKeyPair, WgPublicKey};
use warren_control::SnapshotHandler;
use warren_overlay::{
	first_host, NetstackConfig, NetstackListener, NetstackOverlay, OverlayPeer, DEFAULT_MTU,
};
use warren_proxy::{ForwardedProtoPolicy, ProxyContext, Route, RouteTableHandle};

/// The agent router always listens on the overlay address at this port.
const ROUTER_PORT: u16 = 80;

struct ProxyRuntime {
	routes: RouteTableHandle,
	accept_task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct AgentState {
	overlay: Option<Arc<NetstackOverlay>>,
	overlay_tasks: Vec<tokio::task::JoinHandle<()>>,
	proxy: Option<ProxyRuntime>,
}

/// Single-writer reconciliation loop for the agent.
///
/// Owns the overlay device and the request router, and is the only entity
/// that mutates them. The router is never constructed before the overlay:
/// its listen address exists only on the overlay's user-space stack.
pub struct AgentSupervisor {
	keypair: WgKeyPair,
	shutdown: watch::Receiver<bool>,
	inner: Mutex<AgentState>,
}

impl AgentSupervisor {
	pub fn new(keypair: WgKeyPair, shutdown: watch::Receiver<bool>) -> Self {
		Self {
			keypair,
			shutdown,
			inner: Mutex::new(AgentState::default()),
		}
	}

	#[instrument(skip_all, fields(
		gateways = topology.gateways.len(),
		tunnels = topology.tunnels.len(),
		virtual_ip = %topology.agent.virtual_ip,
	))]
	async fn reconcile(&self, topology: AgentTopology) -> anyhow::Result<()> {
		let mut state = self.inner.lock().await;

		info!("applying topology snapshot");

		// Step 1: the overlay device, created on the first snapshot that
		// assigns an address, reconciled on every one after.
		if state.overlay.is_none() {
			if topology.agent.virtual_ip.is_empty() {
				info!("snapshot carries no overlay address yet, deferring device and router");
				return Ok(());
			}

			let address: Ipv4Addr = topology
				.agent
				.virtual_ip
				.parse()
				.context("invalid virtual ip in snapshot")?;
			let subnet: Ipv4Net = topology
				.agent
				.subnet
				.parse()
				.context("invalid subnet in snapshot")?;

			let overlay = Arc::new(
				NetstackOverlay::new(NetstackConfig {
					keypair: self.keypair.clone(),
					address,
					subnet,
					mtu: DEFAULT_MTU,
				})
				.await?,
			);

			state.overlay_tasks.push(Arc::clone(&overlay).spawn_recv_loop());
			state.overlay_tasks.push(Arc::clone(&overlay).spawn_send_loop());
			state.overlay_tasks.push(Arc::clone(&overlay).spawn_timer_loop());
			state.overlay = Some(overlay);
		}

		let Some(overlay) = state.overlay.clone() else {
			return Ok(());
		};

		let peers = derive_gateway_peers(&topology, overlay.subnet());
		overlay.replace_peers(peers).await?;

		// Step 2: the request router, bound to the overlay's own stack. A
		// step-1 failure has already returned and skipped this.
		if state.proxy.is_none() {
			let listener = overlay.tcp_listener(ROUTER_PORT).await?;
			info!(addr = %listener.local_addr(), "request router listening on overlay stack");

			let (routes, reader) = RouteTableHandle::new();
			let app = warren_proxy::router(Arc::new(ProxyContext::new(
				reader,
				ForwardedProtoPolicy::AlwaysHttps,
			)));

			let accept_task =
				tokio::spawn(run_accept_loop(listener, app, self.shutdown.clone()));
			state.proxy = Some(ProxyRuntime {
				routes,
				accept_task,
			});
		}

		if let Some(proxy) = &state.proxy {
			proxy.routes.update(
				topology
					.tunnels
					.iter()
					.map(|t| Route {
						domain: t.domain.clone(),
						target: t.target.clone(),
						enabled: t.enabled,
					})
					.collect(),
			);
		}

		Ok(())
	}

	/// Idempotent teardown: router first, then the overlay device.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		let mut state = self.inner.lock().await;

		if let Some(proxy) = state.proxy.take() {
			proxy.accept_task.abort();
		}

		if let Some(overlay) = state.overlay.take() {
			overlay.close().await;
		}

		for task in state.overlay_tasks.drain(..) {
			task.abort();
		}

		info!("agent supervisor stopped");
	}
}

#[async_trait]
impl SnapshotHandler<AgentTopology> for AgentSupervisor {
	async fn apply(&self, snapshot: AgentTopology) -> anyhow::Result<()> {
		self.reconcile(snapshot).await
	}
}

/// Maps a snapshot's gateways to overlay peers.
///
/// Each gateway gets a single host route: the first host of the agent's own
/// subnet, the address the gateway claims there. Malformed entries are
/// skipped with a warning; the rest of the snapshot still applies.
fn derive_gateway_peers(topology: &AgentTopology, subnet: Ipv4Net) -> Vec<OverlayPeer> {
	let gateway_route =
		Ipv4Net::new(first_host(subnet), 32).expect("/32 is always a valid prefix length");

	let mut peers = Vec::with_capacity(topology.gateways.len());
	for gateway in &topology.gateways {
		let public_key = match WgPublicKey::from_base64(&gateway.wireguard_public_key) {
			Ok(key) => key,
			Err(e) => {
				warn!(gateway = %gateway.name, error = %e, "skipping gateway with malformed public key");
				continue;
			}
		};

		let endpoint = if gateway.endpoint.is_empty() {
			None
		} else {
			match gateway.endpoint.parse::<SocketAddr>() {
				Ok(addr) => Some(addr),
				Err(e) => {
					warn!(
						gateway = %gateway.name,
						endpoint = %gateway.endpoint,
						error = %e,
						"skipping gateway with malformed endpoint"
					);
					continue;
				}
			}
		};

		debug!(gateway = %gateway.name, peer = %public_key.short(), route = %gateway_route, "derived gateway peer");
		peers.push(OverlayPeer {
			public_key,
			endpoint,
			allowed_ips: vec![gateway_route],
			persistent_keepalive: None,
		});
	}

	if peers.len() > 1 {
		warn!(
			count = peers.len(),
			"multiple gateways share one host route in this subnet"
		);
	}

	peers
}

async fn run_accept_loop(
	listener: NetstackListener,
	app: axum::Router,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		tokio::select! {
			biased;

			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					info!("router accept loop shutting down");
					break;
				}
			}

			accepted = listener.accept() => {
				match accepted {
					Ok((stream, remote)) => {
						let app = app.clone();
						tokio::spawn(async move {
							if let Err(e) = warren_proxy::serve_stream(stream, app).await {
								debug!(%remote, error = %e, "connection ended with error");
							}
						});
					}
					Err(e) => {
						warn!(error = %e, "netstack accept error");
						break;
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use warren_common::{AgentSelf, AgentTunnel, GatewayPeer};

	fn topology(virtual_ip: &str, subnet: &str) -> AgentTopology {
		AgentTopology {
			agent: AgentSelf {
				id: "a-1".into(),
				name: "edge-box".into(),
				wireguard_public_key: "pk".into(),
				wireguard_private_key: None,
				virtual_ip: virtual_ip.into(),
				subnet: subnet.into(),
				status: None,
			},
			gateways: vec![],
			tunnels: vec![],
		}
	}

	fn gateway(name: &str, key: &str, endpoint: &str) -> GatewayPeer {
		GatewayPeer {
			id: format!("g-{name}"),
			name: name.into(),
			wireguard_public_key: key.into(),
			public_ip: "1.2.3.4".into(),
			endpoint: endpoint.into(),
		}
	}

	#[test]
	fn derive_skips_malformed_entries_and_keeps_the_rest() {
		let valid_key = WgKeyPair::generate().public_key().to_base64();
		let mut topo = topology("10.1.0.100", "10.1.0.0/24");
		topo.gateways = vec![
			gateway("bad-key", "!!!", "1.2.3.4:51820"),
			gateway("bad-endpoint", &valid_key, "not-an-endpoint"),
			gateway("good", &valid_key, "1.2.3.4:51820"),
		];

		let peers = derive_gateway_peers(&topo, "10.1.0.0/24".parse().unwrap());

		assert_eq!(peers.len(), 1);
		assert_eq!(peers[0].endpoint, Some("1.2.3.4:51820".parse().unwrap()));
		assert_eq!(peers[0].allowed_ips, vec!["10.1.0.1/32".parse().unwrap()]);
	}

	#[test]
	fn derive_host_route_follows_the_actual_subnet() {
		let valid_key = WgKeyPair::generate().public_key().to_base64();
		let mut topo = topology("192.168.7.100", "192.168.7.0/24");
		topo.gateways = vec![gateway("g", &valid_key, "1.2.3.4:51820")];

		let peers = derive_gateway_peers(&topo, "192.168.7.0/24".parse().unwrap());
		assert_eq!(peers[0].allowed_ips, vec!["192.168.7.1/32".parse().unwrap()]);
	}

	#[test]
	fn derive_accepts_missing_endpoint() {
		let valid_key = WgKeyPair::generate().public_key().to_base64();
		let mut topo = topology("10.1.0.100", "10.1.0.0/24");
		topo.gateways = vec![gateway("g", &valid_key, "")];

		let peers = derive_gateway_peers(&topo, "10.1.0.0/24".parse().unwrap());
		assert_eq!(peers.len(), 1);
		assert!(peers[0].endpoint.is_none());
	}

	#[tokio::test]
	async fn snapshot_without_address_defers_device_and_router() {
		let (_tx, rx) = watch::channel(false);
		let supervisor = AgentSupervisor::new(WgKeyPair::generate(), rx);

		supervisor.apply(topology("", "")).await.unwrap();

		let state = supervisor.inner.lock().await;
		assert!(state.overlay.is_none());
		assert!(state.proxy.is_none());
	}

	#[tokio::test]
	async fn first_addressed_snapshot_creates_device_then_router() {
		let (_tx, rx) = watch::channel(false);
		let supervisor = AgentSupervisor::new(WgKeyPair::generate(), rx);

		let mut topo = topology("10.1.0.100", "10.1.0.0/24");
		topo.tunnels = vec![AgentTunnel {
			id: "t-1".into(),
			domain: "foo.example".into(),
			target: "127.0.0.1:8080".into(),
			enabled: true,
		}];

		supervisor.apply(topo.clone()).await.unwrap();

		{
			let state = supervisor.inner.lock().await;
			let overlay = state.overlay.as_ref().unwrap();
			assert_eq!(overlay.address(), "10.1.0.100".parse::<Ipv4Addr>().unwrap());
			let proxy = state.proxy.as_ref().unwrap();
			assert_eq!(proxy.routes.serving_domains(), vec!["foo.example"]);
		}

		// Idempotence: applying the same snapshot again changes nothing.
		supervisor.apply(topo).await.unwrap();
		{
			let state = supervisor.inner.lock().await;
			assert_eq!(state.overlay.as_ref().unwrap().peer_count().await, 0);
			assert!(state.proxy.is_some());
		}

		supervisor.shutdown().await;
	}

	#[tokio::test]
	async fn malformed_address_fails_the_snapshot() {
		let (_tx, rx) = watch::channel(false);
		let supervisor = AgentSupervisor::new(WgKeyPair::generate(), rx);

		let result = supervisor.apply(topology("not-an-ip", "10.1.0.0/24")).await;
		assert!(result.is_err());

		// Step 2 was skipped: no router exists.
		let state = supervisor.inner.lock().await;
		assert!(state.proxy.is_none());
	}

	#[tokio::test]
	async fn route_updates_follow_snapshots() {
		let (_tx, rx) = watch::channel(false);
		let supervisor = AgentSupervisor::new(WgKeyPair::generate(), rx);

		let mut topo = topology("10.1.0.100", "10.1.0.0/24");
		topo.tunnels = vec![AgentTunnel {
			id: "t-1".into(),
			domain: "foo.example".into(),
			target: "127.0.0.1:8080".into(),
			enabled: true,
		}];
		supervisor.apply(topo.clone()).await.unwrap();

		topo.tunnels[0].enabled = false;
		supervisor.apply(topo).await.unwrap();

		let state = supervisor.inner.lock().await;
		let proxy = state.proxy.as_ref().unwrap();
		assert!(proxy.routes.serving_domains().is_empty());

		drop(state);
		supervisor.shutdown().await;
	}
}
