// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use warren_common::{AgentPeer, GatewayTopology, WgPublicKey};
use warren_control::SnapshotHandler;
use warren_overlay::{KernelOverlay, OverlayPeer};
use warren_proxy::{Route, RouteTableHandle};

/// Single-writer reconciliation loop for the gateway.
///
/// The router exists from boot; the overlay device may be absent when
/// interface creation needed privileges the process does not have. Every
/// snapshot replaces the peer set, swaps the route table, re-applies the
/// kernel routing glue, and refreshes the certificate provider's permitted
/// names.
pub struct GatewaySupervisor {
	overlay: Option<Arc<KernelOverlay>>,
	routes: RouteTableHandle,
	tls_domains: Option<watch::Sender<Vec<String>>>,
}

impl GatewaySupervisor {
	pub fn new(
		overlay: Option<Arc<KernelOverlay>>,
		routes: RouteTableHandle,
		tls_domains: Option<watch::Sender<Vec<String>>>,
	) -> Self {
		Self {
			overlay,
			routes,
			tls_domains,
		}
	}

	#[instrument(skip_all, fields(
		agents = topology.agents.len(),
		tunnels = topology.tunnels.len(),
	))]
	async fn reconcile(&self, topology: GatewayTopology) -> anyhow::Result<()> {
		info!("applying topology snapshot");

		let (peers, subnets) = derive_agent_peers(&topology.agents);

		// Step 1: peer set. A failure keeps the previous set and is
		// reported in the ack, but routes still follow the snapshot.
		let mut device_error = None;
		if let Some(overlay) = &self.overlay {
			if let Err(e) = overlay.replace_peers(&peers).await {
				error!(error = %e, "failed to replace kernel peer set");
				device_error = Some(e);
			}
		}

		// Step 3 (gateway): routes, then glue, then certificate names.
		self.routes.update(derive_routes(&topology));

		if let Some(overlay) = &self.overlay {
			overlay.ensure_subnet_routes(&subnets).await;
		}

		if let Some(tls_domains) = &self.tls_domains {
			let serving = self.routes.serving_domains();
			tls_domains.send_if_modified(|current| {
				if *current != serving {
					*current = serving;
					true
				} else {
					false
				}
			});
		}

		match device_error {
			Some(e) => Err(e.into()),
			None => Ok(()),
		}
	}

	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		if let Some(overlay) = &self.overlay {
			overlay.close().await;
		}
		info!("gateway supervisor stopped");
	}
}

#[async_trait]
impl SnapshotHandler<GatewayTopology> for GatewaySupervisor {
	async fn apply(&self, snapshot: GatewayTopology) -> anyhow::Result<()> {
		self.reconcile(snapshot).await
	}
}

/// Maps a snapshot's agents to overlay peers. Each peer's allowed-IPs are
/// that agent's advertised subnet. Malformed entries are skipped with a
/// warning; the rest still apply.
fn derive_agent_peers(agents: &[AgentPeer]) -> (Vec<OverlayPeer>, Vec<Ipv4Net>) {
	let mut peers = Vec::with_capacity(agents.len());
	let mut subnets = Vec::with_capacity(agents.len());

	for agent in agents {
		let public_key = match WgPublicKey::from_base64(&agent.wireguard_public_key) {
			Ok(key) => key,
			Err(e) => {
				warn!(agent = %agent.name, error = %e, "skipping agent with malformed public key");
				continue;
			}
		};

		let subnet: Ipv4Net = match agent.subnet.parse() {
			Ok(subnet) => subnet,
			Err(e) => {
				warn!(agent = %agent.name, subnet = %agent.subnet, error = %e, "skipping agent with malformed subnet");
				continue;
			}
		};

		debug!(agent = %agent.name, peer = %public_key.short(), %subnet, "derived agent peer");
		peers.push(OverlayPeer {
			public_key,
			// Agents dial out from behind NAT; their endpoints are learned
			// from incoming handshakes, never configured.
			endpoint: None,
			allowed_ips: vec![subnet],
			persistent_keepalive: None,
		});
		subnets.push(subnet);
	}

	(peers, subnets)
}

/// Maps tunnels to routes, resolving each tunnel's agent to its virtual IP.
/// Tunnels pointing at unknown agents are skipped with a warning.
fn derive_routes(topology: &GatewayTopology) -> Vec<Route> {
	let mut routes = Vec::with_capacity(topology.tunnels.len());

	for tunnel in &topology.tunnels {
		let agent = topology.agents.iter().find(|a| a.id == tunnel.agent_id);
		let Some(agent) = agent else {
			warn!(tunnel = %tunnel.id, agent_id = %tunnel.agent_id, "agent not found for tunnel");
			continue;
		};
		if agent.virtual_ip.is_empty() {
			warn!(tunnel = %tunnel.id, agent = %agent.name, "agent has no virtual ip yet");
			continue;
		}

		routes.push(Route {
			domain: tunnel.domain.clone(),
			target: format!("{}:80", agent.virtual_ip),
			enabled: tunnel.enabled,
		});
	}

	routes
}

#[cfg(test)]
mod tests {
	use super::*;
	use warren_common::{GatewaySelf, GatewayTunnel, WgKeyPair};

	fn agent(id: &str, key: &str, subnet: &str, virtual_ip: &str) -> AgentPeer {
		AgentPeer {
			id: id.into(),
			name: format!("agent-{id}"),
			wireguard_public_key: key.into(),
			subnet: subnet.into(),
			virtual_ip: virtual_ip.into(),
		}
	}

	fn topology(agents: Vec<AgentPeer>, tunnels: Vec<GatewayTunnel>) -> GatewayTopology {
		GatewayTopology {
			gateway: GatewaySelf {
				id: "g-1".into(),
				name: "fra-1".into(),
				public_ip: "1.2.3.4".into(),
				wireguard_public_key: "pk".into(),
				region: "eu".into(),
				status: "active".into(),
			},
			agents,
			tunnels,
		}
	}

	fn tunnel(id: &str, domain: &str, agent_id: &str, enabled: bool) -> GatewayTunnel {
		GatewayTunnel {
			id: id.into(),
			domain: domain.into(),
			agent_id: agent_id.into(),
			target: String::new(),
			enabled,
		}
	}

	#[test]
	fn derive_peers_uses_agent_subnets_as_allowed_ips() {
		let key = WgKeyPair::generate().public_key().to_base64();
		let (peers, subnets) = derive_agent_peers(&[agent(
			"a-1",
			&key,
			"10.1.0.0/24",
			"10.1.0.100",
		)]);

		assert_eq!(peers.len(), 1);
		assert_eq!(peers[0].allowed_ips, vec!["10.1.0.0/24".parse().unwrap()]);
		assert!(peers[0].endpoint.is_none());
		assert_eq!(subnets, vec!["10.1.0.0/24".parse::<Ipv4Net>().unwrap()]);
	}

	#[test]
	fn derive_peers_skips_malformed_entries() {
		let key = WgKeyPair::generate().public_key().to_base64();
		let (peers, _) = derive_agent_peers(&[
			agent("bad-key", "!!!", "10.1.0.0/24", "10.1.0.100"),
			agent("bad-subnet", &key, "not-a-subnet", "10.2.0.100"),
			agent("good", &key, "10.3.0.0/24", "10.3.0.100"),
		]);

		assert_eq!(peers.len(), 1);
		assert_eq!(peers[0].allowed_ips, vec!["10.3.0.0/24".parse().unwrap()]);
	}

	#[test]
	fn derive_routes_resolves_agent_virtual_ips() {
		let key = WgKeyPair::generate().public_key().to_base64();
		let topo = topology(
			vec![agent("a-1", &key, "10.1.0.0/24", "10.1.0.100")],
			vec![
				tunnel("t-1", "foo.example", "a-1", true),
				tunnel("t-2", "bar.example", "missing", true),
				tunnel("t-3", "baz.example", "a-1", false),
			],
		);

		let routes = derive_routes(&topo);

		assert_eq!(routes.len(), 2);
		assert_eq!(routes[0].domain, "foo.example");
		assert_eq!(routes[0].target, "10.1.0.100:80");
		assert!(routes[0].enabled);
		// Disabled tunnels stay as tombstones for 503 answers.
		assert_eq!(routes[1].domain, "baz.example");
		assert!(!routes[1].enabled);
	}

	#[tokio::test]
	async fn reconcile_updates_routes_and_tls_domains() {
		let key = WgKeyPair::generate().public_key().to_base64();
		let (routes, reader) = RouteTableHandle::new();
		let (domains_tx, mut domains_rx) = watch::channel(Vec::new());

		let supervisor = GatewaySupervisor::new(None, routes, Some(domains_tx));

		let topo = topology(
			vec![agent("a-1", &key, "10.1.0.0/24", "10.1.0.100")],
			vec![
				tunnel("t-1", "foo.example", "a-1", true),
				tunnel("t-2", "off.example", "a-1", false),
			],
		);

		supervisor.apply(topo.clone()).await.unwrap();

		assert!(matches!(
			reader.current().lookup("foo.example"),
			warren_proxy::Lookup::Forward { .. }
		));
		assert_eq!(
			reader.current().lookup("off.example"),
			warren_proxy::Lookup::Disabled
		);

		assert!(domains_rx.has_changed().unwrap());
		assert_eq!(*domains_rx.borrow_and_update(), vec!["foo.example"]);

		// Idempotence: the same snapshot leaves the domain set untouched.
		supervisor.apply(topo).await.unwrap();
		assert!(!domains_rx.has_changed().unwrap());
	}

	#[tokio::test]
	async fn disable_mid_traffic_answers_503_next_request() {
		let key = WgKeyPair::generate().public_key().to_base64();
		let (routes, reader) = RouteTableHandle::new();
		let supervisor = GatewaySupervisor::new(None, routes, None);

		let enabled = topology(
			vec![agent("a-1", &key, "10.1.0.0/24", "10.1.0.100")],
			vec![tunnel("t-1", "foo.example", "a-1", true)],
		);
		supervisor.apply(enabled.clone()).await.unwrap();

		let mut disabled = enabled;
		disabled.tunnels[0].enabled = false;
		supervisor.apply(disabled).await.unwrap();

		assert_eq!(
			reader.current().lookup("foo.example"),
			warren_proxy::Lookup::Disabled
		);
	}
}
