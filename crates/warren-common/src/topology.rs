// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Topology snapshot schemas pushed by Control inside `config_update`.
//!
//! A snapshot is the complete, authoritative view of a node's desired peers
//! and routes. Field values that name keys, addresses and endpoints arrive as
//! strings; parsing and validation happen at reconciliation time so one
//! malformed entry never invalidates the snapshot around it.

use serde::{Deserialize, Serialize};

/// Snapshot delivered to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTopology {
	pub agent: AgentSelf,
	#[serde(default)]
	pub gateways: Vec<GatewayPeer>,
	#[serde(default)]
	pub tunnels: Vec<AgentTunnel>,
}

/// The agent's own assignment within the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSelf {
	pub id: String,
	pub name: String,
	pub wireguard_public_key: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub wireguard_private_key: Option<String>,
	pub virtual_ip: String,
	pub subnet: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<String>,
}

/// A gateway the agent should maintain as an overlay peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPeer {
	pub id: String,
	pub name: String,
	pub wireguard_public_key: String,
	pub public_ip: String,
	pub endpoint: String,
}

/// A route the agent serves: domain to local origin `host:port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTunnel {
	pub id: String,
	pub domain: String,
	pub target: String,
	pub enabled: bool,
}

/// Snapshot delivered to a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTopology {
	pub gateway: GatewaySelf,
	#[serde(default)]
	pub agents: Vec<AgentPeer>,
	#[serde(default)]
	pub tunnels: Vec<GatewayTunnel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySelf {
	pub id: String,
	pub name: String,
	pub public_ip: String,
	pub wireguard_public_key: String,
	#[serde(default)]
	pub region: String,
	#[serde(default)]
	pub status: String,
}

/// An agent the gateway should maintain as an overlay peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPeer {
	pub id: String,
	pub name: String,
	pub wireguard_public_key: String,
	pub subnet: String,
	pub virtual_ip: String,
}

/// A route the gateway serves: domain to the owning agent's virtual IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTunnel {
	pub id: String,
	pub domain: String,
	pub agent_id: String,
	#[serde(default)]
	pub target: String,
	pub enabled: bool,
}
