// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddr};
use warren_common::WgPublicKey;

/// Default persistent keepalive, applied to every peer unless the snapshot
/// overrides it.
pub const DEFAULT_KEEPALIVE_SECS: u16 = 25;

/// A desired overlay peer, already parsed and validated.
///
/// Peers are content-addressed by public key: two entries with the same key
/// are the same peer. The allowed-IP set encodes the overlay routing
/// decision for outbound datagrams.
#[derive(Debug, Clone)]
pub struct OverlayPeer {
	pub public_key: WgPublicKey,
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Vec<Ipv4Net>,
	pub persistent_keepalive: Option<u16>,
}

impl OverlayPeer {
	pub fn keepalive(&self) -> u16 {
		self.persistent_keepalive.unwrap_or(DEFAULT_KEEPALIVE_SECS)
	}
}

/// Overlay device lifecycle. A device that does not exist yet is simply not
/// constructed; once built it moves between these states under a single
/// writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
	Configured,
	Reconfiguring,
	Closed,
}

/// First usable host of a subnet: the address a gateway claims inside each
/// agent subnet, and therefore the agent's next hop toward that gateway.
pub fn first_host(subnet: Ipv4Net) -> Ipv4Addr {
	Ipv4Addr::from(u32::from(subnet.network()) + 1)
}
