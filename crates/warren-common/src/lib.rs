// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared types for the warren tunneling fabric.
//!
//! This crate holds everything both node roles need: WireGuard identity
//! material and its on-disk persistence, the control-channel wire protocol,
//! and the topology snapshot schemas pushed by Control.

pub mod keys;
pub mod keys_file;
pub mod proto;
pub mod secret;
pub mod topology;

pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use keys_file::{
	get_or_create_node_key, load_node_key, save_node_key, KeyFileError, KEY_FILENAME,
};
pub use proto::{now_ms, ClientType, ControlMessage, NodeStatus};
pub use secret::SecretString;
pub use topology::{
	AgentPeer, AgentSelf, AgentTopology, AgentTunnel, GatewayPeer, GatewaySelf, GatewayTopology,
	GatewayTunnel,
};
