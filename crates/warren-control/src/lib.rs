// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane client for warren nodes.
//!
//! A node holds exactly one full-duplex WebSocket session to Control. The
//! session authenticates the node, receives topology snapshots, sends
//! liveness, and acknowledges every snapshot after the supervisor has
//! reconciled it. Reconnection policy belongs to the caller; this crate
//! covers a single session from handshake to teardown.

pub mod client;
pub mod error;
pub mod session;

pub use client::{connect, ControlConfig};
pub use error::{ControlError, Result};
pub use session::{ControlSession, SnapshotHandler};
