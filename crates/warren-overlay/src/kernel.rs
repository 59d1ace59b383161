// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{OverlayError, Result};
use crate::peers::{first_host, DeviceState, OverlayPeer};
use ipnet::Ipv4Net;
use std::io::Write;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use warren_common::{WgKeyPair, WgPublicKey};

pub struct KernelConfig {
	pub interface: String,
	pub listen_port: u16,
	pub keypair: WgKeyPair,
}

/// The gateway-side overlay device: a kernel WireGuard interface driven by
/// the `wg` and `ip` tools.
///
/// Every peer-set change is applied with `wg syncconf`, which replaces the
/// device configuration wholesale while preserving sessions for unchanged
/// keys; no intermediate peer set is ever observable. A failed apply leaves
/// the kernel untouched.
pub struct KernelOverlay {
	interface: String,
	listen_port: u16,
	keypair: WgKeyPair,
	state: Mutex<DeviceState>,
}

impl KernelOverlay {
	#[instrument(skip(config), fields(interface = %config.interface, port = config.listen_port))]
	pub async fn create(config: KernelConfig) -> Result<Self> {
		run_command(
			"ip",
			&["link", "add", &config.interface, "type", "wireguard"],
			true,
		)
		.await?;
		run_command("ip", &["link", "set", &config.interface, "up"], false).await?;

		let overlay = Self {
			interface: config.interface,
			listen_port: config.listen_port,
			keypair: config.keypair,
			state: Mutex::new(DeviceState::Configured),
		};

		// Install the identity and listen port before any peers exist.
		overlay.apply(&[]).await?;

		info!(
			interface = %overlay.interface,
			public_key = %overlay.keypair.public_key(),
			"created kernel overlay device"
		);

		Ok(overlay)
	}

	/// Atomically replaces the device's peer set.
	#[instrument(skip(self, peers), fields(interface = %self.interface, count = peers.len()))]
	pub async fn replace_peers(&self, peers: &[OverlayPeer]) -> Result<()> {
		let mut state = self.state.lock().await;
		if *state == DeviceState::Closed {
			return Err(OverlayError::Closed);
		}
		*state = DeviceState::Reconfiguring;

		let result = self.apply(peers).await;

		*state = DeviceState::Configured;
		if result.is_ok() {
			info!(peers = peers.len(), "replaced kernel peer set");
		}
		result
	}

	async fn apply(&self, peers: &[OverlayPeer]) -> Result<()> {
		let document = render_device_config(&self.keypair, self.listen_port, peers);

		// The document carries the private key; it must never be
		// group- or world-readable.
		let file = write_private_tempfile(&document)?;
		let path = file.path().to_string_lossy().into_owned();

		run_command("wg", &["syncconf", &self.interface, &path], false).await
	}

	/// Gives the interface an address inside each agent subnet and a kernel
	/// route directing that subnet out the overlay. Idempotent; "already
	/// exists" is success, other failures are warned without rolling back
	/// the snapshot.
	#[instrument(skip(self, subnets), fields(interface = %self.interface, count = subnets.len()))]
	pub async fn ensure_subnet_routes(&self, subnets: &[Ipv4Net]) {
		for subnet in subnets {
			let address = format!("{}/{}", first_host(*subnet), subnet.prefix_len());
			if let Err(e) = run_command(
				"ip",
				&["address", "add", &address, "dev", &self.interface],
				true,
			)
			.await
			{
				warn!(%address, error = %e, "failed to add gateway address for agent subnet");
			}

			let route = subnet.to_string();
			if let Err(e) =
				run_command("ip", &["route", "add", &route, "dev", &self.interface], true).await
			{
				warn!(subnet = %route, error = %e, "failed to add route for agent subnet");
			}
		}
	}

	pub fn public_key(&self) -> &WgPublicKey {
		self.keypair.public_key()
	}

	pub fn interface(&self) -> &str {
		&self.interface
	}

	pub async fn state(&self) -> DeviceState {
		*self.state.lock().await
	}

	/// Terminal and idempotent. The interface itself is left to the OS,
	/// matching operator expectations for kernel devices.
	#[instrument(skip(self), fields(interface = %self.interface))]
	pub async fn close(&self) {
		let mut state = self.state.lock().await;
		if *state == DeviceState::Closed {
			return;
		}
		*state = DeviceState::Closed;
		info!("closed kernel overlay device");
	}
}

/// Renders a `wg syncconf` document: `[Interface]` identity plus one
/// `[Peer]` section per desired peer. Malformed peers were already dropped
/// during snapshot parsing.
fn render_device_config(keypair: &WgKeyPair, listen_port: u16, peers: &[OverlayPeer]) -> String {
	let mut doc = String::new();
	doc.push_str("[Interface]\n");
	doc.push_str(&format!(
		"PrivateKey = {}\n",
		keypair.private_key().to_base64()
	));
	doc.push_str(&format!("ListenPort = {}\n", listen_port));

	for peer in peers {
		doc.push('\n');
		doc.push_str("[Peer]\n");
		doc.push_str(&format!("PublicKey = {}\n", peer.public_key.to_base64()));

		if !peer.allowed_ips.is_empty() {
			let allowed: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
			doc.push_str(&format!("AllowedIPs = {}\n", allowed.join(", ")));
		}

		if let Some(endpoint) = peer.endpoint {
			doc.push_str(&format!("Endpoint = {}\n", endpoint));
		}

		doc.push_str(&format!("PersistentKeepalive = {}\n", peer.keepalive()));
	}

	doc
}

// NamedTempFile is created mode 0600 on unix, which is what the private
// key inside requires.
fn write_private_tempfile(content: &str) -> Result<tempfile::NamedTempFile> {
	let mut file = tempfile::Builder::new()
		.prefix("warren-wg-")
		.tempfile()
		.map_err(|e| OverlayError::Device(format!("tempfile: {}", e)))?;
	file
		.write_all(content.as_bytes())
		.map_err(|e| OverlayError::Device(format!("write: {}", e)))?;
	file
		.flush()
		.map_err(|e| OverlayError::Device(format!("flush: {}", e)))?;
	Ok(file)
}

/// Runs a configuration command. With `exists_ok`, an "already exists"
/// failure counts as success so re-applying a snapshot stays idempotent.
async fn run_command(program: &str, args: &[&str], exists_ok: bool) -> Result<()> {
	let rendered = format!("{} {}", program, args.join(" "));
	debug!(command = %rendered, "running");

	let output = Command::new(program)
		.args(args)
		.output()
		.await
		.map_err(|e| OverlayError::CommandFailed {
			command: rendered.clone(),
			stderr: e.to_string(),
		})?;

	if output.status.success() {
		return Ok(());
	}

	let stderr = String::from_utf8_lossy(&output.stderr);
	if exists_ok && (stderr.contains("File exists") || stderr.contains("already exists")) {
		return Ok(());
	}

	Err(OverlayError::CommandFailed {
		command: rendered,
		stderr: stderr.trim().to_string(),
	})
}
