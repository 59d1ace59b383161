// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Warren gateway binary.
//!
//! Runs at a publicly reachable edge: terminates HTTP (and, with ACME
//! configured, HTTPS), keeps a kernel WireGuard interface pointed at every
//! agent, and forwards public requests across the overlay to the agent that
//! owns the requested domain.

mod config;
mod supervisor;
mod tls;

use config::GatewayConfig;
use std::sync::Arc;
use std::time::Duration;
use supervisor::GatewaySupervisor;
use tls::AcmeSettings;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use warren_common::{ClientType, GatewayTopology, WgKeyPair};
use warren_control::{ControlConfig, ControlError, SnapshotHandler};
use warren_overlay::{KernelConfig, KernelOverlay};
use warren_proxy::{ForwardedProtoPolicy, ProxyContext, RouteTableHandle};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	dotenvy::dotenv().ok();

	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	info!("starting warren gateway");

	let config = match GatewayConfig::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!(error = %e, "invalid configuration");
			std::process::exit(1);
		}
	};

	info!(
		control_url = %config.control_url,
		wireguard_port = config.wireguard_port,
		http_port = config.http_port,
		https_port = config.https_port,
		"configuration loaded"
	);

	let keypair = resolve_identity(&config).await;
	info!(public_key = %keypair.public_key(), "node identity ready");

	// The kernel interface needs privileges; running without it keeps the
	// router serving while an operator fixes the deployment.
	let overlay = match KernelOverlay::create(KernelConfig {
		interface: config.wireguard_interface.clone(),
		listen_port: config.wireguard_port,
		keypair: keypair.clone(),
	})
	.await
	{
		Ok(overlay) => Some(Arc::new(overlay)),
		Err(e) => {
			warn!(error = %e, "failed to create kernel interface (may require privileges)");
			None
		}
	};

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	// The router exists from boot; snapshots only swap its table.
	let (routes, reader) = RouteTableHandle::new();
	let app = warren_proxy::router(Arc::new(ProxyContext::new(
		reader,
		ForwardedProtoPolicy::Passthrough,
	)));

	let http_listener = match warren_proxy::bind_listener(config.http_port).await {
		Ok(listener) => listener,
		Err(e) => {
			error!(port = config.http_port, error = %e, "public http listener");
			std::process::exit(1);
		}
	};
	info!(port = config.http_port, "public http listener bound");

	let mut http_task = tokio::spawn(warren_proxy::serve_listener(
		http_listener,
		app.clone(),
		shutdown_rx.clone(),
	));

	let tls_domains = if config.acme_enabled() {
		let https_listener = match warren_proxy::bind_listener(config.https_port).await {
			Ok(listener) => listener,
			Err(e) => {
				error!(port = config.https_port, error = %e, "public https listener");
				std::process::exit(1);
			}
		};
		info!(
			port = config.https_port,
			email = %config.acme_email,
			staging = config.acme_staging,
			cache_dir = %config.acme_cache_dir.display(),
			"ACME/TLS enabled"
		);

		let (domains_tx, domains_rx) = watch::channel(Vec::new());
		tokio::spawn(tls::serve_https(
			https_listener,
			app.clone(),
			AcmeSettings {
				email: config.acme_email.clone(),
				staging: config.acme_staging,
				cache_dir: config.acme_cache_dir.clone(),
			},
			domains_rx,
			shutdown_rx.clone(),
		));
		Some(domains_tx)
	} else {
		info!("ACME/TLS disabled, HTTP-only mode");
		None
	};

	let supervisor = Arc::new(GatewaySupervisor::new(overlay, routes, tls_domains));

	let control_config = ControlConfig {
		url: config.control_url.clone(),
		api_key: config.api_key.clone(),
		client_type: ClientType::Gateway,
		public_key: Some(keypair.public_key().to_base64()),
	};

	let handler: Arc<dyn SnapshotHandler<GatewayTopology>> = supervisor.clone();
	let mut session_task = tokio::spawn(run_control(
		control_config,
		handler,
		shutdown_rx.clone(),
	));

	let mut sigterm = signal(SignalKind::terminate())?;
	let mut session_done = false;
	let mut exit_code = 0;

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			info!("received SIGINT");
		}
		_ = sigterm.recv() => {
			info!("received SIGTERM");
		}
		result = &mut session_task => {
			session_done = true;
			match result {
				Ok(Ok(())) => info!("control session ended"),
				Ok(Err(e)) => {
					error!(error = %e, "control session failed");
					exit_code = 1;
				}
				Err(e) => {
					error!(error = %e, "control task aborted");
					exit_code = 1;
				}
			}
		}
	}

	info!("shutting down gateway");
	let _ = shutdown_tx.send(true);

	if !session_done {
		if tokio::time::timeout(SHUTDOWN_GRACE, &mut session_task)
			.await
			.is_err()
		{
			warn!("control session did not stop in time, aborting");
			session_task.abort();
		}
	}

	if tokio::time::timeout(SHUTDOWN_GRACE, &mut http_task)
		.await
		.is_err()
	{
		warn!("http listener did not stop in time, aborting");
		http_task.abort();
	}

	supervisor.shutdown().await;

	info!("gateway stopped");
	if exit_code != 0 {
		std::process::exit(exit_code);
	}
	Ok(())
}

/// Resolves the node identity: an operator-supplied key wins, then the
/// persisted key, then a freshly generated one.
async fn resolve_identity(config: &GatewayConfig) -> WgKeyPair {
	if let Some(operator_key) = &config.wireguard_private_key {
		match WgKeyPair::from_base64(operator_key) {
			Ok(keypair) => {
				info!("using operator-supplied identity");
				return keypair;
			}
			Err(e) => {
				error!(error = %e, "invalid WIREGUARD_PRIVATE_KEY");
				std::process::exit(1);
			}
		}
	}

	warren_common::get_or_create_node_key(&config.state_dir).await
}

/// One control session after another, with exponential backoff between
/// attempts. An authentication rejection is fatal; transport failures
/// reconnect.
async fn run_control(
	config: ControlConfig,
	handler: Arc<dyn SnapshotHandler<GatewayTopology>>,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let mut backoff = RECONNECT_BASE;

	loop {
		if *shutdown.borrow() {
			return Ok(());
		}

		match warren_control::connect::<GatewayTopology>(config.clone()).await {
			Ok(session) => {
				backoff = RECONNECT_BASE;
				match session.run(handler.clone(), shutdown.clone()).await {
					Ok(()) => return Ok(()),
					Err(e) => warn!(error = %e, "control session ended"),
				}
			}
			Err(ControlError::AuthRejected(reason)) => {
				error!(%reason, "control rejected this node");
				return Err(ControlError::AuthRejected(reason).into());
			}
			Err(e) => {
				warn!(error = %e, "failed to connect to control");
			}
		}

		info!(delay_secs = backoff.as_secs(), "reconnecting to control");
		tokio::select! {
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					return Ok(());
				}
			}
			_ = tokio::time::sleep(backoff) => {}
		}
		backoff = (backoff * 2).min(RECONNECT_CAP);
	}
}
