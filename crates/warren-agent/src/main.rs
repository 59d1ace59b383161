// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Warren agent binary.
//!
//! Runs next to an origin service inside a private network: resolves the
//! node identity, holds a control session, and lets the supervisor
//! reconcile the overlay device and the request router from every topology
//! snapshot.

mod config;
mod supervisor;

use config::AgentConfig;
use std::sync::Arc;
use std::time::Duration;
use supervisor::AgentSupervisor;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use warren_common::{AgentTopology, ClientType, WgKeyPair};
use warren_control::{ControlConfig, ControlError, SnapshotHandler};

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

	info!("starting warren agent");

	let config = match AgentConfig::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!(error = %e, "invalid configuration");
			std::process::exit(1);
		}
	};

	info!(
		control_url = %config.control_url,
		docker_enabled = config.docker_enabled,
		"configuration loaded"
	);

	let keypair = resolve_identity(&config).await;
	info!(public_key = %keypair.public_key(), "node identity ready");

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let supervisor = Arc::new(AgentSupervisor::new(keypair.clone(), shutdown_rx.clone()));

	let control_config = ControlConfig {
		url: config.control_url.clone(),
		api_key: config.api_key.clone(),
		client_type: ClientType::Agent,
		public_key: Some(keypair.public_key().to_base64()),
	};

	let handler: Arc<dyn SnapshotHandler<AgentTopology>> = supervisor.clone();
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

	info!("shutting down agent");
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

	supervisor.shutdown().await;

	info!("agent stopped");
	if exit_code != 0 {
		std::process::exit(exit_code);
	}
	Ok(())
}

/// Resolves the node identity: an operator-supplied key wins, then the
/// persisted key, then a freshly generated one.
async fn resolve_identity(config: &AgentConfig) -> WgKeyPair {
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
	handler: Arc<dyn SnapshotHandler<AgentTopology>>,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let mut backoff = RECONNECT_BASE;

	loop {
		if *shutdown.borrow() {
			return Ok(());
		}

		match warren_control::connect::<AgentTopology>(config.clone()).await {
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
