// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! TLS termination for the gateway's public HTTPS listener.
//!
//! Certificates come from an ACME directory via rustls-acme and are cached
//! on disk. The permitted name set follows the enabled route table: every
//! time the set changes, a fresh provider generation is started for the new
//! names and the old generation winds down. The cache keeps unchanged names
//! from being re-issued.

use futures::StreamExt;
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct AcmeSettings {
	pub email: String,
	pub staging: bool,
	pub cache_dir: PathBuf,
}

/// Pending TLS handshakes queued toward the active provider generation.
const HANDOFF_QUEUE: usize = 64;

/// Accepts public TLS connections and serves them through the proxy
/// application. Runs until `shutdown` fires.
#[instrument(skip_all, fields(staging = settings.staging))]
pub async fn serve_https(
	listener: TcpListener,
	app: axum::Router,
	settings: AcmeSettings,
	mut domains_rx: watch::Receiver<Vec<String>>,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut handoff: Option<mpsc::Sender<std::io::Result<TcpStream>>> = None;
	let mut active_domains: Vec<String> = Vec::new();

	loop {
		tokio::select! {
			biased;

			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					info!("https listener shutting down");
					break;
				}
			}

			changed = domains_rx.changed() => {
				if changed.is_err() {
					break;
				}
				let domains = domains_rx.borrow_and_update().clone();

				if domains.is_empty() {
					info!("no routable domains, pausing TLS termination");
					handoff = None;
					active_domains.clear();
					continue;
				}
				if domains == active_domains {
					continue;
				}

				info!(count = domains.len(), "domain set changed, starting new certificate generation");
				active_domains = domains.clone();

				let (tx, rx) = mpsc::channel(HANDOFF_QUEUE);
				handoff = Some(tx);
				spawn_generation(settings.clone(), domains, rx, app.clone());
			}

			accepted = listener.accept() => {
				match accepted {
					Ok((stream, remote)) => {
						match &handoff {
							Some(tx) => {
								if tx.try_send(Ok(stream)).is_err() {
									debug!(%remote, "dropping TLS connection, provider busy");
								}
							}
							None => {
								debug!(%remote, "dropping TLS connection, no certificates yet");
							}
						}
					}
					Err(e) => {
						warn!(error = %e, "https accept error");
					}
				}
			}
		}
	}
}

/// One provider generation: an ACME order for a fixed name set plus the
/// TLS acceptor fed from the handoff queue. Ends when the queue is
/// replaced or dropped.
fn spawn_generation(
	settings: AcmeSettings,
	domains: Vec<String>,
	connections: mpsc::Receiver<std::io::Result<TcpStream>>,
	app: axum::Router,
) {
	tokio::spawn(async move {
		info!(domains = ?domains, "certificate generation starting");

		let state = AcmeConfig::new(domains)
			.contact_push(format!("mailto:{}", settings.email))
			.cache(DirCache::new(settings.cache_dir.clone()))
			.directory_lets_encrypt(!settings.staging)
			.state();

		let mut incoming = state.tokio_incoming(
			ReceiverStream::new(connections),
			vec![b"h2".to_vec(), b"http/1.1".to_vec()],
		);

		while let Some(conn) = incoming.next().await {
			match conn {
				Ok(tls) => {
					let app = app.clone();
					tokio::spawn(async move {
						if let Err(e) = warren_proxy::serve_stream(tls, app).await {
							debug!(error = %e, "tls connection ended with error");
						}
					});
				}
				Err(e) => {
					warn!(error = %e, "tls accept error");
				}
			}
		}

		info!("certificate generation ended");
	});
}
