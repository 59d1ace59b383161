// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ProxyError, Result};
use crate::forward::{self, ProxyContext};
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::instrument;

/// Builds the proxy application: every method, every path, one handler.
pub fn router(ctx: Arc<ProxyContext>) -> Router {
	Router::new().fallback(handle).with_state(ctx)
}

async fn handle(State(ctx): State<Arc<ProxyContext>>, req: Request<Body>) -> Response {
	forward::proxy_request(&ctx, req).await
}

/// Binds a public listener on all interfaces.
pub async fn bind_listener(port: u16) -> Result<TcpListener> {
	TcpListener::bind(("0.0.0.0", port))
		.await
		.map_err(ProxyError::Bind)
}

/// Serves the application on a kernel listener until `shutdown` fires.
/// In-flight requests may be cut; shutdown is bounded by the caller.
#[instrument(skip(listener, app, shutdown), fields(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default()))]
pub async fn serve_listener(
	listener: TcpListener,
	app: Router,
	mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
	axum::serve(listener, app)
		.with_graceful_shutdown(async move {
			let _ = shutdown.wait_for(|stop| *stop).await;
		})
		.await
		.map_err(ProxyError::Serve)
}

/// Serves the application on one already-accepted stream: a connection from
/// the agent's user-space listener, or a TLS stream from the gateway's
/// HTTPS acceptor. Upgrades stay enabled so WebSocket tunnels pass through.
pub async fn serve_stream<S>(
	io: S,
	app: Router,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let service = TowerToHyperService::new(app);
	hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
		.serve_connection_with_upgrades(TokioIo::new(io), service)
		.await
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::forward::ForwardedProtoPolicy;
	use crate::table::{Route, RouteTableHandle};
	use axum::http::{header, HeaderMap, StatusCode};
	use axum::routing::get;
	use axum::Json;
	use http_body_util::BodyExt;
	use serde_json::{json, Value};
	use tower::ServiceExt;

	/// An origin that reports the headers it saw.
	async fn spawn_origin() -> std::net::SocketAddr {
		async fn echo(headers: HeaderMap) -> Json<Value> {
			let get = |name: &str| {
				headers
					.get(name)
					.and_then(|v| v.to_str().ok())
					.unwrap_or_default()
					.to_string()
			};
			Json(json!({
				"host": get("host"),
				"xForwardedHost": get("x-forwarded-host"),
				"xForwardedProto": get("x-forwarded-proto"),
			}))
		}

		let app = Router::new().route("/", get(echo)).route("/{*rest}", get(echo));
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});
		addr
	}

	fn proxy_app(routes: Vec<Route>, policy: ForwardedProtoPolicy) -> Router {
		let (handle, reader) = RouteTableHandle::new();
		handle.update(routes);
		router(Arc::new(ProxyContext::new(reader, policy)))
	}

	fn request_for(host: &str) -> Request<Body> {
		Request::builder()
			.uri("/probe")
			.header(header::HOST, host)
			.body(Body::empty())
			.unwrap()
	}

	async fn body_json(response: Response) -> Value {
		let bytes = response.into_body().collect().await.unwrap().to_bytes();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test]
	async fn bind_listener_reports_occupied_port() {
		let first = bind_listener(0).await.unwrap();
		let port = first.local_addr().unwrap().port();

		let err = bind_listener(port).await.unwrap_err();
		assert!(matches!(err, ProxyError::Bind(_)));
	}

	#[tokio::test]
	async fn forwards_with_gateway_header_policy() {
		let origin = spawn_origin().await;
		let app = proxy_app(
			vec![Route {
				domain: "foo.example".into(),
				target: origin.to_string(),
				enabled: true,
			}],
			ForwardedProtoPolicy::Passthrough,
		);

		let response = app.oneshot(request_for("foo.example")).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);

		let seen = body_json(response).await;
		assert_eq!(seen["host"], "foo.example");
		assert_eq!(seen["xForwardedHost"], "foo.example");
		assert_eq!(seen["xForwardedProto"], "http");
	}

	#[tokio::test]
	async fn forwards_with_agent_header_policy() {
		let origin = spawn_origin().await;
		let app = proxy_app(
			vec![Route {
				domain: "foo.example".into(),
				target: origin.to_string(),
				enabled: true,
			}],
			ForwardedProtoPolicy::AlwaysHttps,
		);

		let response = app.oneshot(request_for("foo.example")).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);

		let seen = body_json(response).await;
		assert_eq!(seen["xForwardedProto"], "https");
	}

	#[tokio::test]
	async fn unknown_host_is_404() {
		let app = proxy_app(vec![], ForwardedProtoPolicy::Passthrough);

		let response = app.oneshot(request_for("bar.example")).await.unwrap();
		assert_eq!(response.status(), StatusCode::NOT_FOUND);

		let bytes = response.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(&bytes[..], b"No tunnel configured for this domain\n");
	}

	#[tokio::test]
	async fn disabled_route_is_503() {
		let app = proxy_app(
			vec![Route {
				domain: "foo.example".into(),
				target: "127.0.0.1:1".into(),
				enabled: false,
			}],
			ForwardedProtoPolicy::Passthrough,
		);

		let response = app.oneshot(request_for("foo.example")).await.unwrap();
		assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

		let bytes = response.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(&bytes[..], b"Tunnel is disabled\n");
	}

	#[tokio::test]
	async fn unreachable_upstream_is_502() {
		let app = proxy_app(
			vec![Route {
				domain: "foo.example".into(),
				// Reserved port that nothing listens on.
				target: "127.0.0.1:1".into(),
				enabled: true,
			}],
			ForwardedProtoPolicy::Passthrough,
		);

		let response = app.oneshot(request_for("foo.example")).await.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
	}

	#[tokio::test]
	async fn host_lookup_strips_port() {
		let origin = spawn_origin().await;
		let app = proxy_app(
			vec![Route {
				domain: "foo.example".into(),
				target: origin.to_string(),
				enabled: true,
			}],
			ForwardedProtoPolicy::Passthrough,
		);

		let response = app.oneshot(request_for("foo.example:8080")).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);

		// The Host header is preserved exactly as the client sent it.
		let seen = body_json(response).await;
		assert_eq!(seen["host"], "foo.example:8080");
	}

	#[tokio::test]
	async fn table_update_applies_to_next_request() {
		let origin = spawn_origin().await;
		let (handle, reader) = RouteTableHandle::new();
		let app = router(Arc::new(ProxyContext::new(
			reader,
			ForwardedProtoPolicy::Passthrough,
		)));

		handle.update(vec![Route {
			domain: "foo.example".into(),
			target: origin.to_string(),
			enabled: true,
		}]);
		let ok = app
			.clone()
			.oneshot(request_for("foo.example"))
			.await
			.unwrap();
		assert_eq!(ok.status(), StatusCode::OK);

		handle.update(vec![Route {
			domain: "foo.example".into(),
			target: origin.to_string(),
			enabled: false,
		}]);
		let disabled = app.oneshot(request_for("foo.example")).await.unwrap();
		assert_eq!(disabled.status(), StatusCode::SERVICE_UNAVAILABLE);
	}
}
