// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::table::{Lookup, RouteTableReader};
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, StatusCode, Uri};
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, warn};

/// How `X-Forwarded-Proto` is derived for the upstream hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedProtoPolicy {
	/// Gateway: keep what the client (or an outer proxy) already set, else
	/// `http`.
	Passthrough,
	/// Agent: the gateway terminated TLS, so the origin always sees
	/// `https`.
	AlwaysHttps,
}

/// Shared state for one router: the route table read side, the proto
/// policy, and a pooled upstream client.
pub struct ProxyContext {
	routes: RouteTableReader,
	proto_policy: ForwardedProtoPolicy,
	client: Client<HttpConnector, Body>,
}

impl ProxyContext {
	pub fn new(routes: RouteTableReader, proto_policy: ForwardedProtoPolicy) -> Self {
		let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
		Self {
			routes,
			proto_policy,
			client,
		}
	}

	pub fn routes(&self) -> &RouteTableReader {
		&self.routes
	}
}

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Proxies one request to its route target.
///
/// The original `Host` header is preserved on the upstream hop,
/// `X-Forwarded-Host`/`X-Forwarded-Proto` are set, hop-by-hop headers are
/// stripped, and WebSocket upgrades are tunneled byte-for-byte.
pub async fn proxy_request(ctx: &ProxyContext, req: Request<Body>) -> Response<Body> {
	let Some(host) = request_host(&req) else {
		return text_response(StatusCode::NOT_FOUND, "No tunnel configured for this domain");
	};

	let target = match ctx.routes.current().lookup(&host) {
		Lookup::Miss => {
			warn!(domain = %host, "no route for domain");
			return text_response(StatusCode::NOT_FOUND, "No tunnel configured for this domain");
		}
		Lookup::Disabled => {
			warn!(domain = %host, "route is disabled");
			return text_response(StatusCode::SERVICE_UNAVAILABLE, "Tunnel is disabled");
		}
		Lookup::Forward { target } => target,
	};

	let (mut parts, body) = req.into_parts();

	let path_and_query = parts
		.uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	let uri: Uri = match format!("http://{}{}", target, path_and_query).parse() {
		Ok(uri) => uri,
		Err(e) => {
			warn!(domain = %host, %target, error = %e, "invalid route target");
			return text_response(
				StatusCode::INTERNAL_SERVER_ERROR,
				"Invalid target configuration",
			);
		}
	};

	let wants_upgrade = is_upgrade_request(&parts.headers);
	let downstream_upgrade = parts.extensions.remove::<OnUpgrade>();

	let mut headers = forwarded_headers(&parts.headers, wants_upgrade);
	if let Ok(value) = HeaderValue::from_str(&host) {
		headers.insert(header::HOST, value.clone());
		headers.insert(X_FORWARDED_HOST, value);
	}
	apply_proto_policy(&mut headers, &parts.headers, ctx.proto_policy);

	let mut upstream_req = Request::builder()
		.method(parts.method.clone())
		.uri(uri)
		.body(body)
		.expect("request parts were already valid");
	*upstream_req.headers_mut() = headers;

	debug!(domain = %host, %target, method = %parts.method, path = path_and_query, "proxying request");

	let mut response = match ctx.client.request(upstream_req).await {
		Ok(response) => response,
		Err(e) => {
			warn!(domain = %host, %target, error = %e, "upstream request failed");
			return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
		}
	};

	if response.status() == StatusCode::SWITCHING_PROTOCOLS {
		if let Some(downstream) = downstream_upgrade {
			let upstream = hyper::upgrade::on(&mut response);
			let domain = host.clone();
			tokio::spawn(async move {
				match tokio::join!(downstream, upstream) {
					(Ok(downstream), Ok(upstream)) => {
						let mut downstream = TokioIo::new(downstream);
						let mut upstream = TokioIo::new(upstream);
						if let Err(e) =
							tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await
						{
							debug!(domain = %domain, error = %e, "upgraded tunnel closed");
						}
					}
					(down, up) => {
						warn!(
							domain = %domain,
							downstream_ok = down.is_ok(),
							upstream_ok = up.is_ok(),
							"upgrade handshake failed"
						);
					}
				}
			});
		}
	}

	response.map(Body::new)
}

/// The raw host the public client asked for: `Host` header first, URI
/// authority as the HTTP/2 fallback.
fn request_host(req: &Request<Body>) -> Option<String> {
	if let Some(host) = req.headers().get(header::HOST) {
		if let Ok(host) = host.to_str() {
			return Some(host.to_string());
		}
	}
	req.uri().authority().map(|a| a.to_string())
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
	connection_tokens(headers)
		.iter()
		.any(|t| t.eq_ignore_ascii_case("upgrade"))
		&& headers.contains_key(header::UPGRADE)
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
	headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.map(|t| t.trim().to_string())
		.filter(|t| !t.is_empty())
		.collect()
}

/// Copies end-to-end headers, dropping hop-by-hop ones per HTTP semantics.
/// For an upgrade request the `Connection: Upgrade` pair is re-established
/// so the upstream sees the handshake.
fn forwarded_headers(headers: &HeaderMap, wants_upgrade: bool) -> HeaderMap {
	let keep_alive = HeaderName::from_static("keep-alive");
	let hop_by_hop = [
		header::CONNECTION,
		header::PROXY_AUTHENTICATE,
		header::PROXY_AUTHORIZATION,
		header::TE,
		header::TRAILER,
		header::TRANSFER_ENCODING,
		header::UPGRADE,
		keep_alive,
	];

	let connection_named: Vec<String> = connection_tokens(headers);

	let mut out = HeaderMap::new();
	for (name, value) in headers {
		if hop_by_hop.contains(name) {
			continue;
		}
		if connection_named
			.iter()
			.any(|t| t.eq_ignore_ascii_case(name.as_str()))
		{
			continue;
		}
		out.append(name.clone(), value.clone());
	}

	if wants_upgrade {
		if let Some(upgrade) = headers.get(header::UPGRADE) {
			out.insert(header::UPGRADE, upgrade.clone());
			out.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
		}
	}

	out
}

fn apply_proto_policy(
	out: &mut HeaderMap,
	original: &HeaderMap,
	policy: ForwardedProtoPolicy,
) {
	let value = match policy {
		ForwardedProtoPolicy::AlwaysHttps => HeaderValue::from_static("https"),
		ForwardedProtoPolicy::Passthrough => original
			.get(X_FORWARDED_PROTO)
			.cloned()
			.unwrap_or_else(|| HeaderValue::from_static("http")),
	};
	out.insert(X_FORWARDED_PROTO, value);
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(format!("{}\n", message)))
		.expect("static response is valid")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
		let mut map = HeaderMap::new();
		for (name, value) in pairs {
			map.append(
				HeaderName::from_bytes(name.as_bytes()).unwrap(),
				HeaderValue::from_str(value).unwrap(),
			);
		}
		map
	}

	#[test]
	fn strips_hop_by_hop_headers() {
		let input = headers(&[
			("connection", "close"),
			("transfer-encoding", "chunked"),
			("te", "trailers"),
			("x-custom", "kept"),
			("accept", "*/*"),
		]);

		let out = forwarded_headers(&input, false);
		assert!(out.get("connection").is_none());
		assert!(out.get("transfer-encoding").is_none());
		assert!(out.get("te").is_none());
		assert_eq!(out.get("x-custom").unwrap(), "kept");
		assert_eq!(out.get("accept").unwrap(), "*/*");
	}

	#[test]
	fn strips_headers_named_by_connection() {
		let input = headers(&[
			("connection", "close, x-droppable"),
			("x-droppable", "gone"),
			("x-kept", "yes"),
		]);

		let out = forwarded_headers(&input, false);
		assert!(out.get("x-droppable").is_none());
		assert_eq!(out.get("x-kept").unwrap(), "yes");
	}

	#[test]
	fn upgrade_request_keeps_handshake_headers() {
		let input = headers(&[
			("connection", "Upgrade"),
			("upgrade", "websocket"),
			("sec-websocket-key", "abc"),
		]);

		assert!(is_upgrade_request(&input));

		let out = forwarded_headers(&input, true);
		assert_eq!(out.get("upgrade").unwrap(), "websocket");
		assert_eq!(out.get("connection").unwrap(), "Upgrade");
		assert_eq!(out.get("sec-websocket-key").unwrap(), "abc");
	}

	#[test]
	fn plain_request_is_not_an_upgrade() {
		let input = headers(&[("connection", "keep-alive")]);
		assert!(!is_upgrade_request(&input));
	}

	#[test]
	fn passthrough_proto_keeps_existing_value() {
		let original = headers(&[("x-forwarded-proto", "https")]);
		let mut out = HeaderMap::new();
		apply_proto_policy(&mut out, &original, ForwardedProtoPolicy::Passthrough);
		assert_eq!(out.get("x-forwarded-proto").unwrap(), "https");
	}

	#[test]
	fn passthrough_proto_defaults_to_http() {
		let original = HeaderMap::new();
		let mut out = HeaderMap::new();
		apply_proto_policy(&mut out, &original, ForwardedProtoPolicy::Passthrough);
		assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
	}

	#[test]
	fn agent_proto_is_always_https() {
		let original = headers(&[("x-forwarded-proto", "http")]);
		let mut out = HeaderMap::new();
		apply_proto_policy(&mut out, &original, ForwardedProtoPolicy::AlwaysHttps);
		assert_eq!(out.get("x-forwarded-proto").unwrap(), "https");
	}
}
