// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// One routing entry: an exact domain mapped to a next-hop authority.
///
/// Disabled entries stay in the table as tombstones so a request for a
/// disabled tunnel answers 503 rather than 404; the set of *served* routes
/// is the enabled subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
	pub domain: String,
	pub target: String,
	pub enabled: bool,
}

/// Outcome of a host lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
	/// No entry for this host.
	Miss,
	/// An entry exists but the tunnel is disabled.
	Disabled,
	/// Proxy to this authority.
	Forward { target: String },
}

/// Immutable snapshot of the routing table. Replaced wholesale on every
/// topology update; never mutated in place.
#[derive(Debug, Default)]
pub struct RouteTable {
	routes: HashMap<String, Route>,
}

impl RouteTable {
	/// Builds a table from a snapshot's routes. Domains are canonicalized;
	/// duplicates resolve last-writer-wins.
	pub fn from_routes(routes: impl IntoIterator<Item = Route>) -> Self {
		let mut map = HashMap::new();
		for mut route in routes {
			route.domain = normalize_host(&route.domain);
			debug!(domain = %route.domain, target = %route.target, enabled = route.enabled, "table entry");
			map.insert(route.domain.clone(), route);
		}
		Self { routes: map }
	}

	pub fn lookup(&self, host: &str) -> Lookup {
		match self.routes.get(&normalize_host(host)) {
			None => Lookup::Miss,
			Some(route) if !route.enabled => Lookup::Disabled,
			Some(route) => Lookup::Forward {
				target: route.target.clone(),
			},
		}
	}

	/// Domains currently served, i.e. the enabled subset. This is also the
	/// name set handed to the certificate provider.
	pub fn serving_domains(&self) -> Vec<String> {
		let mut domains: Vec<String> = self
			.routes
			.values()
			.filter(|r| r.enabled)
			.map(|r| r.domain.clone())
			.collect();
		domains.sort();
		domains
	}

	pub fn len(&self) -> usize {
		self.routes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.routes.is_empty()
	}
}

/// Canonical host form: lower-case, without a port. Matching is exact, not
/// suffix-based.
pub fn normalize_host(host: &str) -> String {
	let host = host.trim();

	// A bracketed IPv6 literal keeps its brackets; everything after them
	// can only be a port.
	let without_port = if let Some(end) = host.rfind(']') {
		&host[..=end]
	} else if let Some((name, port)) = host.rsplit_once(':') {
		if port.chars().all(|c| c.is_ascii_digit()) {
			name
		} else {
			host
		}
	} else {
		host
	};

	without_port.to_ascii_lowercase()
}

/// Single-writer handle owned by the supervisor.
pub struct RouteTableHandle {
	tx: watch::Sender<Arc<RouteTable>>,
}

impl RouteTableHandle {
	pub fn new() -> (Self, RouteTableReader) {
		let (tx, rx) = watch::channel(Arc::new(RouteTable::default()));
		(Self { tx }, RouteTableReader { rx })
	}

	/// Atomically swaps in a new table; in-flight requests keep the
	/// snapshot they already hold, new requests see only the new one.
	pub fn update(&self, routes: Vec<Route>) {
		let table = RouteTable::from_routes(routes);
		info!(routes = table.len(), serving = table.serving_domains().len(), "updated route table");
		let _ = self.tx.send(Arc::new(table));
	}

	pub fn serving_domains(&self) -> Vec<String> {
		self.tx.borrow().serving_domains()
	}
}

/// Lock-free read side; cloned into every listener.
#[derive(Clone)]
pub struct RouteTableReader {
	rx: watch::Receiver<Arc<RouteTable>>,
}

impl RouteTableReader {
	pub fn current(&self) -> Arc<RouteTable> {
		self.rx.borrow().clone()
	}

	/// Resolves once the table changes; used by the certificate provider to
	/// track the permitted name set.
	pub async fn changed(&mut self) -> bool {
		self.rx.changed().await.is_ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn route(domain: &str, target: &str, enabled: bool) -> Route {
		Route {
			domain: domain.to_string(),
			target: target.to_string(),
			enabled,
		}
	}

	#[test]
	fn lookup_misses_on_empty_table() {
		let table = RouteTable::default();
		assert_eq!(table.lookup("foo.example"), Lookup::Miss);
	}

	#[test]
	fn lookup_is_exact_not_suffix() {
		let table = RouteTable::from_routes([route("foo.example", "10.1.0.100:80", true)]);
		assert!(matches!(table.lookup("foo.example"), Lookup::Forward { .. }));
		assert_eq!(table.lookup("sub.foo.example"), Lookup::Miss);
		assert_eq!(table.lookup("example"), Lookup::Miss);
	}

	#[test]
	fn lookup_normalizes_case_and_port() {
		let table = RouteTable::from_routes([route("Foo.Example", "10.1.0.100:80", true)]);
		assert!(matches!(table.lookup("FOO.EXAMPLE:8443"), Lookup::Forward { .. }));
	}

	#[test]
	fn disabled_route_is_a_tombstone() {
		let table = RouteTable::from_routes([route("foo.example", "10.1.0.100:80", false)]);
		assert_eq!(table.lookup("foo.example"), Lookup::Disabled);
		assert!(table.serving_domains().is_empty());
	}

	#[test]
	fn duplicate_domains_resolve_last_writer() {
		let table = RouteTable::from_routes([
			route("foo.example", "10.1.0.100:80", true),
			route("foo.example", "10.2.0.100:80", true),
		]);
		assert_eq!(
			table.lookup("foo.example"),
			Lookup::Forward {
				target: "10.2.0.100:80".to_string()
			}
		);
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn serving_domains_are_sorted_and_enabled_only() {
		let table = RouteTable::from_routes([
			route("b.example", "x:80", true),
			route("a.example", "y:80", true),
			route("c.example", "z:80", false),
		]);
		assert_eq!(table.serving_domains(), vec!["a.example", "b.example"]);
	}

	#[test]
	fn normalize_host_handles_ipv6_literals() {
		assert_eq!(normalize_host("[::1]:8080"), "[::1]");
		assert_eq!(normalize_host("[::1]"), "[::1]");
		assert_eq!(normalize_host("foo.example:80"), "foo.example");
		assert_eq!(normalize_host("foo.example"), "foo.example");
	}

	#[tokio::test]
	async fn update_replaces_table_atomically() {
		let (handle, reader) = RouteTableHandle::new();

		handle.update(vec![route("foo.example", "10.1.0.100:80", true)]);
		let first = reader.current();
		assert!(matches!(first.lookup("foo.example"), Lookup::Forward { .. }));

		handle.update(vec![route("foo.example", "10.1.0.100:80", false)]);

		// The old snapshot is untouched; new reads see the new table.
		assert!(matches!(first.lookup("foo.example"), Lookup::Forward { .. }));
		assert_eq!(reader.current().lookup("foo.example"), Lookup::Disabled);
	}

	#[tokio::test]
	async fn disabled_route_wins_over_previous_enabled_snapshot() {
		let (handle, reader) = RouteTableHandle::new();

		handle.update(vec![route("foo.example", "10.1.0.100:80", true)]);
		handle.update(vec![route("foo.example", "10.1.0.100:80", false)]);

		assert_eq!(reader.current().lookup("foo.example"), Lookup::Disabled);
	}
}
