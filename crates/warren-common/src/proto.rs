// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch, the timestamp unit of every control
/// frame.
pub fn now_ms() -> i64 {
	Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
	Agent,
	Gateway,
}

impl fmt::Display for ClientType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ClientType::Agent => write!(f, "agent"),
			ClientType::Gateway => write!(f, "gateway"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
	Online,
	Offline,
	Error,
}

/// A control-channel frame.
///
/// Every message is a self-describing JSON object: a `type` tag, a
/// millisecond `timestamp`, and a type-specific body with camelCase fields.
/// `T` is the role-specific topology payload carried by `config_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlMessage<T> {
	Auth {
		#[serde(default)]
		timestamp: i64,
		api_key: String,
		client_type: ClientType,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		public_key: Option<String>,
	},
	AuthSuccess {
		#[serde(default)]
		timestamp: i64,
		client_id: String,
		client_type: ClientType,
	},
	AuthError {
		#[serde(default)]
		timestamp: i64,
		error: String,
	},
	Ping {
		#[serde(default)]
		timestamp: i64,
	},
	Pong {
		#[serde(default)]
		timestamp: i64,
	},
	ConfigUpdate {
		#[serde(default)]
		timestamp: i64,
		config: T,
	},
	ConfigAck {
		#[serde(default)]
		timestamp: i64,
		success: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<String>,
	},
	StatusUpdate {
		#[serde(default)]
		timestamp: i64,
		status: NodeStatus,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		metadata: Option<serde_json::Value>,
	},
	Error {
		#[serde(default)]
		timestamp: i64,
		error: String,
	},
}

impl<T> ControlMessage<T> {
	pub fn auth(api_key: String, client_type: ClientType, public_key: Option<String>) -> Self {
		Self::Auth {
			timestamp: now_ms(),
			api_key,
			client_type,
			public_key,
		}
	}

	pub fn pong() -> Self {
		Self::Pong { timestamp: now_ms() }
	}

	pub fn config_ack(result: Result<(), String>) -> Self {
		match result {
			Ok(()) => Self::ConfigAck {
				timestamp: now_ms(),
				success: true,
				error: None,
			},
			Err(error) => Self::ConfigAck {
				timestamp: now_ms(),
				success: false,
				error: Some(error),
			},
		}
	}

	pub fn status(status: NodeStatus) -> Self {
		Self::StatusUpdate {
			timestamp: now_ms(),
			status,
			metadata: None,
		}
	}

	/// Wire tag of this message, for log context.
	pub fn type_name(&self) -> &'static str {
		match self {
			Self::Auth { .. } => "auth",
			Self::AuthSuccess { .. } => "auth_success",
			Self::AuthError { .. } => "auth_error",
			Self::Ping { .. } => "ping",
			Self::Pong { .. } => "pong",
			Self::ConfigUpdate { .. } => "config_update",
			Self::ConfigAck { .. } => "config_ack",
			Self::StatusUpdate { .. } => "status_update",
			Self::Error { .. } => "error",
		}
	}
}

impl<T: Serialize> ControlMessage<T> {
	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}

impl<T: DeserializeOwned> ControlMessage<T> {
	pub fn from_json(text: &str) -> serde_json::Result<Self> {
		serde_json::from_str(text)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::{json, Value};

	#[test]
	fn auth_uses_camel_case_fields() {
		let msg: ControlMessage<Value> = ControlMessage::auth(
			"key-123".to_string(),
			ClientType::Agent,
			Some("pk".to_string()),
		);
		let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

		assert_eq!(value["type"], "auth");
		assert_eq!(value["apiKey"], "key-123");
		assert_eq!(value["clientType"], "agent");
		assert_eq!(value["publicKey"], "pk");
		assert!(value["timestamp"].as_i64().unwrap() > 0);
	}

	#[test]
	fn auth_omits_absent_public_key() {
		let msg: ControlMessage<Value> =
			ControlMessage::auth("k".to_string(), ClientType::Gateway, None);
		let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
		assert!(value.get("publicKey").is_none());
	}

	#[test]
	fn parses_auth_success() {
		let text = r#"{"type":"auth_success","timestamp":1,"clientId":"c1","clientType":"gateway"}"#;
		let msg: ControlMessage<Value> = ControlMessage::from_json(text).unwrap();
		match msg {
			ControlMessage::AuthSuccess {
				client_id,
				client_type,
				..
			} => {
				assert_eq!(client_id, "c1");
				assert_eq!(client_type, ClientType::Gateway);
			}
			other => panic!("expected auth_success, got {}", other.type_name()),
		}
	}

	#[test]
	fn config_update_carries_typed_payload() {
		#[derive(Debug, Deserialize, Serialize, PartialEq)]
		struct Payload {
			hello: String,
		}

		let text = r#"{"type":"config_update","timestamp":2,"config":{"hello":"world"}}"#;
		let msg: ControlMessage<Payload> = ControlMessage::from_json(text).unwrap();
		match msg {
			ControlMessage::ConfigUpdate { config, .. } => {
				assert_eq!(config.hello, "world");
			}
			other => panic!("expected config_update, got {}", other.type_name()),
		}
	}

	#[test]
	fn config_ack_failure_includes_error() {
		let msg: ControlMessage<Value> =
			ControlMessage::config_ack(Err("device configure failed".to_string()));
		let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
		assert_eq!(value["type"], "config_ack");
		assert_eq!(value["success"], false);
		assert_eq!(value["error"], "device configure failed");
	}

	#[test]
	fn config_ack_success_omits_error() {
		let msg: ControlMessage<Value> = ControlMessage::config_ack(Ok(()));
		let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
		assert_eq!(value["success"], true);
		assert!(value.get("error").is_none());
	}

	#[test]
	fn unknown_type_fails_to_parse() {
		let text = r#"{"type":"surprise","timestamp":3}"#;
		assert!(ControlMessage::<Value>::from_json(text).is_err());
	}

	#[test]
	fn roundtrip_is_semantically_stable() {
		let messages: Vec<ControlMessage<Value>> = vec![
			ControlMessage::auth("k".into(), ClientType::Agent, Some("pk".into())),
			ControlMessage::pong(),
			ControlMessage::config_ack(Ok(())),
			ControlMessage::status(NodeStatus::Online),
			ControlMessage::Error {
				timestamp: now_ms(),
				error: "boom".into(),
			},
		];

		for msg in messages {
			let first = msg.to_json().unwrap();
			let parsed: ControlMessage<Value> = ControlMessage::from_json(&first).unwrap();
			let second = parsed.to_json().unwrap();
			let a: Value = serde_json::from_str(&first).unwrap();
			let b: Value = serde_json::from_str(&second).unwrap();
			assert_eq!(a, b);
		}
	}

	#[test]
	fn status_update_shape() {
		let msg: ControlMessage<Value> = ControlMessage::status(NodeStatus::Online);
		let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
		assert_eq!(value["type"], "status_update");
		assert_eq!(value["status"], "online");
		assert_eq!(value.get("metadata"), None);
	}

	#[test]
	fn ping_pong_shapes() {
		let ping = json!({"type": "ping", "timestamp": 9});
		let msg: ControlMessage<Value> = serde_json::from_value(ping).unwrap();
		assert!(matches!(msg, ControlMessage::Ping { timestamp: 9 }));

		let pong: ControlMessage<Value> = ControlMessage::pong();
		let value: Value = serde_json::from_str(&pong.to_json().unwrap()).unwrap();
		assert_eq!(value["type"], "pong");
	}
}
