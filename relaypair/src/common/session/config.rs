// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::{Ipv4Addr, SocketAddr};

use serde::Deserialize;

use crate::common::{protocol::ProtocolVersion, transport::SharingConfig};

pub const DEFAULT_LISTEN_PORT: u16 = 9999;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SessionConfig {
  /// Identifies the remote peer in logs
  pub peer_id: Option<String>,
  /// The newest protocol version this side is willing to speak
  pub local_protocol_version: ProtocolVersion,
  /// Local address for the proxy entry point while getting
  pub listen_addr: SocketAddr,
  pub sharing: SharingConfig,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      peer_id: None,
      local_protocol_version: ProtocolVersion::CURRENT,
      listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT)),
      sharing: SharingConfig::default(),
    }
  }
}

impl SessionConfig {
  pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(raw)
  }
}

#[cfg(test)]
mod tests {
  use super::SessionConfig;
  use crate::common::protocol::ProtocolVersion;

  #[test]
  fn partial_documents_fill_defaults() {
    let config = SessionConfig::from_json(
      r#"{ "peer_id": "alice", "sharing": { "reproxy": "127.0.0.1:9050" } }"#,
    )
    .unwrap();
    assert_eq!(config.peer_id.as_deref(), Some("alice"));
    assert_eq!(config.local_protocol_version, ProtocolVersion::CURRENT);
    assert_eq!(config.listen_addr.port(), super::DEFAULT_LISTEN_PORT);
    assert_eq!(
      config.sharing.reproxy,
      Some("127.0.0.1:9050".parse().unwrap())
    );
    assert!(!config.sharing.allow_non_unicast);
  }
}
