// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Signaling envelopes exchanged over the out-of-band channel
//!
//! Every envelope carries an explicit `"type"` discriminant on the wire. Decoding never
//! guesses an envelope's kind from which fields happen to be present.

use serde::{Deserialize, Serialize};

/// Which side of the tunnel produced a forwarded signal
///
/// Signals from the client peer are consumed by the remote's sharing engine, and
/// signals from the server peer by the remote's getting engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
  ClientPeer,
  ServerPeer,
}

/// An opaque bundle of transport signaling data, interpreted only by the engines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportSignal(serde_json::Value);

impl TransportSignal {
  pub fn new(value: serde_json::Value) -> Self {
    Self(value)
  }

  pub fn value(&self) -> &serde_json::Value {
    &self.0
  }

  pub fn into_value(self) -> serde_json::Value {
    self.0
  }
}

impl From<serde_json::Value> for TransportSignal {
  fn from(value: serde_json::Value) -> Self {
    Self::new(value)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEnvelope {
  ForwardedSignal {
    from: PeerRole,
    payload: TransportSignal,
  },
  SessionMetadata {
    proxying_id: String,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum SignalError {
  #[error("Malformed signaling envelope")]
  Malformed(#[source] serde_json::Error),
  #[error("Signaling envelope could not be encoded")]
  Encoding(#[source] serde_json::Error),
}

impl SignalEnvelope {
  pub fn encode(&self) -> Result<String, SignalError> {
    serde_json::to_string(self).map_err(SignalError::Encoding)
  }

  pub fn decode(raw: &str) -> Result<Self, SignalError> {
    serde_json::from_str(raw).map_err(SignalError::Malformed)
  }
}

#[cfg(test)]
mod tests {
  use super::{PeerRole, SignalEnvelope, SignalError, TransportSignal};
  use serde_json::json;

  #[test]
  fn envelopes_carry_explicit_tags() {
    let forwarded = SignalEnvelope::ForwardedSignal {
      from: PeerRole::ClientPeer,
      payload: TransportSignal::new(json!({ "sdp": "v=0" })),
    };
    let encoded: serde_json::Value = serde_json::from_str(&forwarded.encode().unwrap()).unwrap();
    assert_eq!(
      encoded,
      json!({ "type": "forwarded_signal", "from": "client_peer", "payload": { "sdp": "v=0" } })
    );

    let metadata = SignalEnvelope::SessionMetadata {
      proxying_id: "abcdefghijklmnop".into(),
    };
    let encoded: serde_json::Value = serde_json::from_str(&metadata.encode().unwrap()).unwrap();
    assert_eq!(
      encoded,
      json!({ "type": "session_metadata", "proxying_id": "abcdefghijklmnop" })
    );
  }

  #[test]
  fn decodes_tagged_envelopes() {
    let decoded = SignalEnvelope::decode(
      r#"{"type":"forwarded_signal","from":"server_peer","payload":[1,2,3]}"#,
    )
    .unwrap();
    assert_eq!(
      decoded,
      SignalEnvelope::ForwardedSignal {
        from: PeerRole::ServerPeer,
        payload: TransportSignal::new(json!([1, 2, 3])),
      }
    );
  }

  #[test]
  fn untagged_envelopes_are_rejected() {
    // The legacy shape was distinguished by field presence alone
    let legacy = r#"{"proxyingId":"abcdefghijklmnop"}"#;
    assert!(matches!(
      SignalEnvelope::decode(legacy),
      Err(SignalError::Malformed(_))
    ));
    let unknown = r#"{"type":"mystery","proxying_id":"x"}"#;
    assert!(matches!(
      SignalEnvelope::decode(unknown),
      Err(SignalError::Malformed(_))
    ));
  }
}
