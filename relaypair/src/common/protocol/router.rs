// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use super::signal::{PeerRole, SignalEnvelope, TransportSignal};

/// Where an inbound envelope must be delivered within a session
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
  /// Signals from the remote's client peer drive our sharing engine
  Sharer(TransportSignal),
  /// Signals from the remote's server peer drive our getting engine
  Getter(TransportSignal),
  Metadata { proxying_id: String },
}

/// Classifies inbound signaling envelopes and addresses outbound ones
pub struct SignalRouter;

impl SignalRouter {
  pub fn route(envelope: SignalEnvelope) -> Route {
    match envelope {
      SignalEnvelope::ForwardedSignal {
        from: PeerRole::ClientPeer,
        payload,
      } => Route::Sharer(payload),
      SignalEnvelope::ForwardedSignal {
        from: PeerRole::ServerPeer,
        payload,
      } => Route::Getter(payload),
      SignalEnvelope::SessionMetadata { proxying_id } => Route::Metadata { proxying_id },
    }
  }

  /// Wraps a signal emitted by one of our engines for the remote
  ///
  /// The sharing engine speaks as the server peer and the getting engine as the client peer.
  pub fn outbound(from: PeerRole, payload: TransportSignal) -> SignalEnvelope {
    SignalEnvelope::ForwardedSignal { from, payload }
  }

  pub fn metadata(proxying_id: impl Into<String>) -> SignalEnvelope {
    SignalEnvelope::SessionMetadata {
      proxying_id: proxying_id.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{Route, SignalRouter};
  use crate::common::protocol::signal::{PeerRole, TransportSignal};
  use serde_json::json;

  #[test]
  fn routes_by_originating_role() {
    let payload = TransportSignal::new(json!({ "candidate": "a" }));
    assert_eq!(
      SignalRouter::route(SignalRouter::outbound(PeerRole::ClientPeer, payload.clone())),
      Route::Sharer(payload.clone())
    );
    assert_eq!(
      SignalRouter::route(SignalRouter::outbound(PeerRole::ServerPeer, payload.clone())),
      Route::Getter(payload)
    );
  }

  #[test]
  fn routes_metadata() {
    assert_eq!(
      SignalRouter::route(SignalRouter::metadata("qwertyuiopasdfgh")),
      Route::Metadata {
        proxying_id: "qwertyuiopasdfgh".into()
      }
    );
  }
}
