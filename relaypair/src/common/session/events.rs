// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Updates a session reports to its owner

use serde::Serialize;

use super::state::ConnectionStateSnapshot;
use crate::common::protocol::SignalEnvelope;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionUpdate {
  /// An envelope which the owner must deliver to the remote over the signaling channel
  SignallingMessage(SignalEnvelope),
  StartGiving,
  StopGiving,
  StopGetting {
    /// Set when getting ended while access was established, rather than by request
    error: bool,
  },
  ReproxyError,
  ReproxyWorking,
  State(ConnectionStateSnapshot),
}

impl SessionUpdate {
  pub fn is_state(&self) -> bool {
    matches!(self, Self::State(_))
  }
}

/// Receiver of session updates, supplied by the session's owner
///
/// Emission must not block and must not call back into the emitting session.
pub trait UpdateSink: Send + Sync {
  fn emit(&self, update: SessionUpdate);
}

impl UpdateSink for tokio::sync::mpsc::UnboundedSender<SessionUpdate> {
  fn emit(&self, update: SessionUpdate) {
    if self.send(update).is_err() {
      tracing::trace!("Session update dropped; receiver closed");
    }
  }
}

impl UpdateSink for tokio::sync::broadcast::Sender<SessionUpdate> {
  fn emit(&self, update: SessionUpdate) {
    // Ignore error as it occurs only when no receivers exist to read the event
    let _ = self.send(update);
  }
}

#[cfg(test)]
mod tests {
  use super::{SessionUpdate, UpdateSink};
  use crate::common::session::state::ConnectionStateSnapshot;

  #[test]
  fn updates_serialize_with_their_kind() {
    let encoded = serde_json::to_value(SessionUpdate::StopGetting { error: true }).unwrap();
    assert_eq!(
      encoded,
      serde_json::json!({ "kind": "STOP_GETTING", "payload": { "error": true } })
    );
    let encoded = serde_json::to_value(SessionUpdate::State(ConnectionStateSnapshot::default()))
      .unwrap();
    assert_eq!(encoded["payload"]["gettingState"], "NONE");
    assert_eq!(encoded["payload"]["activeEndpoint"], serde_json::Value::Null);
  }

  #[test]
  fn broadcast_sink_tolerates_missing_receivers() {
    let (sender, _) = tokio::sync::broadcast::channel::<SessionUpdate>(4);
    sender.emit(SessionUpdate::StartGiving);
    let mut receiver = sender.subscribe();
    sender.emit(SessionUpdate::StopGiving);
    assert_eq!(receiver.try_recv().unwrap(), SessionUpdate::StopGiving);
  }
}
