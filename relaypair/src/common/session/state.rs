// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};

use crate::common::transport::Endpoint;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GettingState {
  None,
  TryingToGetAccess,
  GettingAccess,
}

impl Default for GettingState {
  fn default() -> Self {
    Self::None
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SharingState {
  None,
  TryingToShareAccess,
  SharingAccess,
}

impl Default for SharingState {
  fn default() -> Self {
    Self::None
  }
}

/// A point-in-time view of a session, as delivered with every state update
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStateSnapshot {
  pub bytes_sent: u64,
  pub bytes_received: u64,
  pub getting_state: GettingState,
  pub sharing_state: SharingState,
  pub active_endpoint: Option<Endpoint>,
}
