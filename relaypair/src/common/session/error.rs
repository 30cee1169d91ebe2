// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use crate::common::transport::{EngineError, TransportError};

/// A caller broke a session precondition; never retried
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMisuse {
  #[error("A sharing engine already exists for this session")]
  SharerExists,
  #[error("Getting is already active or starting for this session")]
  GetterActive,
  #[error("A getting engine still exists for this session")]
  GetterExists,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SessionError {
  /// Deliberately carries no cause; the cause is logged where it occurs
  #[error("Could not start proxy")]
  ProxyStartFailure,
  #[error("Sharing engine failed to become ready")]
  SharingStartFailure(#[source] EngineError),
  #[error("Transport construction failed")]
  Transport(
    #[from]
    #[source]
    TransportError,
  ),
  #[error(transparent)]
  Misuse(#[from] SessionMisuse),
  #[error("Session task was aborted before completing")]
  TaskAborted,
}
