// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Interfaces of the tunnel engines and the layer that constructs them
//!
//! The session never touches sockets itself. It asks a [`TransportFactory`] for a peer
//! connection matching the negotiated [`TransportStrategy`], wraps that connection in a
//! role engine, and then only observes the engine through the futures and the
//! [`EngineEvent`] stream declared here.

use std::{net::SocketAddr, sync::Arc};

use futures::{future::BoxFuture, stream::BoxStream};
use serde::{Deserialize, Serialize};

use crate::common::protocol::{PeerRole, TransportSignal, TransportStrategy};

pub mod loopback;

/// Local proxy entry point exposed while getting access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
  pub address: std::net::IpAddr,
  pub port: u16,
}

impl From<SocketAddr> for Endpoint {
  fn from(addr: SocketAddr) -> Self {
    Self {
      address: addr.ip(),
      port: addr.port(),
    }
  }
}

impl From<Endpoint> for SocketAddr {
  fn from(endpoint: Endpoint) -> Self {
    SocketAddr::new(endpoint.address, endpoint.port)
  }
}

impl std::fmt::Display for Endpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", SocketAddr::from(*self))
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
  #[error("Peer connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Local listener could not be bound: {0}")]
  ListenFailed(String),
  #[error("Engine rejected signal: {0}")]
  SignalRejected(String),
  #[error("Engine stopped before becoming ready")]
  Stopped,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
  #[error("Transport strategy is not supported by this factory: {0}")]
  UnsupportedStrategy(String),
  #[error("Peer connection construction failed: {0}")]
  Construction(String),
}

/// Raw engine status codes with a meaning to the session
pub mod status {
  pub const REPROXY_ERROR: u16 = 1;
  pub const REPROXY_WORKING: u16 = 2;
}

/// Everything an engine reports asynchronously besides its lifecycle futures
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
  /// Signaling data which must reach the remote's opposite engine
  Signal(TransportSignal),
  BytesSent(u64),
  BytesReceived(u64),
  /// An engine-specific status code; see [`status`]
  Status(u16),
}

pub trait RoleEngine: Send + Sync {
  /// Delivers signaling data produced by the remote's opposite engine
  fn handle_signal(&self, signal: TransportSignal) -> BoxFuture<'static, Result<(), EngineError>>;

  /// Notifies as soon as teardown begins, before cleanup has completed
  fn on_stopping(&self) -> BoxFuture<'static, ()>;

  /// Notifies once teardown has fully completed
  fn on_stopped(&self) -> BoxFuture<'static, ()>;

  /// Requests teardown; resolves once the engine has fully stopped
  fn stop(&self) -> BoxFuture<'static, ()>;
}

/// Server-role engine relaying the remote peer's traffic to the network
pub trait SharingEngine: RoleEngine {
  fn on_ready(&self) -> BoxFuture<'static, Result<(), EngineError>>;
}

/// Client-role engine exposing a local proxy that forwards through the remote peer
pub trait GettingEngine: RoleEngine {
  /// Resolves with the local proxy entry point once it accepts connections
  fn on_listening(&self) -> BoxFuture<'static, Result<Endpoint, EngineError>>;
}

/// Optional capability for opening ports on a local gateway
pub trait PortMapper: Send + Sync {
  fn map_port(&self, internal_port: u16) -> BoxFuture<'static, Result<u16, TransportError>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
  /// Permit relaying to broadcast and multicast destinations
  pub allow_non_unicast: bool,
  /// Route shared traffic onward through this SOCKS endpoint instead of directly
  pub reproxy: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GettingConfig {
  pub listen_addr: SocketAddr,
  pub proxying_id: String,
}

/// A freshly constructed engine together with its event stream
pub struct SpawnedEngine<E: ?Sized> {
  pub engine: Arc<E>,
  pub events: BoxStream<'static, EngineEvent>,
}

/// Builds peer connections and wraps them in role engines
///
/// Construction is synchronous; engines report readiness through their futures.
pub trait TransportFactory: Send + Sync {
  type PeerConnection: Send + 'static;

  fn peer_connection(
    &self,
    strategy: &TransportStrategy,
    role: PeerRole,
    port_mapper: Option<&Arc<dyn PortMapper>>,
  ) -> Result<Self::PeerConnection, TransportError>;

  fn sharing_engine(
    &self,
    connection: Self::PeerConnection,
    config: SharingConfig,
  ) -> Result<SpawnedEngine<dyn SharingEngine>, TransportError>;

  fn getting_engine(
    &self,
    connection: Self::PeerConnection,
    config: GettingConfig,
  ) -> Result<SpawnedEngine<dyn GettingEngine>, TransportError>;
}
