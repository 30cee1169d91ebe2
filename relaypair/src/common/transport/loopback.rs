// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-memory engines which never touch the network
//!
//! Every engine built by a [`LoopbackTransport`] is announced as a [`LoopbackHandle`],
//! through which a test (or the CLI demo) drives its lifecycle: readiness, byte counts,
//! outbound signals and teardown. With the handshake enabled, engines additionally
//! complete an offer/answer exchange on their own once signals are relayed between two
//! sessions.

use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
};

use futures::{
  future::{self, BoxFuture, Shared},
  FutureExt, StreamExt,
};
use serde_json::json;
use tokio::sync::{
  mpsc::{self, UnboundedReceiver, UnboundedSender},
  oneshot, Notify,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
  Endpoint, EngineError, EngineEvent, GettingConfig, GettingEngine, PortMapper, RoleEngine,
  SharingConfig, SharingEngine, SpawnedEngine, TransportError, TransportFactory,
};
use crate::{
  common::protocol::{PeerRole, TransportSignal, TransportStrategy},
  util::latch::Latch,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
  Sharing,
  Getting,
}

pub struct LoopbackConnection {
  strategy: TransportStrategy,
  role: PeerRole,
}

pub struct LoopbackTransport {
  handshake: bool,
  fail_next_construction: AtomicBool,
  created: UnboundedSender<LoopbackHandle>,
}

impl LoopbackTransport {
  /// A transport whose engines only move when driven through their handles
  pub fn scripted() -> (Self, UnboundedReceiver<LoopbackHandle>) {
    Self::build(false)
  }

  /// A transport whose engines complete an offer/answer handshake over relayed signals
  pub fn with_handshake() -> (Self, UnboundedReceiver<LoopbackHandle>) {
    Self::build(true)
  }

  fn build(handshake: bool) -> (Self, UnboundedReceiver<LoopbackHandle>) {
    let (created, handles) = mpsc::unbounded_channel();
    (
      Self {
        handshake,
        fail_next_construction: AtomicBool::new(false),
        created,
      },
      handles,
    )
  }

  /// Makes the next peer connection construction fail
  pub fn fail_next_construction(&self) {
    self.fail_next_construction.store(true, Ordering::Release);
  }

  fn announce(&self, engine: &Arc<LoopbackEngine>) {
    // Nobody watching for handles is fine; the engine still works
    let _ = self.created.send(LoopbackHandle(Arc::clone(engine)));
  }
}

impl TransportFactory for LoopbackTransport {
  type PeerConnection = LoopbackConnection;

  fn peer_connection(
    &self,
    strategy: &TransportStrategy,
    role: PeerRole,
    _port_mapper: Option<&Arc<dyn PortMapper>>,
  ) -> Result<Self::PeerConnection, TransportError> {
    if self.fail_next_construction.swap(false, Ordering::AcqRel) {
      return Err(TransportError::Construction(
        "loopback construction failure requested".into(),
      ));
    }
    Ok(LoopbackConnection {
      strategy: strategy.clone(),
      role,
    })
  }

  fn sharing_engine(
    &self,
    connection: Self::PeerConnection,
    config: SharingConfig,
  ) -> Result<SpawnedEngine<dyn SharingEngine>, TransportError> {
    let (engine, events) = LoopbackEngine::new(
      EngineKind::Sharing,
      connection,
      Setup::Sharing(config),
      self.handshake,
    );
    self.announce(&engine);
    Ok(SpawnedEngine {
      engine: engine as Arc<dyn SharingEngine>,
      events: UnboundedReceiverStream::new(events).boxed(),
    })
  }

  fn getting_engine(
    &self,
    connection: Self::PeerConnection,
    config: GettingConfig,
  ) -> Result<SpawnedEngine<dyn GettingEngine>, TransportError> {
    let proxying_id = config.proxying_id.clone();
    let (engine, events) = LoopbackEngine::new(
      EngineKind::Getting,
      connection,
      Setup::Getting(config),
      self.handshake,
    );
    if self.handshake {
      engine.emit(EngineEvent::Signal(TransportSignal::new(json!({
        "kind": "offer",
        "proxying_id": proxying_id,
      }))));
    }
    self.announce(&engine);
    Ok(SpawnedEngine {
      engine: engine as Arc<dyn GettingEngine>,
      events: UnboundedReceiverStream::new(events).boxed(),
    })
  }
}

enum Setup {
  Sharing(SharingConfig),
  Getting(GettingConfig),
}

type ReadyFuture = Shared<BoxFuture<'static, Result<(), EngineError>>>;

pub struct LoopbackEngine {
  kind: EngineKind,
  strategy: TransportStrategy,
  role: PeerRole,
  setup: Setup,
  handshake: bool,
  events: Mutex<Option<UnboundedSender<EngineEvent>>>,
  received: Mutex<Vec<TransportSignal>>,
  signal_arrived: Notify,
  ready_tx: Mutex<Option<oneshot::Sender<Result<(), EngineError>>>>,
  ready: ReadyFuture,
  stopping: Latch,
  stopped: Latch,
}

impl LoopbackEngine {
  fn new(
    kind: EngineKind,
    connection: LoopbackConnection,
    setup: Setup,
    handshake: bool,
  ) -> (Arc<Self>, UnboundedReceiver<EngineEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let ready = ready_rx
      .map(|res| res.unwrap_or(Err(EngineError::Stopped)))
      .boxed()
      .shared();
    let engine = Arc::new(Self {
      kind,
      strategy: connection.strategy,
      role: connection.role,
      setup,
      handshake,
      events: Mutex::new(Some(events_tx)),
      received: Mutex::new(Vec::new()),
      signal_arrived: Notify::new(),
      ready_tx: Mutex::new(Some(ready_tx)),
      ready,
      stopping: Latch::new(),
      stopped: Latch::new(),
    });
    (engine, events_rx)
  }

  fn emit(&self, event: EngineEvent) -> bool {
    match &*self.events.lock().expect("Mutex poisoned") {
      Some(events) => events.send(event).is_ok(),
      None => false,
    }
  }

  fn resolve_ready(&self, result: Result<(), EngineError>) -> bool {
    let ready_tx = self.ready_tx.lock().expect("Mutex poisoned").take();
    match ready_tx {
      Some(ready_tx) => ready_tx.send(result).is_ok(),
      None => false,
    }
  }

  fn endpoint(&self) -> Option<Endpoint> {
    match &self.setup {
      Setup::Getting(config) => Some(Endpoint::from(config.listen_addr)),
      Setup::Sharing(_) => None,
    }
  }

  fn begin_stopping(&self) {
    self.stopping.fire();
    self.resolve_ready(Err(EngineError::Stopped));
    self.events.lock().expect("Mutex poisoned").take();
  }

  fn finish_stopping(&self) {
    self.stopped.fire();
  }

  fn halt(&self) {
    self.begin_stopping();
    self.finish_stopping();
  }

  fn handshake_step(&self, signal: &TransportSignal) {
    let kind = signal.value().get("kind").and_then(|k| k.as_str());
    match (self.kind, kind) {
      (EngineKind::Sharing, Some("offer")) => {
        self.emit(EngineEvent::Signal(TransportSignal::new(
          json!({ "kind": "answer" }),
        )));
        self.resolve_ready(Ok(()));
      }
      (EngineKind::Getting, Some("answer")) => {
        self.resolve_ready(Ok(()));
      }
      _ => {
        tracing::trace!(?kind, "Loopback engine ignored signal during handshake");
      }
    }
  }
}

impl RoleEngine for LoopbackEngine {
  fn handle_signal(&self, signal: TransportSignal) -> BoxFuture<'static, Result<(), EngineError>> {
    if self.stopping.is_fired() {
      return future::ready(Err(EngineError::SignalRejected(
        "engine is stopping".into(),
      )))
      .boxed();
    }
    if self.handshake {
      self.handshake_step(&signal);
    }
    self.received.lock().expect("Mutex poisoned").push(signal);
    self.signal_arrived.notify_waiters();
    future::ready(Ok(())).boxed()
  }

  fn on_stopping(&self) -> BoxFuture<'static, ()> {
    self.stopping.wait_owned().boxed()
  }

  fn on_stopped(&self) -> BoxFuture<'static, ()> {
    self.stopped.wait_owned().boxed()
  }

  fn stop(&self) -> BoxFuture<'static, ()> {
    self.halt();
    self.stopped.wait_owned().boxed()
  }
}

impl SharingEngine for LoopbackEngine {
  fn on_ready(&self) -> BoxFuture<'static, Result<(), EngineError>> {
    self.ready.clone().boxed()
  }
}

impl GettingEngine for LoopbackEngine {
  fn on_listening(&self) -> BoxFuture<'static, Result<Endpoint, EngineError>> {
    let endpoint = self.endpoint();
    self
      .ready
      .clone()
      .map(move |res| res.and_then(|()| endpoint.ok_or(EngineError::Stopped)))
      .boxed()
  }
}

/// Test-side control over a [`LoopbackEngine`]
#[derive(Clone)]
pub struct LoopbackHandle(Arc<LoopbackEngine>);

impl LoopbackHandle {
  pub fn kind(&self) -> EngineKind {
    self.0.kind
  }

  pub fn role(&self) -> PeerRole {
    self.0.role
  }

  pub fn strategy(&self) -> &TransportStrategy {
    &self.0.strategy
  }

  pub fn sharing_config(&self) -> Option<&SharingConfig> {
    match &self.0.setup {
      Setup::Sharing(config) => Some(config),
      Setup::Getting(_) => None,
    }
  }

  pub fn listen_addr(&self) -> Option<SocketAddr> {
    match &self.0.setup {
      Setup::Getting(config) => Some(config.listen_addr),
      Setup::Sharing(_) => None,
    }
  }

  pub fn proxying_id(&self) -> Option<&str> {
    match &self.0.setup {
      Setup::Getting(config) => Some(&config.proxying_id),
      Setup::Sharing(_) => None,
    }
  }

  /// Reports readiness; returns false if readiness was already settled
  pub fn complete_ready(&self) -> bool {
    self.0.resolve_ready(Ok(()))
  }

  pub fn fail_ready(&self, error: EngineError) -> bool {
    self.0.resolve_ready(Err(error))
  }

  pub fn send_signal(&self, value: serde_json::Value) -> bool {
    self.0.emit(EngineEvent::Signal(TransportSignal::new(value)))
  }

  pub fn record_bytes_sent(&self, count: u64) -> bool {
    self.0.emit(EngineEvent::BytesSent(count))
  }

  pub fn record_bytes_received(&self, count: u64) -> bool {
    self.0.emit(EngineEvent::BytesReceived(count))
  }

  pub fn report_status(&self, code: u16) -> bool {
    self.0.emit(EngineEvent::Status(code))
  }

  /// A sender for this engine's events that survives teardown, as a straggling worker
  /// task would hold; `None` once the engine has begun stopping
  pub fn straggler_events(&self) -> Option<UnboundedSender<EngineEvent>> {
    self.0.events.lock().expect("Mutex poisoned").clone()
  }

  pub fn received_signals(&self) -> Vec<TransportSignal> {
    self.0.received.lock().expect("Mutex poisoned").clone()
  }

  /// Waits until at least `count` signals have been delivered to the engine
  pub async fn wait_for_signals(&self, count: usize) -> Vec<TransportSignal> {
    loop {
      let arrived = self.0.signal_arrived.notified();
      {
        let received = self.0.received.lock().expect("Mutex poisoned");
        if received.len() >= count {
          return received.clone();
        }
      }
      arrived.await;
    }
  }

  /// Begins teardown without completing it, as a remote disconnect would
  pub fn begin_stopping(&self) {
    self.0.begin_stopping()
  }

  pub fn finish_stopping(&self) {
    self.0.finish_stopping()
  }

  /// Tears the engine down entirely, as if the tunnel collapsed
  pub fn halt(&self) {
    self.0.halt()
  }

  pub fn is_stopping(&self) -> bool {
    self.0.stopping.is_fired()
  }

  pub fn is_stopped(&self) -> bool {
    self.0.stopped.is_fired()
  }
}

impl std::fmt::Debug for LoopbackHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LoopbackHandle")
      .field("kind", &self.0.kind)
      .field("role", &self.0.role)
      .field("strategy", &self.0.strategy)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::{EngineKind, LoopbackTransport};
  use crate::common::{
    protocol::{PeerRole, TransportSignal, VersionNegotiator},
    transport::{
      EngineError, EngineEvent, GettingConfig, GettingEngine, RoleEngine, SharingConfig,
      SharingEngine, TransportFactory,
    },
  };
  use futures::StreamExt;
  use serde_json::json;

  #[tokio::test]
  async fn handshake_engines_complete_offer_answer() {
    let (transport, mut handles) = LoopbackTransport::with_handshake();
    let strategy = VersionNegotiator::sharing_strategy(Default::default());

    let getter = transport
      .getting_engine(
        transport
          .peer_connection(&strategy, PeerRole::ClientPeer, None)
          .unwrap(),
        GettingConfig {
          listen_addr: "127.0.0.1:9999".parse().unwrap(),
          proxying_id: "abcdefghijklmnop".into(),
        },
      )
      .unwrap();
    let sharer = transport
      .sharing_engine(
        transport
          .peer_connection(&strategy, PeerRole::ServerPeer, None)
          .unwrap(),
        SharingConfig::default(),
      )
      .unwrap();
    assert_eq!(handles.recv().await.unwrap().kind(), EngineKind::Getting);
    assert_eq!(handles.recv().await.unwrap().kind(), EngineKind::Sharing);

    let mut getter_events = getter.events;
    let mut sharer_events = sharer.events;
    let offer = match getter_events.next().await {
      Some(EngineEvent::Signal(offer)) => offer,
      other => panic!("Expected offer, got {:?}", other),
    };
    sharer.engine.handle_signal(offer).await.unwrap();
    let answer = match sharer_events.next().await {
      Some(EngineEvent::Signal(answer)) => answer,
      other => panic!("Expected answer, got {:?}", other),
    };
    sharer.engine.on_ready().await.unwrap();
    getter.engine.handle_signal(answer).await.unwrap();
    let endpoint = getter.engine.on_listening().await.unwrap();
    assert_eq!(endpoint.port, 9999);
  }

  #[tokio::test]
  async fn stopping_settles_pending_readiness() {
    let (transport, mut handles) = LoopbackTransport::scripted();
    let strategy = VersionNegotiator::sharing_strategy(Default::default());
    let sharer = transport
      .sharing_engine(
        transport
          .peer_connection(&strategy, PeerRole::ServerPeer, None)
          .unwrap(),
        SharingConfig::default(),
      )
      .unwrap();
    let handle = handles.recv().await.unwrap();
    sharer.engine.stop().await;
    assert!(handle.is_stopping() && handle.is_stopped());
    assert_eq!(sharer.engine.on_ready().await, Err(EngineError::Stopped));
    assert!(sharer
      .engine
      .handle_signal(TransportSignal::new(json!(null)))
      .await
      .is_err());
    // The event stream closes with the engine
    assert!(sharer.events.collect::<Vec<_>>().await.is_empty());
  }

  #[test]
  fn construction_failures_are_one_shot() {
    let (transport, _handles) = LoopbackTransport::scripted();
    let strategy = VersionNegotiator::sharing_strategy(Default::default());
    transport.fail_next_construction();
    assert!(transport
      .peer_connection(&strategy, PeerRole::ServerPeer, None)
      .is_err());
    assert!(transport
      .peer_connection(&strategy, PeerRole::ServerPeer, None)
      .is_ok());
  }
}
