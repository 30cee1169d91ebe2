// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The connection session: lifecycle coordinator for one remote peer
//!
//! A session owns at most one sharing engine (we relay for the remote) and at most one
//! getting engine (the remote relays for us). Each role moves through its own state
//! machine; the two never block one another.
//!
//! Start operations check their preconditions synchronously and return the misuse as
//! an error right away; the asynchronous outcome is the returned future. All state lives
//! behind one mutex which is never held across an await nor while emitting updates.
//! Background tasks hold only a [`Weak`] reference to the session plus the generation of
//! the engine they watch, so stragglers from a replaced engine cannot touch its successor.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::{
  future::{self, BoxFuture},
  FutureExt, StreamExt,
};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
  common::{
    metrics::{ByteDirection, MetricsReporter, MetricsSink, SessionCounter},
    protocol::{
      PeerRole, ProtocolVersion, RandomLowercaseGenerator, Route, SessionIdGenerator,
      SignalEnvelope, SignalRouter, VersionNegotiator,
    },
    transport::{
      status, Endpoint, EngineEvent, GettingConfig, GettingEngine, PortMapper, SharingEngine,
      TransportFactory,
    },
  },
  util::latch::Latch,
};

pub mod barrier;
pub mod config;
pub mod error;
pub mod events;
pub mod state;

pub use barrier::{BarrierSuperseded, SharerBarrier};
pub use config::SessionConfig;
pub use error::{SessionError, SessionMisuse};
pub use events::{SessionUpdate, UpdateSink};
pub use state::{ConnectionStateSnapshot, GettingState, SharingState};

use barrier::BarrierSlot;


#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum EngineRole {
  Sharing,
  Getting,
}

impl EngineRole {
  /// The role our engine speaks as when its signals reach the remote
  fn outbound_peer_role(self) -> PeerRole {
    match self {
      Self::Sharing => PeerRole::ServerPeer,
      Self::Getting => PeerRole::ClientPeer,
    }
  }
}

struct ActiveSharer {
  generation: u64,
  engine: Arc<dyn SharingEngine>,
  cleaned_up: Latch,
}

struct ActiveGetter {
  generation: u64,
  engine: Arc<dyn GettingEngine>,
}

#[derive(Default)]
struct SessionState {
  sharing: SharingState,
  getting: GettingState,
  sharer: Option<ActiveSharer>,
  getter: Option<ActiveGetter>,
  active_endpoint: Option<Endpoint>,
  proxying_id: Option<String>,
  last_generation: u64,
}

impl SessionState {
  fn next_generation(&mut self) -> u64 {
    self.last_generation += 1;
    self.last_generation
  }

  fn is_current(&self, role: EngineRole, generation: u64) -> bool {
    match role {
      EngineRole::Sharing => self.sharer.as_ref().map(|s| s.generation) == Some(generation),
      EngineRole::Getting => self.getter.as_ref().map(|g| g.generation) == Some(generation),
    }
  }
}

pub struct ConnectionSession<TTransport: ?Sized> {
  config: SessionConfig,
  transport: Arc<TTransport>,
  updates: Arc<dyn UpdateSink>,
  port_mapper: Option<Arc<dyn PortMapper>>,
  id_generator: Arc<dyn SessionIdGenerator + Send + Sync>,
  metrics: MetricsReporter,
  barrier: BarrierSlot,
  span: tracing::Span,
  state: Mutex<SessionState>,
}

impl<TTransport: ?Sized> ConnectionSession<TTransport> {
  pub fn new(
    config: SessionConfig,
    transport: Arc<TTransport>,
    updates: Arc<dyn UpdateSink>,
  ) -> Self {
    let span = tracing::span!(
      tracing::Level::INFO,
      "connection_session",
      peer = config.peer_id.as_deref().unwrap_or("<unidentified>")
    );
    Self {
      config,
      transport,
      updates,
      port_mapper: None,
      id_generator: Arc::new(RandomLowercaseGenerator),
      metrics: MetricsReporter::new(None),
      barrier: BarrierSlot::new(),
      span,
      state: Mutex::new(SessionState::default()),
    }
  }

  pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
    self.metrics = MetricsReporter::new(Some(sink));
    self
  }

  pub fn with_port_mapper(mut self, port_mapper: Arc<dyn PortMapper>) -> Self {
    self.port_mapper = Some(port_mapper);
    self
  }

  pub fn with_id_generator(
    mut self,
    id_generator: Arc<dyn SessionIdGenerator + Send + Sync>,
  ) -> Self {
    self.id_generator = id_generator;
    self
  }

  pub fn peer_id(&self) -> Option<&str> {
    self.config.peer_id.as_deref()
  }

  pub fn config(&self) -> &SessionConfig {
    &self.config
  }

  pub fn metrics(&self) -> &MetricsReporter {
    &self.metrics
  }

  pub fn span(&self) -> &tracing::Span {
    &self.span
  }

  pub fn current_state(&self) -> ConnectionStateSnapshot {
    let state = self.lock_state();
    ConnectionStateSnapshot {
      bytes_sent: self.metrics.bytes_sent(),
      bytes_received: self.metrics.bytes_received(),
      getting_state: state.getting,
      sharing_state: state.sharing,
      active_endpoint: state.active_endpoint,
    }
  }

  /// The correlation id of the current getting attempt, or of the remote's attempt
  /// through us, whichever was recorded last
  pub fn proxying_id(&self) -> Option<String> {
    self.lock_state().proxying_id.clone()
  }

  /// The barrier a signal arriving now would wait on
  pub fn sharer_created(&self) -> Arc<SharerBarrier> {
    self.barrier.current()
  }

  /// Replaces the sharer barrier with a fresh one that fires only for the next sharer
  pub fn rearm_sharer_barrier(&self) -> Arc<SharerBarrier> {
    self.barrier.rearm()
  }

  fn lock_state(&self) -> MutexGuard<'_, SessionState> {
    self.state.lock().expect("Mutex poisoned")
  }

  fn emit(&self, update: SessionUpdate) {
    self.updates.emit(update)
  }

  fn emit_state(&self) {
    let snapshot = self.current_state();
    self.emit(SessionUpdate::State(snapshot))
  }
}

impl<TTransport> ConnectionSession<TTransport>
where
  TTransport: TransportFactory + ?Sized + 'static,
{
  /// Begins sharing access with the remote peer
  ///
  /// Fails immediately if a sharing engine exists. The returned future settles once the
  /// engine reports readiness or fails to; readiness is processed even if it is dropped.
  pub fn start_share(
    self: &Arc<Self>,
    remote_version: ProtocolVersion,
  ) -> Result<BoxFuture<'static, Result<(), SessionError>>, SessionMisuse> {
    let _entered = self.span.enter();
    let strategy = VersionNegotiator::sharing_strategy(remote_version);
    let (generation, engine, events, barrier) = {
      let mut state = self.lock_state();
      if state.sharer.is_some() {
        tracing::error!("Sharing start requested while a sharing engine exists");
        return Err(SessionMisuse::SharerExists);
      }
      let spawned = self
        .transport
        .peer_connection(&strategy, PeerRole::ServerPeer, self.port_mapper.as_ref())
        .and_then(|connection| {
          self
            .transport
            .sharing_engine(connection, self.config.sharing.clone())
        });
      let spawned = match spawned {
        Ok(spawned) => spawned,
        Err(e) => {
          tracing::warn!(error = %e, ?strategy, "Sharing engine construction failed");
          return Ok(future::ready(Err(SessionError::Transport(e))).boxed());
        }
      };
      let generation = state.next_generation();
      state.sharer = Some(ActiveSharer {
        generation,
        engine: Arc::clone(&spawned.engine),
        cleaned_up: Latch::new(),
      });
      state.sharing = SharingState::TryingToShareAccess;
      // Only the barrier current at install time belongs to this sharer
      let barrier = self.barrier.current();
      (generation, spawned.engine, spawned.events, barrier)
    };
    tracing::info!(%remote_version, ?strategy, "Trying to share access");

    self.spawn_event_pump(EngineRole::Sharing, generation, events);
    self.emit_state();
    barrier.fire();
    self.spawn_sharer_cleanup(generation, engine.on_stopped());
    Ok(self.spawn_sharer_readiness(generation, engine))
  }

  fn spawn_sharer_readiness(
    self: &Arc<Self>,
    generation: u64,
    engine: Arc<dyn SharingEngine>,
  ) -> BoxFuture<'static, Result<(), SessionError>> {
    let session = Arc::downgrade(self);
    let readiness = async move {
      let ready = engine.on_ready().await;
      let session = match session.upgrade() {
        Some(session) => session,
        None => return ready.map_err(SessionError::SharingStartFailure),
      };
      match ready {
        Ok(()) => {
          let promoted = {
            let mut state = session.lock_state();
            let promote = state.is_current(EngineRole::Sharing, generation)
              && state.sharing == SharingState::TryingToShareAccess;
            if promote {
              state.sharing = SharingState::SharingAccess;
            }
            promote
          };
          if promoted {
            tracing::info!("Sharing access");
            session.emit(SessionUpdate::StartGiving);
            session.emit_state();
          } else {
            tracing::debug!("Sharing engine became ready after sharing was stopped");
          }
          Ok(())
        }
        Err(cause) => {
          tracing::warn!(error = %cause, "Sharing engine failed to become ready");
          let current = session
            .lock_state()
            .is_current(EngineRole::Sharing, generation);
          if current {
            session.stop_share().await;
          }
          Err(SessionError::SharingStartFailure(cause))
        }
      }
    };
    join_session_task(tokio::task::spawn(readiness.instrument(self.span.clone())))
  }

  /// Runs once the sharing engine has fully torn down, whoever initiated it
  fn spawn_sharer_cleanup(self: &Arc<Self>, generation: u64, stopped: BoxFuture<'static, ()>) {
    let session = Arc::downgrade(self);
    let cleanup = async move {
      stopped.await;
      let session = match session.upgrade() {
        Some(session) => session,
        None => return,
      };
      let cleaned_up = {
        let mut state = session.lock_state();
        if !state.is_current(EngineRole::Sharing, generation) {
          return;
        }
        state.sharing = SharingState::None;
        state.sharer.take().map(|sharer| sharer.cleaned_up)
      };
      session.metrics.reset_bytes();
      tracing::info!("Stopped sharing access");
      session.emit(SessionUpdate::StopGiving);
      session.emit_state();
      if let Some(cleaned_up) = cleaned_up {
        cleaned_up.fire();
      }
    };
    tokio::task::spawn(cleanup.instrument(self.span.clone()));
  }

  /// Stops sharing; resolves once the sharing engine is gone and its cleanup reported
  pub fn stop_share(self: &Arc<Self>) -> BoxFuture<'static, ()> {
    let session = Arc::clone(self);
    async move {
      let sharer = {
        let mut state = session.lock_state();
        if state.sharing == SharingState::None {
          tracing::warn!("Sharing stop requested while not sharing");
          return;
        }
        state.sharing = SharingState::None;
        state
          .sharer
          .as_ref()
          .map(|sharer| (Arc::clone(&sharer.engine), sharer.cleaned_up.listener()))
      };
      session.emit_state();
      if let Some((engine, cleaned_up)) = sharer {
        engine.stop().await;
        cleaned_up.wait_owned().await;
      }
    }
    .instrument(self.span.clone())
    .boxed()
  }

  /// Replaces the sharing engine in response to a fresh sharing offer
  ///
  /// The sharer barrier is re-armed before this returns, so signals handed to
  /// [`Self::handle_signal_when_sharer_created`] from now on wait for the new engine.
  pub fn restart_share(
    self: &Arc<Self>,
    remote_version: ProtocolVersion,
  ) -> BoxFuture<'static, Result<(), SessionError>> {
    self.barrier.rearm();
    let session = Arc::clone(self);
    async move {
      session.stop_share().await;
      // A stop requested elsewhere may still be tearing the old engine down
      let lingering = session
        .lock_state()
        .sharer
        .as_ref()
        .map(|sharer| sharer.cleaned_up.listener());
      if let Some(cleaned_up) = lingering {
        cleaned_up.wait_owned().await;
      }
      session.start_share(remote_version)?.await
    }
    .instrument(self.span.clone())
    .boxed()
  }

  /// Begins getting access through the remote peer
  ///
  /// Fails immediately if getting is underway or its previous engine still exists. The
  /// returned future yields the local proxy endpoint; its failures are deliberately
  /// generic, with the underlying cause only logged.
  pub fn start_get(
    self: &Arc<Self>,
    remote_version: ProtocolVersion,
  ) -> Result<BoxFuture<'static, Result<Endpoint, SessionError>>, SessionMisuse> {
    let _entered = self.span.enter();
    let local_version = self.config.local_protocol_version;
    let strategy = VersionNegotiator::getting_strategy(local_version, remote_version);
    let (proxying_id, constructed) = {
      let mut state = self.lock_state();
      if state.getting != GettingState::None {
        tracing::error!(getting = ?state.getting, "Getting start requested while already getting");
        return Err(SessionMisuse::GetterActive);
      }
      if state.getter.is_some() {
        tracing::error!("Getting start requested while a getting engine still exists");
        return Err(SessionMisuse::GetterExists);
      }
      let proxying_id = self.id_generator.generate();
      state.proxying_id = Some(proxying_id.clone());
      let config = GettingConfig {
        listen_addr: self.config.listen_addr,
        proxying_id: proxying_id.clone(),
      };
      let constructed = self
        .transport
        .peer_connection(&strategy, PeerRole::ClientPeer, self.port_mapper.as_ref())
        .and_then(|connection| self.transport.getting_engine(connection, config))
        .map(|spawned| {
          let generation = state.next_generation();
          state.getter = Some(ActiveGetter {
            generation,
            engine: Arc::clone(&spawned.engine),
          });
          state.getting = GettingState::TryingToGetAccess;
          (generation, spawned)
        });
      (proxying_id, constructed)
    };

    self.emit(SessionUpdate::SignallingMessage(SignalRouter::metadata(
      proxying_id.clone(),
    )));
    let (generation, spawned) = match constructed {
      Ok(constructed) => constructed,
      Err(e) => {
        tracing::warn!(error = %e, %proxying_id, "Getting engine construction failed");
        return Ok(future::ready(Err(SessionError::ProxyStartFailure)).boxed());
      }
    };
    tracing::info!(
      %proxying_id,
      common_version = %VersionNegotiator::common_version(local_version, remote_version),
      ?strategy,
      "Trying to get access"
    );

    self.spawn_event_pump(EngineRole::Getting, generation, spawned.events);
    self.emit_state();
    self.metrics.increment(SessionCounter::Attempt);
    self.spawn_getter_stopping(generation, spawned.engine.on_stopping());
    Ok(self.spawn_getter_listening(generation, spawned.engine))
  }

  fn spawn_getter_listening(
    self: &Arc<Self>,
    generation: u64,
    engine: Arc<dyn GettingEngine>,
  ) -> BoxFuture<'static, Result<Endpoint, SessionError>> {
    let session = Arc::downgrade(self);
    let listening = async move {
      let listening = engine.on_listening().await;
      let session = session.upgrade().ok_or(SessionError::ProxyStartFailure)?;
      match listening {
        Ok(endpoint) => {
          let promoted = {
            let mut state = session.lock_state();
            let promote = state.is_current(EngineRole::Getting, generation)
              && state.getting == GettingState::TryingToGetAccess;
            if promote {
              state.getting = GettingState::GettingAccess;
              state.active_endpoint = Some(endpoint);
            }
            promote
          };
          if !promoted {
            tracing::debug!(%endpoint, "Getting engine began listening after getting was stopped");
            return Err(SessionError::ProxyStartFailure);
          }
          session.metrics.increment(SessionCounter::Success);
          tracing::info!(%endpoint, "Getting access");
          session.emit_state();
          Ok(endpoint)
        }
        Err(cause) => {
          tracing::warn!(error = %cause, "Getting engine failed to start");
          let reset = {
            let mut state = session.lock_state();
            let reset = state.is_current(EngineRole::Getting, generation);
            if reset {
              state.getting = GettingState::None;
            }
            reset
          };
          if reset {
            session.emit_state();
          }
          Err(SessionError::ProxyStartFailure)
        }
      }
    };
    join_session_task(tokio::task::spawn(listening.instrument(self.span.clone())))
  }

  /// Reacts to the getting engine beginning teardown, whoever initiated it
  fn spawn_getter_stopping(self: &Arc<Self>, generation: u64, stopping: BoxFuture<'static, ()>) {
    let session = Arc::downgrade(self);
    let teardown = async move {
      stopping.await;
      let session = match session.upgrade() {
        Some(session) => session,
        None => return,
      };
      let was_getting = {
        let mut state = session.lock_state();
        if !state.is_current(EngineRole::Getting, generation) {
          return;
        }
        let was_getting = state.getting == GettingState::GettingAccess;
        state.getting = GettingState::None;
        state.getter = None;
        state.active_endpoint = None;
        was_getting
      };
      if was_getting {
        tracing::warn!("Getting engine stopped unexpectedly");
      } else {
        tracing::info!("Stopped getting access");
      }
      session.emit(SessionUpdate::StopGetting { error: was_getting });
      session.metrics.reset_bytes();
      session.emit_state();
    };
    tokio::task::spawn(teardown.instrument(self.span.clone()));
  }

  /// Stops getting; resolves once the getting engine has stopped
  pub fn stop_get(self: &Arc<Self>) -> BoxFuture<'static, ()> {
    let session = Arc::clone(self);
    async move {
      let engine = {
        let mut state = session.lock_state();
        if state.getting == GettingState::None {
          tracing::warn!("Getting stop requested while not getting");
          return;
        }
        state.getting = GettingState::None;
        state
          .getter
          .as_ref()
          .map(|getter| Arc::clone(&getter.engine))
      };
      session.metrics.increment(SessionCounter::Stop);
      session.emit_state();
      if let Some(engine) = engine {
        engine.stop().await;
      }
    }
    .instrument(self.span.clone())
    .boxed()
  }

  /// Routes an inbound signaling envelope to the engine or metadata it addresses
  ///
  /// Signals for a role without an engine are logged and dropped.
  pub fn handle_signal(self: &Arc<Self>, envelope: SignalEnvelope) -> BoxFuture<'static, ()> {
    let session = Arc::clone(self);
    async move {
      match SignalRouter::route(envelope) {
        Route::Sharer(payload) => {
          let sharer = session
            .lock_state()
            .sharer
            .as_ref()
            .map(|sharer| Arc::clone(&sharer.engine));
          match sharer {
            Some(sharer) => {
              if let Err(e) = sharer.handle_signal(payload).await {
                tracing::warn!(error = %e, "Sharing engine rejected signal");
              }
            }
            None => tracing::warn!("Dropping client peer signal; no sharing engine exists"),
          }
        }
        Route::Getter(payload) => {
          let getter = session
            .lock_state()
            .getter
            .as_ref()
            .map(|getter| Arc::clone(&getter.engine));
          match getter {
            Some(getter) => {
              if let Err(e) = getter.handle_signal(payload).await {
                tracing::warn!(error = %e, "Getting engine rejected signal");
              }
            }
            None => tracing::warn!("Dropping server peer signal; no getting engine exists"),
          }
        }
        Route::Metadata { proxying_id } => {
          tracing::info!(%proxying_id, "Remote began proxying through us");
          session.lock_state().proxying_id = Some(proxying_id);
        }
      }
    }
    .instrument(self.span.clone())
    .boxed()
  }

  /// Delivers an envelope once a sharer exists for the barrier current at call time
  ///
  /// If the barrier is replaced before any sharer is created, the envelope is dropped.
  pub fn handle_signal_when_sharer_created(
    self: &Arc<Self>,
    envelope: SignalEnvelope,
  ) -> BoxFuture<'static, ()> {
    let barrier = self.barrier.current();
    let session = Arc::clone(self);
    async move {
      match barrier.wait().await {
        Ok(()) => session.handle_signal(envelope).await,
        Err(superseded) => {
          tracing::warn!(error = %superseded, "Dropping signal held for a replaced sharer");
        }
      }
    }
    .instrument(self.span.clone())
    .boxed()
  }

  fn spawn_event_pump(
    self: &Arc<Self>,
    role: EngineRole,
    generation: u64,
    mut events: futures::stream::BoxStream<'static, EngineEvent>,
  ) {
    let session: Weak<Self> = Arc::downgrade(self);
    let pump = async move {
      while let Some(event) = events.next().await {
        let session = match session.upgrade() {
          Some(session) => session,
          None => break,
        };
        let current = session.lock_state().is_current(role, generation);
        if !current {
          tracing::debug!(?role, ?event, "Dropping event from a replaced engine");
          continue;
        }
        session.handle_engine_event(role, event);
      }
      tracing::trace!(?role, generation, "Engine event stream ended");
    };
    tokio::task::spawn(pump.instrument(self.span.clone()));
  }

  fn handle_engine_event(self: &Arc<Self>, role: EngineRole, event: EngineEvent) {
    match event {
      EngineEvent::Signal(payload) => self.emit(SessionUpdate::SignallingMessage(
        SignalRouter::outbound(role.outbound_peer_role(), payload),
      )),
      EngineEvent::BytesSent(count) => self.record_bytes(ByteDirection::Sent, count),
      EngineEvent::BytesReceived(count) => self.record_bytes(ByteDirection::Received, count),
      EngineEvent::Status(status::REPROXY_ERROR) => {
        tracing::warn!("Reproxy endpoint is failing");
        self.emit(SessionUpdate::ReproxyError)
      }
      EngineEvent::Status(status::REPROXY_WORKING) => self.emit(SessionUpdate::ReproxyWorking),
      EngineEvent::Status(code) => {
        tracing::warn!(?role, code, "Dropping unrecognized engine status");
      }
    }
  }

  fn record_bytes(self: &Arc<Self>, direction: ByteDirection, count: u64) {
    let session = Arc::downgrade(self);
    self.metrics.record_bytes(direction, count, move || {
      if let Some(session) = session.upgrade() {
        session.emit_state();
      }
    });
  }
}

impl<TTransport: ?Sized> Drop for ConnectionSession<TTransport> {
  fn drop(&mut self) {
    let state = match self.state.get_mut() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    let stopping: Vec<BoxFuture<'static, ()>> = state
      .sharer
      .take()
      .map(|sharer| sharer.engine.stop())
      .into_iter()
      .chain(state.getter.take().map(|getter| getter.engine.stop()))
      .collect();
    if stopping.is_empty() {
      return;
    }
    tracing::debug!(parent: &self.span, "Session dropped with live engines; stopping them");
    // Engines begin teardown on request; completion is only awaited if a runtime exists
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
      runtime.spawn(future::join_all(stopping));
    }
  }
}

fn join_session_task<T: Send + 'static>(
  task: JoinHandle<Result<T, SessionError>>,
) -> BoxFuture<'static, Result<T, SessionError>> {
  task
    .map(|joined| match joined {
      Ok(result) => result,
      Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
      Err(_) => Err(SessionError::TaskAborted),
    })
    .boxed()
}
