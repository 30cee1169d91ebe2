// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Two sessions wired back to back in one process
//!
//! The "getter" session gets access through the "sharer" session. Every update either
//! session emits is printed as a JSON line; signaling envelopes are additionally encoded,
//! decoded, and delivered to the opposite session as a signaling server would.

use std::{
  sync::{Arc, Weak},
  time::Duration,
};

use anyhow::{Context, Result};
use relaypair::common::{
  metrics::REFRESH_INTERVAL,
  protocol::{PeerRole, ProtocolVersion, SignalEnvelope},
  session::{ConnectionSession, SessionConfig, SessionUpdate, SharingState},
  transport::loopback::LoopbackTransport,
};
use tokio::sync::mpsc;
use tracing::Instrument;

type DemoSession = ConnectionSession<LoopbackTransport>;

#[derive(Debug)]
pub struct DemoArgs {
  /// Configuration of the getting session; its peer is the sharer
  pub getter: SessionConfig,
  /// Version the sharing session advertises
  pub remote_version: ProtocolVersion,
  /// Bytes pushed through the getting engine once access is established
  pub bytes: u64,
}

pub async fn demo_main(args: DemoArgs) -> Result<()> {
  let getter_version = args.getter.local_protocol_version;
  let sharer_config = SessionConfig {
    peer_id: Some("getter".into()),
    local_protocol_version: args.remote_version,
    ..Default::default()
  };
  let getter_config = SessionConfig {
    peer_id: args.getter.peer_id.clone().or_else(|| Some("sharer".into())),
    ..args.getter
  };

  let (getter_transport, mut getter_engines) = LoopbackTransport::with_handshake();
  let (sharer_transport, _sharer_engines) = LoopbackTransport::with_handshake();
  let (getter_tx, getter_updates) = mpsc::unbounded_channel();
  let (sharer_tx, sharer_updates) = mpsc::unbounded_channel();
  let getter = Arc::new(DemoSession::new(
    getter_config,
    Arc::new(getter_transport),
    Arc::new(getter_tx),
  ));
  let sharer = Arc::new(DemoSession::new(
    sharer_config,
    Arc::new(sharer_transport),
    Arc::new(sharer_tx),
  ));

  let getter_relay = tokio::task::spawn(
    relay_updates(
      "getter",
      getter_updates,
      Arc::downgrade(&sharer),
      getter_version,
    )
    .instrument(tracing::debug_span!("relay", origin = "getter")),
  );
  let sharer_relay = tokio::task::spawn(
    relay_updates(
      "sharer",
      sharer_updates,
      Arc::downgrade(&getter),
      args.remote_version,
    )
    .instrument(tracing::debug_span!("relay", origin = "sharer")),
  );

  let endpoint = getter
    .start_get(args.remote_version)?
    .await
    .context("Getting access through the sharer")?;
  tracing::info!(%endpoint, "Local proxy endpoint is accepting connections");

  let engine = getter_engines
    .recv()
    .await
    .context("Getting engine was never announced")?;
  engine.record_bytes_sent(args.bytes);
  engine.record_bytes_received(args.bytes / 2);
  tokio::time::sleep(REFRESH_INTERVAL + Duration::from_millis(100)).await;

  getter.stop_get().await;
  sharer.stop_share().await;
  // Teardown notifications are emitted from the sessions' own tasks
  tokio::time::sleep(Duration::from_millis(50)).await;
  tracing::info!(
    getter = ?getter.current_state(),
    sharer = ?sharer.current_state(),
    "Demo complete"
  );

  // Relays finish once both sessions, and with them the update senders, are gone
  drop(getter);
  drop(sharer);
  let (getter_relay, sharer_relay) = futures::future::join(getter_relay, sharer_relay).await;
  getter_relay?;
  sharer_relay?;
  Ok(())
}

async fn relay_updates(
  origin: &'static str,
  mut updates: mpsc::UnboundedReceiver<SessionUpdate>,
  destination: Weak<DemoSession>,
  origin_version: ProtocolVersion,
) {
  while let Some(update) = updates.recv().await {
    match serde_json::to_string(&update) {
      Ok(rendered) => println!("{} {}", origin, rendered),
      Err(e) => tracing::warn!(error = %e, "Update could not be rendered"),
    }
    let envelope = match update {
      SessionUpdate::SignallingMessage(envelope) => envelope,
      _ => continue,
    };
    let destination = match destination.upgrade() {
      Some(destination) => destination,
      None => continue,
    };
    let received = match envelope
      .encode()
      .and_then(|raw| SignalEnvelope::decode(&raw))
    {
      Ok(received) => received,
      Err(e) => {
        tracing::error!(error = %e, "Envelope did not survive the wire");
        continue;
      }
    };
    deliver(&destination, received, origin_version).await;
  }
}

/// Client-peer signals reaching a session that is not sharing start a sharer first
async fn deliver(
  destination: &Arc<DemoSession>,
  envelope: SignalEnvelope,
  origin_version: ProtocolVersion,
) {
  let for_sharer = matches!(
    envelope,
    SignalEnvelope::ForwardedSignal {
      from: PeerRole::ClientPeer,
      ..
    }
  );
  if !for_sharer {
    return destination.handle_signal(envelope).await;
  }
  if destination.current_state().sharing_state == SharingState::None {
    match destination.start_share(origin_version) {
      Ok(ready) => {
        tokio::task::spawn(async move {
          match ready.await {
            Ok(()) => tracing::info!("Sharer is ready"),
            Err(e) => tracing::warn!(error = %e, "Sharer failed to start"),
          }
        });
      }
      Err(misuse) => tracing::warn!(error = %misuse, "Sharer could not be started"),
    }
  }
  destination
    .handle_signal_when_sharer_created(envelope)
    .await
}
