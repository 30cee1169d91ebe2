// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The sharer-restart barrier
//!
//! Signals for the sharing role can arrive interleaved with the offer that replaces the
//! sharing engine. Before the old engine is stopped, the session swaps in a fresh
//! [`SharerBarrier`]; whoever holds a signal for the sharer waits on the barrier that was
//! current when the signal arrived, and so never hands it to an engine that predates it.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::util::latch::Latch;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Sharer barrier was replaced before a sharer was created")]
pub struct BarrierSuperseded;

/// Fires once a sharing engine exists, or is superseded by a newer barrier
#[derive(Debug, Default)]
pub struct SharerBarrier {
  created: Latch,
  superseded: Latch,
}

impl SharerBarrier {
  pub fn is_created(&self) -> bool {
    self.created.is_fired()
  }

  /// Waits until a sharer exists for this barrier instance
  ///
  /// Creation wins over supersession if both have happened.
  pub async fn wait(&self) -> Result<(), BarrierSuperseded> {
    tokio::select! {
      biased;
      _ = self.created.wait() => Ok(()),
      _ = self.superseded.wait() => {
        if self.created.is_fired() {
          Ok(())
        } else {
          Err(BarrierSuperseded)
        }
      }
    }
  }

  /// Marks this barrier as satisfied by a newly created sharer
  pub(super) fn fire(&self) {
    self.created.fire()
  }
}

/// Slot holding the current barrier; re-arming replaces the instance, never mutates it
pub struct BarrierSlot {
  current: ArcSwap<SharerBarrier>,
}

impl BarrierSlot {
  pub fn new() -> Self {
    Self {
      current: ArcSwap::from_pointee(SharerBarrier::default()),
    }
  }

  pub fn current(&self) -> Arc<SharerBarrier> {
    self.current.load_full()
  }

  /// Installs a fresh, unfired barrier and returns it
  pub fn rearm(&self) -> Arc<SharerBarrier> {
    let fresh = Arc::new(SharerBarrier::default());
    let previous = self.current.swap(Arc::clone(&fresh));
    previous.superseded.fire();
    fresh
  }
}

impl Default for BarrierSlot {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::{BarrierSlot, BarrierSuperseded};
  use futures::FutureExt;
  use std::time::Duration;

  #[tokio::test]
  async fn waiters_observe_their_own_instance() {
    let slot = BarrierSlot::new();
    let first = slot.current();
    assert!(first.wait().now_or_never().is_none());

    let second = slot.rearm();
    // The replaced barrier never saw a sharer
    assert_eq!(first.wait().await, Err(BarrierSuperseded));
    assert!(second.wait().now_or_never().is_none());

    let waiter = {
      let second = second.clone();
      tokio::spawn(async move { second.wait().await })
    };
    second.fire();
    tokio::time::timeout(Duration::from_secs(5), waiter)
      .await
      .expect("Barrier wait must finish once fired")
      .unwrap()
      .expect("Fired barrier must succeed");
  }

  #[tokio::test]
  async fn fired_barrier_stays_satisfied_after_replacement() {
    let slot = BarrierSlot::new();
    let fired = slot.current();
    fired.fire();
    let fresh = slot.rearm();
    assert_eq!(fired.wait().await, Ok(()));
    assert!(!fresh.is_created());
  }
}
