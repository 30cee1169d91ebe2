// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A fire-once signal which any number of waiters may observe
///
/// Once fired, a latch stays fired; waiters arriving afterward resolve immediately.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct Latch {
  token: CancellationToken,
}

impl Latch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fire(&self) {
    self.token.cancel()
  }

  pub fn is_fired(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn wait(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }

  /// Produces a future which owns its handle to the latch, for use across tasks
  pub fn wait_owned(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
    let token = self.token.clone();
    async move { token.cancelled().await }
  }

  pub fn listener(&self) -> LatchListener {
    LatchListener {
      latch: self.clone(),
    }
  }
}

/// A [Latch] that cannot be fired by its recipient
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct LatchListener {
  latch: Latch,
}

impl LatchListener {
  pub fn is_fired(&self) -> bool {
    self.latch.is_fired()
  }

  pub fn wait(&self) -> WaitForCancellationFuture<'_> {
    self.latch.wait()
  }

  pub fn wait_owned(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
    self.latch.wait_owned()
  }
}

impl From<Latch> for LatchListener {
  fn from(latch: Latch) -> Self {
    Self { latch }
  }
}

#[cfg(test)]
mod tests {
  use super::Latch;
  use futures::FutureExt;
  use std::time::Duration;

  #[tokio::test]
  async fn fired_latch_releases_all_waiters() {
    let latch = Latch::new();
    let listener = latch.listener();
    assert!(listener.wait().now_or_never().is_none());

    let early = tokio::spawn(listener.wait_owned());
    latch.fire();
    tokio::time::timeout(Duration::from_secs(5), early)
      .await
      .expect("Waiter must be released once fired")
      .unwrap();

    // Late waiters resolve immediately
    assert!(latch.listener().wait().now_or_never().is_some());
    assert!(listener.is_fired());
  }
}
