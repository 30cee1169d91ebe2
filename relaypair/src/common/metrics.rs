// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Byte accounting and lifecycle counters for a session
//!
//! Byte events arrive at transport speed, so the state refreshes they trigger are
//! debounced to at most one per [`REFRESH_INTERVAL`]. Lifecycle counters are rare and
//! are forwarded to the [`MetricsSink`] as they happen.

use std::{
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use tracing::Instrument;

/// Minimum spacing between byte-triggered state refreshes
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionCounter {
  /// A getting attempt was started
  Attempt,
  /// A getting attempt reached a usable local endpoint
  Success,
  /// Getting was stopped by the owner
  Stop,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ByteDirection {
  Sent,
  Received,
}

/// External receiver for lifecycle counters
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSink: Send + Sync {
  fn increment(&self, counter: SessionCounter);
}

pub struct MetricsReporter {
  bytes_sent: AtomicU64,
  bytes_received: AtomicU64,
  refresh_pending: Arc<AtomicBool>,
  attempts: AtomicU64,
  successes: AtomicU64,
  stops: AtomicU64,
  sink: Option<Arc<dyn MetricsSink>>,
}

impl MetricsReporter {
  pub fn new(sink: Option<Arc<dyn MetricsSink>>) -> Self {
    Self {
      bytes_sent: AtomicU64::new(0),
      bytes_received: AtomicU64::new(0),
      refresh_pending: Arc::new(AtomicBool::new(false)),
      attempts: AtomicU64::new(0),
      successes: AtomicU64::new(0),
      stops: AtomicU64::new(0),
      sink,
    }
  }

  /// Adds to a byte counter and schedules a debounced refresh
  ///
  /// `refresh` runs on a spawned task once the interval elapses, unless a refresh is
  /// already pending, in which case it is dropped unrun.
  pub fn record_bytes<F>(&self, direction: ByteDirection, count: u64, refresh: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let counter = match direction {
      ByteDirection::Sent => &self.bytes_sent,
      ByteDirection::Received => &self.bytes_received,
    };
    counter.fetch_add(count, Ordering::Relaxed);
    self.schedule_refresh(refresh);
  }

  fn schedule_refresh<F>(&self, refresh: F)
  where
    F: FnOnce() + Send + 'static,
  {
    if self.refresh_pending.swap(true, Ordering::AcqRel) {
      return;
    }
    let pending = Arc::clone(&self.refresh_pending);
    tokio::task::spawn(
      async move {
        tokio::time::sleep(REFRESH_INTERVAL).await;
        pending.store(false, Ordering::Release);
        refresh();
      }
      .instrument(tracing::Span::current()),
    );
  }

  pub fn is_refresh_pending(&self) -> bool {
    self.refresh_pending.load(Ordering::Acquire)
  }

  pub fn bytes_sent(&self) -> u64 {
    self.bytes_sent.load(Ordering::Relaxed)
  }

  pub fn bytes_received(&self) -> u64 {
    self.bytes_received.load(Ordering::Relaxed)
  }

  pub fn reset_bytes(&self) {
    self.bytes_sent.store(0, Ordering::Relaxed);
    self.bytes_received.store(0, Ordering::Relaxed);
  }

  pub fn increment(&self, counter: SessionCounter) {
    let local = match counter {
      SessionCounter::Attempt => &self.attempts,
      SessionCounter::Success => &self.successes,
      SessionCounter::Stop => &self.stops,
    };
    local.fetch_add(1, Ordering::Relaxed);
    if let Some(sink) = &self.sink {
      sink.increment(counter);
    }
  }

  pub fn count(&self, counter: SessionCounter) -> u64 {
    match counter {
      SessionCounter::Attempt => &self.attempts,
      SessionCounter::Success => &self.successes,
      SessionCounter::Stop => &self.stops,
    }
    .load(Ordering::Relaxed)
  }
}

impl std::fmt::Debug for MetricsReporter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MetricsReporter")
      .field("bytes_sent", &self.bytes_sent())
      .field("bytes_received", &self.bytes_received())
      .field("refresh_pending", &self.is_refresh_pending())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::{ByteDirection, MetricsReporter, MockMetricsSink, SessionCounter};
  use mockall::predicate::eq;
  use std::{sync::Arc, time::Duration};
  use tokio::sync::mpsc;

  fn drain(rx: &mut mpsc::UnboundedReceiver<()>) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
      count += 1;
    }
    count
  }

  #[tokio::test(start_paused = true)]
  async fn byte_bursts_coalesce_into_one_refresh_per_window() {
    let reporter = MetricsReporter::new(None);
    let (refreshed, mut refreshes) = mpsc::unbounded_channel();

    for _ in 0..50 {
      let refreshed = refreshed.clone();
      reporter.record_bytes(ByteDirection::Sent, 10, move || {
        let _ = refreshed.send(());
      });
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(drain(&mut refreshes), 0, "Refresh must wait out the interval");
    assert!(reporter.is_refresh_pending());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(drain(&mut refreshes), 1);
    assert!(!reporter.is_refresh_pending());
    assert_eq!(reporter.bytes_sent(), 500);

    // A later burst opens a fresh window
    for _ in 0..3 {
      let refreshed = refreshed.clone();
      reporter.record_bytes(ByteDirection::Received, 7, move || {
        let _ = refreshed.send(());
      });
    }
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(drain(&mut refreshes), 1);
    assert_eq!(reporter.bytes_received(), 21);
  }

  #[tokio::test]
  async fn reset_zeroes_both_directions() {
    let reporter = MetricsReporter::new(None);
    reporter.record_bytes(ByteDirection::Sent, 3, || ());
    reporter.record_bytes(ByteDirection::Received, 4, || ());
    reporter.reset_bytes();
    assert_eq!((reporter.bytes_sent(), reporter.bytes_received()), (0, 0));
  }

  #[test]
  fn counters_forward_immediately() {
    let mut sink = MockMetricsSink::new();
    sink
      .expect_increment()
      .with(eq(SessionCounter::Attempt))
      .times(2)
      .return_const(());
    sink
      .expect_increment()
      .with(eq(SessionCounter::Stop))
      .times(1)
      .return_const(());
    let reporter = MetricsReporter::new(Some(Arc::new(sink)));
    reporter.increment(SessionCounter::Attempt);
    reporter.increment(SessionCounter::Attempt);
    reporter.increment(SessionCounter::Stop);
    assert_eq!(reporter.count(SessionCounter::Attempt), 2);
    assert_eq!(reporter.count(SessionCounter::Success), 0);
    assert_eq!(reporter.count(SessionCounter::Stop), 1);
  }
}
