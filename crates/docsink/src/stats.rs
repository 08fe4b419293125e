//! Atomic statistics counters exposed via snapshots.
//!
//! Counters are written from worker flush completions and from the intake
//! path, using relaxed atomics. A snapshot is a set of independent loads: it
//! is not linearizable across fields but never double-counts.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
  /// Events accepted into the items queue.
  pub added: u64,
  /// Events accepted but not yet indexed or failed: `added - indexed - failed`.
  pub active: u64,
  /// Bulk requests issued to the transport.
  pub bulk_requests: u64,
  /// Events that terminally failed to index.
  pub failed: u64,
  /// Events confirmed indexed.
  pub indexed: u64,
  /// Events (or whole requests) rejected with HTTP 429.
  pub too_many_requests: u64,
  /// Bulk buffers currently sitting on the free list.
  pub available_bulk_requests: u64,
  /// Payload bytes handed to the transport, compressed size when compression
  /// is enabled.
  pub bytes_total: u64,
  /// Workers currently running.
  pub indexers_active: u64,
  /// Workers created by the scaling controller (cumulative).
  pub indexers_created: u64,
  /// Workers stopped by the scaling controller (cumulative).
  pub indexers_destroyed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsRegistry {
  pub(crate) added: AtomicU64,
  pub(crate) bulk_requests: AtomicU64,
  pub(crate) failed: AtomicU64,
  pub(crate) indexed: AtomicU64,
  pub(crate) too_many_requests: AtomicU64,
  pub(crate) bytes_total: AtomicU64,
  pub(crate) indexers_active: AtomicU64,
  pub(crate) indexers_created: AtomicU64,
  pub(crate) indexers_destroyed: AtomicU64,
}

impl StatsRegistry {
  pub(crate) fn snapshot(&self, available_bulk_requests: u64) -> Stats {
    let added = self.added.load(Ordering::Relaxed);
    let indexed = self.indexed.load(Ordering::Relaxed);
    let failed = self.failed.load(Ordering::Relaxed);
    Stats {
      added,
      active: added.saturating_sub(indexed).saturating_sub(failed),
      bulk_requests: self.bulk_requests.load(Ordering::Relaxed),
      failed,
      indexed,
      too_many_requests: self.too_many_requests.load(Ordering::Relaxed),
      available_bulk_requests,
      bytes_total: self.bytes_total.load(Ordering::Relaxed),
      indexers_active: self.indexers_active.load(Ordering::Relaxed),
      indexers_created: self.indexers_created.load(Ordering::Relaxed),
      indexers_destroyed: self.indexers_destroyed.load(Ordering::Relaxed),
    }
  }
}
