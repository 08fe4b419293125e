//! Public indexing facade and pool coordination.
//!
//! The pool owns two bounded flume channels: the shared items queue that every
//! worker consumes, and the free list of bulk buffers that gates how many bulk
//! requests can be in flight. Buffers are created once and recycled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::active::ActiveIndexer;
use crate::buffer::BulkBuffer;
use crate::config::Config;
use crate::encode::{EncodedItem, encode};
use crate::error::IndexerError;
use crate::event::Event;
use crate::log_limit::FailureLogLimiter;
use crate::scaling::ScalingController;
use crate::stats::{Stats, StatsRegistry};
use crate::transport::BulkTransport;

/// Suppression window for repeated per-item failure logs; long enough to
/// cover any single flush.
const FAILURE_LOG_WINDOW: Duration = Duration::from_secs(1);

pub(crate) struct PoolState {
  pub(crate) config: Config,
  pub(crate) transport: Arc<dyn BulkTransport>,
  pub(crate) items_tx: flume::Sender<EncodedItem>,
  pub(crate) items_rx: flume::Receiver<EncodedItem>,
  pub(crate) free_tx: flume::Sender<BulkBuffer>,
  pub(crate) free_rx: flume::Receiver<BulkBuffer>,
  pub(crate) stats: StatsRegistry,
  pub(crate) limiter: FailureLogLimiter,
  pub(crate) closed: AtomicBool,
  pub(crate) close_token: CancellationToken,
  pub(crate) tracker: TaskTracker,
  pub(crate) workers: Mutex<WorkerSet>,
  /// Set by a worker that had to wait for a free buffer; read and cleared by
  /// the scaling controller as a pressure signal.
  pub(crate) waited_for_buffer: AtomicBool,
  pub(crate) first_error: Mutex<Option<IndexerError>>,
}

#[derive(Default)]
pub(crate) struct WorkerSet {
  next_id: u64,
  stops: HashMap<u64, CancellationToken>,
}

/// Starts one worker. `scaled` marks workers added by the controller so the
/// created counter excludes the initial worker.
pub(crate) fn spawn_worker(state: &Arc<PoolState>, scaled: bool) {
  let token = state.close_token.child_token();
  let id = {
    let mut workers = state.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let id = workers.next_id;
    workers.next_id += 1;
    workers.stops.insert(id, token.clone());
    id
  };
  state.stats.indexers_active.fetch_add(1, Ordering::Relaxed);
  if scaled {
    state.stats.indexers_created.fetch_add(1, Ordering::Relaxed);
  }
  let worker = ActiveIndexer::new(id, Arc::clone(state), token);
  state.tracker.spawn(worker.run());
}

pub(crate) fn deregister_worker(state: &PoolState, id: u64) {
  let mut workers = state.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
  workers.stops.remove(&id);
}

/// Cancels one running worker. Returns false instead of cancelling the last
/// running worker, so the pool never drops to zero consumers.
pub(crate) fn stop_one_worker(state: &PoolState) -> bool {
  let workers = state.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
  let mut running = workers.stops.values().filter(|token| !token.is_cancelled());
  let candidate = running.next();
  if running.next().is_none() {
    return false;
  }
  match candidate {
    Some(token) => {
      token.cancel();
      state.stats.indexers_destroyed.fetch_add(1, Ordering::Relaxed);
      true
    }
    None => false,
  }
}

/// Batches events into bulk requests and streams them to the transport.
///
/// Worker tasks are spawned on the current tokio runtime, so construction must
/// happen inside one. Cancellation follows the usual async contract: callers
/// that need a deadline wrap `process_batch` or `close` in
/// `tokio::time::timeout` and drop the future.
pub struct Indexer {
  state: Arc<PoolState>,
}

impl Indexer {
  pub fn new(transport: Arc<dyn BulkTransport>, config: Config) -> Result<Self, IndexerError> {
    config.validate().map_err(IndexerError::Config)?;

    let (items_tx, items_rx) = flume::bounded(config.event_buffer_size);
    let (free_tx, free_rx) = flume::bounded(config.max_bulk_requests);
    for _ in 0..config.max_bulk_requests {
      let _ = free_tx.try_send(BulkBuffer::new(config.compression));
    }

    let state = Arc::new(PoolState {
      transport,
      items_tx,
      items_rx,
      free_tx,
      free_rx,
      stats: StatsRegistry::default(),
      limiter: FailureLogLimiter::new(FAILURE_LOG_WINDOW),
      closed: AtomicBool::new(false),
      close_token: CancellationToken::new(),
      tracker: TaskTracker::new(),
      workers: Mutex::new(WorkerSet::default()),
      waited_for_buffer: AtomicBool::new(false),
      first_error: Mutex::new(None),
      config,
    });

    spawn_worker(&state, false);
    if !state.config.scaling.disabled {
      let controller = ScalingController::new(Arc::clone(&state));
      state.tracker.spawn(controller.run());
    }

    Ok(Self { state })
  }

  /// Encodes and enqueues a batch of events.
  ///
  /// Each event is encoded before its send, so serialization problems surface
  /// even when the queue is saturated. Blocks (asynchronously) while the items
  /// queue is full and every worker is busy; that is the backpressure
  /// mechanism. A batch interrupted by `close` may be partially enqueued.
  pub async fn process_batch<T: Serialize>(&self, batch: &[Event<T>]) -> Result<(), IndexerError> {
    if self.state.closed.load(Ordering::SeqCst) {
      return Err(IndexerError::Closed);
    }
    for event in batch {
      let item = encode(event)?;
      tokio::select! {
        biased;
        _ = self.state.close_token.cancelled() => return Err(IndexerError::Closed),
        sent = self.state.items_tx.send_async(item) => {
          if sent.is_err() {
            return Err(IndexerError::Closed);
          }
          self.state.stats.added.fetch_add(1, Ordering::Relaxed);
        }
      }
    }
    Ok(())
  }

  /// Non-blocking variant of [`Indexer::process_batch`]: a full items queue
  /// yields [`IndexerError::QueueFull`], leaving any already-enqueued events
  /// of the batch in place.
  pub fn try_process_batch<T: Serialize>(&self, batch: &[Event<T>]) -> Result<(), IndexerError> {
    if self.state.closed.load(Ordering::SeqCst) {
      return Err(IndexerError::Closed);
    }
    for event in batch {
      let item = encode(event)?;
      match self.state.items_tx.try_send(item) {
        Ok(()) => {
          self.state.stats.added.fetch_add(1, Ordering::Relaxed);
        }
        Err(flume::TrySendError::Full(_)) => return Err(IndexerError::QueueFull),
        Err(flume::TrySendError::Disconnected(_)) => return Err(IndexerError::Closed),
      }
    }
    Ok(())
  }

  /// Closes the indexer and waits until every queued event has been flushed
  /// and every task has stopped. Returns the first flush error observed, if
  /// any. Idempotent: subsequent calls return `Ok(())`.
  ///
  /// The closed state is committed before the first await, so a `close`
  /// wrapped in `tokio::time::timeout` that fires still leaves the indexer
  /// closed while workers finish draining in the background.
  pub async fn close(&self) -> Result<(), IndexerError> {
    if !self.state.closed.swap(true, Ordering::SeqCst) {
      info!("closing indexer");
      self.state.close_token.cancel();
      self.state.tracker.close();
    }
    self.state.tracker.wait().await;

    let mut first = self.state.first_error.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match first.take() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }

  pub fn stats(&self) -> Stats {
    self.state.stats.snapshot(self.state.free_rx.len() as u64)
  }
}

impl Drop for Indexer {
  fn drop(&mut self) {
    // Without an explicit close, stop the workers anyway; they flush what
    // they hold and exit while the runtime lives.
    if !self.state.closed.swap(true, Ordering::SeqCst) {
      self.state.close_token.cancel();
      self.state.tracker.close();
    }
  }
}
