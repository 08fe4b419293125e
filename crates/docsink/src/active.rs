//! Worker tasks that accumulate items into bulk buffers and flush them.
//!
//! Each worker owns at most one buffer at a time. A triggered flush is spawned
//! as its own task that keeps the buffer until the response is handled, so up
//! to `max_bulk_requests` bulk requests can be in flight while the worker goes
//! back to consuming; the free list is what gates that concurrency.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, field, info_span, warn};

use crate::buffer::BulkBuffer;
use crate::encode::EncodedItem;
use crate::error::IndexerError;
use crate::indexer::{PoolState, deregister_worker};
use crate::transport::{BulkRequest, BulkResponse, BulkResult, GZIP_CONTENT_ENCODING, TransportError};

enum Action {
  Flush,
  Stop,
}

pub(crate) struct ActiveIndexer {
  id: u64,
  state: Arc<PoolState>,
  token: CancellationToken,
}

impl ActiveIndexer {
  pub(crate) fn new(id: u64, state: Arc<PoolState>, token: CancellationToken) -> Self {
    Self { id, state, token }
  }

  pub(crate) async fn run(self) {
    debug!(id = self.id, "indexer worker started");

    'running: loop {
      let mut buffer = match self.acquire().await {
        Some(buffer) => buffer,
        None => {
          self.drain_leftovers().await;
          break;
        }
      };

      let mut deadline: Option<Instant> = None;
      let action = loop {
        tokio::select! {
          recv = self.state.items_rx.recv_async() => match recv {
            Ok(item) => {
              self.append(&mut buffer, &item);
              if deadline.is_none() {
                deadline = Some(Instant::now() + self.state.config.flush_interval);
              }
              if buffer.size() >= self.state.config.flush_bytes {
                break Action::Flush;
              }
            }
            // Every sender is gone; nothing more can arrive.
            Err(_) => break Action::Stop,
          },
          _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
            break Action::Flush;
          }
          _ = self.token.cancelled() => break Action::Stop,
        }
      };

      match action {
        Action::Flush => self.spawn_flush(buffer),
        Action::Stop => {
          self.stop(buffer).await;
          break 'running;
        }
      }
    }

    deregister_worker(&self.state, self.id);
    self.state.stats.indexers_active.fetch_sub(1, Ordering::Relaxed);
    debug!(id = self.id, "indexer worker stopped");
  }

  /// Takes a buffer from the free list, recording when it had to wait so the
  /// scaling controller sees the pressure.
  async fn acquire(&self) -> Option<BulkBuffer> {
    match self.state.free_rx.try_recv() {
      Ok(buffer) => Some(buffer),
      Err(flume::TryRecvError::Empty) => {
        self.state.waited_for_buffer.store(true, Ordering::Relaxed);
        tokio::select! {
          recv = self.state.free_rx.recv_async() => recv.ok(),
          _ = self.token.cancelled() => None,
        }
      }
      Err(flume::TryRecvError::Disconnected) => None,
    }
  }

  fn append(&self, buffer: &mut BulkBuffer, item: &EncodedItem) {
    if let Err(error) = buffer.append(item) {
      // The item never made it into the payload; account for it here.
      warn!(%error, "failed to append item to bulk buffer");
      self.state.stats.failed.fetch_add(1, Ordering::Relaxed);
    }
  }

  fn spawn_flush(&self, buffer: BulkBuffer) {
    let state = Arc::clone(&self.state);
    self.state.tracker.spawn(flush(state, buffer));
  }

  /// Stop path. A worker stopped by a closing pool first drains the items
  /// queue; a worker stopped by downscaling only flushes what it holds.
  async fn stop(&self, mut buffer: BulkBuffer) {
    if self.state.closed.load(Ordering::SeqCst) {
      loop {
        match self.state.items_rx.try_recv() {
          Ok(item) => {
            self.append(&mut buffer, &item);
            if buffer.size() >= self.state.config.flush_bytes {
              flush(Arc::clone(&self.state), buffer).await;
              buffer = match self.state.free_rx.recv_async().await {
                Ok(buffer) => buffer,
                Err(_) => return,
              };
            }
          }
          Err(_) => break,
        }
      }
    }

    if buffer.item_count() > 0 {
      flush(Arc::clone(&self.state), buffer).await;
    } else {
      release_buffer(&self.state, buffer);
    }
  }

  /// Called when the worker was cancelled while it held no buffer. If the
  /// pool is closing and items are still queued, pick the drain back up once
  /// an in-flight flush returns a buffer.
  async fn drain_leftovers(&self) {
    if !self.state.closed.load(Ordering::SeqCst) || self.state.items_rx.is_empty() {
      return;
    }
    if let Ok(buffer) = self.state.free_rx.recv_async().await {
      self.stop(buffer).await;
    }
  }
}

/// Seals the buffer, sends it, applies per-item accounting, and returns the
/// buffer to the free list. Runs either as its own task (normal triggers) or
/// inline (stop and drain paths).
pub(crate) async fn flush(state: Arc<PoolState>, mut buffer: BulkBuffer) {
  let items = buffer.item_count();
  if items == 0 {
    release_buffer(&state, buffer);
    return;
  }
  let stats = &state.stats;
  stats.bulk_requests.fetch_add(1, Ordering::Relaxed);

  let payload = match buffer.seal() {
    Ok(payload) => payload,
    Err(error) => {
      warn!(%error, items, "failed to finalize bulk payload");
      stats.failed.fetch_add(items as u64, Ordering::Relaxed);
      record_error(&state, TransportError::Io(error).into());
      buffer.reset();
      release_buffer(&state, buffer);
      return;
    }
  };
  let bytes = payload.len();
  stats.bytes_total.fetch_add(bytes as u64, Ordering::Relaxed);

  let request = BulkRequest {
    body: payload,
    content_encoding: state.config.compression.enabled().then_some(GZIP_CONTENT_ENCODING),
    items,
  };

  async {
    let request_span = debug_span!("Elasticsearch: POST _bulk", outcome = field::Empty);
    let result = state.transport.send(request).instrument(request_span.clone()).await;
    let success = matches!(&result, Ok(response) if response.is_success());
    request_span.record("outcome", if success { "success" } else { "failure" });

    match result {
      Ok(response) => handle_response(&state, items, &response),
      Err(error) => {
        warn!(%error, items, "bulk request failed");
        state.stats.failed.fetch_add(items as u64, Ordering::Relaxed);
        record_error(&state, error.into());
      }
    }
  }
  .instrument(info_span!("flush", items, bytes))
  .await;

  buffer.reset();
  release_buffer(&state, buffer);
}

fn handle_response(state: &PoolState, items: usize, response: &BulkResponse) {
  let stats = &state.stats;

  if !response.is_success() {
    stats.failed.fetch_add(items as u64, Ordering::Relaxed);
    if response.status == 429 {
      stats.too_many_requests.fetch_add(items as u64, Ordering::Relaxed);
    }
    warn!(status = response.status, items, "bulk request rejected");
    record_error(state, IndexerError::flush(response.status, &response.body));
    return;
  }

  let result: BulkResult = match serde_json::from_slice(&response.body) {
    Ok(result) => result,
    Err(error) => {
      warn!(%error, "undecodable bulk response body");
      stats.failed.fetch_add(items as u64, Ordering::Relaxed);
      record_error(state, IndexerError::ResponseDecode(error));
      return;
    }
  };

  if !result.has_errors {
    stats.indexed.fetch_add(items as u64, Ordering::Relaxed);
    return;
  }

  let mut failed = 0u64;
  let mut too_many = 0u64;
  for item in &result.items {
    let Some(status) = item.status() else { continue };
    if status.status < 400 {
      continue;
    }
    failed += 1;
    if status.status == 429 {
      too_many += 1;
    }
    let (kind, reason) = status
      .error
      .as_ref()
      .map(|error| (error.kind.as_str(), error.reason.as_str()))
      .unwrap_or(("", ""));
    if state.limiter.admit(kind, reason) {
      warn!(
        status = status.status,
        error.kind = kind,
        error.reason = reason,
        "failed to index event"
      );
    }
  }
  stats.failed.fetch_add(failed, Ordering::Relaxed);
  stats.too_many_requests.fetch_add(too_many, Ordering::Relaxed);
  stats.indexed.fetch_add((items as u64).saturating_sub(failed), Ordering::Relaxed);
}

fn record_error(state: &PoolState, error: IndexerError) {
  let mut first = state.first_error.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
  if first.is_none() {
    *first = Some(error);
  }
}

fn release_buffer(state: &PoolState, buffer: BulkBuffer) {
  // The free list capacity equals the number of buffers in existence, so this
  // cannot be full; Disconnected only happens during final teardown.
  let _ = state.free_tx.try_send(buffer);
}
