//! Shared test harness: a scriptable mock transport and polling helpers.
#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use docsink::{BulkRequest, BulkResponse, BulkTransport, DataStream, Event, TransportError};
use tokio::sync::watch;

/// How each bulk request is answered.
#[derive(Debug, Clone)]
pub enum Mode {
  /// 200 with `errors: false`.
  Success,
  /// 200 with the given per-item statuses for the first items; remaining
  /// items get 201.
  ItemStatuses(Vec<u16>),
  /// 200 where every item is rejected with a per-item 429.
  AllItems429,
  /// A non-2xx response with the given body.
  HttpError(u16, &'static str),
  /// Never resolves.
  NeverReply,
}

pub struct MockTransport {
  mode: Mutex<Mode>,
  delay: Option<Duration>,
  gate_tx: watch::Sender<bool>,
  gate_rx: watch::Receiver<bool>,
  pub requests: AtomicU64,
  pub items_seen: AtomicU64,
  pub bytes_seen: AtomicU64,
  pub bodies: Mutex<Vec<(Bytes, Option<&'static str>)>>,
}

impl MockTransport {
  pub fn new(mode: Mode) -> Self {
    let (gate_tx, gate_rx) = watch::channel(true);
    Self {
      mode: Mutex::new(mode),
      delay: None,
      gate_tx,
      gate_rx,
      requests: AtomicU64::new(0),
      items_seen: AtomicU64::new(0),
      bytes_seen: AtomicU64::new(0),
      bodies: Mutex::new(Vec::new()),
    }
  }

  /// Starts with the gate shut: requests are recorded but held until
  /// [`MockTransport::open_gate`].
  pub fn gated(mode: Mode) -> Self {
    let transport = Self::new(mode);
    transport.gate_tx.send_replace(false);
    transport
  }

  /// Adds a fixed latency to every request, keeping buffers in flight long
  /// enough for scaling pressure to build.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn set_mode(&self, mode: Mode) {
    *self.mode.lock().unwrap() = mode;
  }

  pub fn open_gate(&self) {
    self.gate_tx.send_replace(true);
  }

  pub fn request_count(&self) -> u64 {
    self.requests.load(Ordering::Relaxed)
  }
}

#[async_trait]
impl BulkTransport for MockTransport {
  async fn send(&self, request: BulkRequest) -> Result<BulkResponse, TransportError> {
    self.requests.fetch_add(1, Ordering::Relaxed);
    self.items_seen.fetch_add(request.items as u64, Ordering::Relaxed);
    self.bytes_seen.fetch_add(request.body.len() as u64, Ordering::Relaxed);
    self
      .bodies
      .lock()
      .unwrap()
      .push((request.body.clone(), request.content_encoding));

    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }

    let mut gate = self.gate_rx.clone();
    while !*gate.borrow() {
      if gate.changed().await.is_err() {
        break;
      }
    }

    let mode = self.mode.lock().unwrap().clone();
    let response = match mode {
      Mode::Success => BulkResponse {
        status: 200,
        body: Bytes::from_static(br#"{"errors":false,"items":[]}"#),
      },
      Mode::ItemStatuses(statuses) => bulk_response(&statuses, request.items),
      Mode::AllItems429 => bulk_response(&vec![429; request.items], request.items),
      Mode::HttpError(status, body) => BulkResponse {
        status,
        body: Bytes::from_static(body.as_bytes()),
      },
      Mode::NeverReply => {
        std::future::pending::<()>().await;
        unreachable!()
      }
    };
    Ok(response)
  }
}

/// Builds a 200 response whose first items carry the given statuses; the rest
/// of the `items` entries report 201.
fn bulk_response(statuses: &[u16], items: usize) -> BulkResponse {
  let mut entries = Vec::with_capacity(items);
  for i in 0..items {
    let status = statuses.get(i).copied().unwrap_or(201);
    if status >= 400 {
      entries.push(format!(
        r#"{{"create":{{"status":{status},"error":{{"type":"error_type","reason":"error_reason_{}"}}}}}}"#,
        if i % 2 == 0 { "even" } else { "odd" }
      ));
    } else {
      entries.push(format!(r#"{{"create":{{"status":{status}}}}}"#));
    }
  }
  let has_errors = statuses.iter().any(|status| *status >= 400);
  let body = format!(r#"{{"errors":{has_errors},"items":[{}]}}"#, entries.join(","));
  BulkResponse {
    status: 200,
    body: body.into(),
  }
}

pub fn sample_event() -> Event<serde_json::Value> {
  Event {
    timestamp: Utc.timestamp_opt(123, 456_789_111).unwrap(),
    data_stream: DataStream::new("logs", "apm_server", "testing"),
    document: serde_json::json!({}),
  }
}

pub fn sample_events(count: usize) -> Vec<Event<serde_json::Value>> {
  (0..count).map(|_| sample_event()).collect()
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn eventually(timeout: Duration, what: &str, condition: impl Fn() -> bool) {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition() {
      return;
    }
    if tokio::time::Instant::now() >= deadline {
      panic!("condition not met within {timeout:?}: {what}");
    }
    tokio::time::sleep(Duration::from_millis(2)).await;
  }
}
