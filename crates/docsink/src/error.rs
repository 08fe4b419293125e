//! Error types for the indexing pipeline.

use thiserror::Error;

use crate::encode::EncodeError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IndexerError {
  /// Operation on a closed indexer.
  #[error("indexer is closed")]
  Closed,
  /// Non-blocking enqueue found the items queue full.
  #[error("item queue is full")]
  QueueFull,
  #[error("invalid configuration: {0}")]
  Config(String),
  #[error(transparent)]
  Encode(#[from] EncodeError),
  /// A bulk request was rejected with a non-2xx status.
  #[error("flush failed: [{status} {reason}] {body}")]
  Flush {
    status: u16,
    reason: &'static str,
    body: String,
  },
  /// A 2xx bulk response carried a body the pipeline could not decode.
  #[error("failed to decode bulk response: {0}")]
  ResponseDecode(#[from] serde_json::Error),
  #[error(transparent)]
  Transport(#[from] TransportError),
}

impl IndexerError {
  pub(crate) fn flush(status: u16, body: &[u8]) -> Self {
    let reason = http::StatusCode::from_u16(status)
      .ok()
      .and_then(|status| status.canonical_reason())
      .unwrap_or("");
    Self::Flush {
      status,
      reason,
      body: String::from_utf8_lossy(body).into_owned(),
    }
  }
}
