//! Pluggable transport for framed bulk payloads.
//!
//! The pipeline hands a finalized payload to a [`BulkTransport`] and gets back
//! the raw bulk response. HTTP client concerns (connection pooling, auth,
//! retries for transient failures) live behind this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

/// Product origin header attached to every bulk request.
pub const PRODUCT_ORIGIN_HEADER: (&str, &str) = ("X-Elastic-Product-Origin", "observability");

/// Content encoding advertised for compressed payloads.
pub const GZIP_CONTENT_ENCODING: &str = "gzip";

#[derive(Error, Debug)]
pub enum TransportError {
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error("{0}")]
  Other(String),
}

/// A finalized bulk payload ready to POST to the `_bulk` endpoint.
#[derive(Debug, Clone)]
pub struct BulkRequest {
  /// Framed newline-delimited payload, gzip-compressed when `content_encoding`
  /// is set.
  pub body: Bytes,
  /// `Some("gzip")` when the payload is compressed.
  pub content_encoding: Option<&'static str>,
  /// Number of bulk items in the payload.
  pub items: usize,
}

/// Raw response from the bulk endpoint.
#[derive(Debug, Clone)]
pub struct BulkResponse {
  pub status: u16,
  pub body: Bytes,
}

impl BulkResponse {
  pub(crate) fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Sends finalized bulk payloads to the downstream store.
///
/// Implementations POST the body to the `_bulk` endpoint with
/// [`PRODUCT_ORIGIN_HEADER`] attached and, when `content_encoding` is set, the
/// matching `Content-Encoding` header.
#[async_trait]
pub trait BulkTransport: Send + Sync + 'static {
  async fn send(&self, request: BulkRequest) -> Result<BulkResponse, TransportError>;
}

/// Body of a 2xx bulk response. Unknown top-level fields (`took`,
/// `ingest_took`, ...) are ignored.
#[derive(Debug, Deserialize)]
pub(crate) struct BulkResult {
  #[serde(rename = "errors", alias = "has_errors", default)]
  pub(crate) has_errors: bool,
  #[serde(default)]
  pub(crate) items: Vec<BulkResultItem>,
}

/// One element of the response `items` array, keyed by the action name.
/// This pipeline only issues `create`, but any single-key shape is accepted.
#[derive(Debug, Deserialize)]
pub(crate) struct BulkResultItem(HashMap<String, BulkItemStatus>);

impl BulkResultItem {
  pub(crate) fn status(&self) -> Option<&BulkItemStatus> {
    self.0.values().next()
  }
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkItemStatus {
  #[serde(default)]
  pub(crate) status: u16,
  #[serde(default)]
  pub(crate) error: Option<BulkItemError>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct BulkItemError {
  #[serde(rename = "type", default)]
  pub(crate) kind: String,
  #[serde(default)]
  pub(crate) reason: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_success_body() {
    let body = br#"{"took":7,"errors":false,"items":[{"create":{"status":201}}]}"#;
    let result: BulkResult = serde_json::from_slice(body).unwrap();
    assert!(!result.has_errors);
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].status().unwrap().status, 201);
  }

  #[test]
  fn test_parse_failure_body() {
    let body = br#"{"errors":true,"items":[
      {"create":{"status":201}},
      {"create":{"status":429,"error":{"type":"circuit_breaking_exception","reason":"too much load"}}}
    ]}"#;
    let result: BulkResult = serde_json::from_slice(body).unwrap();
    assert!(result.has_errors);
    let failed = result.items[1].status().unwrap();
    assert_eq!(failed.status, 429);
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.kind, "circuit_breaking_exception");
    assert_eq!(error.reason, "too much load");
  }

  #[test]
  fn test_unknown_fields_ignored() {
    let body = br#"{"ingest_took":123}"#;
    let result: BulkResult = serde_json::from_slice(body).unwrap();
    assert!(!result.has_errors);
    assert!(result.items.is_empty());
  }

  #[test]
  fn test_has_errors_alias_accepted() {
    let body = br#"{"has_errors":true,"items":[{"create":{"status":500}}]}"#;
    let result: BulkResult = serde_json::from_slice(body).unwrap();
    assert!(result.has_errors);
    assert_eq!(result.items[0].status().unwrap().status, 500);
  }

  #[test]
  fn test_item_without_error_detail() {
    let body = br#"{"errors":true,"items":[{"index":{"status":400}}]}"#;
    let result: BulkResult = serde_json::from_slice(body).unwrap();
    let item = result.items[0].status().unwrap();
    assert_eq!(item.status, 400);
    assert!(item.error.is_none());
  }

  #[test]
  fn test_response_status_classification() {
    assert!(BulkResponse { status: 200, body: Bytes::new() }.is_success());
    assert!(BulkResponse { status: 201, body: Bytes::new() }.is_success());
    assert!(!BulkResponse { status: 429, body: Bytes::new() }.is_success());
    assert!(!BulkResponse { status: 503, body: Bytes::new() }.is_success());
  }
}
