//! Event model for the indexing pipeline.

use chrono::{DateTime, Utc};

/// The (type, dataset, namespace) triple selecting the destination data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataStream {
  pub r#type: String,
  pub dataset: String,
  pub namespace: String,
}

impl DataStream {
  pub fn new(r#type: impl Into<String>, dataset: impl Into<String>, namespace: impl Into<String>) -> Self {
    Self {
      r#type: r#type.into(),
      dataset: dataset.into(),
      namespace: namespace.into(),
    }
  }

  /// Destination index name: `<type>-<dataset>-<namespace>`.
  pub fn index_name(&self) -> String {
    format!("{}-{}-{}", self.r#type, self.dataset, self.namespace)
  }
}

/// A single event to index.
///
/// `document` is the event body and can be any serializable value that
/// produces a JSON object. Events are immutable once handed to the indexer.
#[derive(Debug, Clone)]
pub struct Event<T> {
  /// Event time, written as the top-level `@timestamp` field.
  pub timestamp: DateTime<Utc>,
  /// Destination data stream.
  pub data_stream: DataStream,
  /// Event-specific document fields.
  pub document: T,
}
