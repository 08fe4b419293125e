//! Encoding of events into the bulk request line format.
//!
//! Each event becomes two newline-terminated JSON lines: an action line naming
//! the destination index, then the source document with `@timestamp` and the
//! dotted `data_stream.*` keys ahead of the event's own fields.

use bytes::Bytes;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::event::{DataStream, Event};

/// RFC3339 UTC with millisecond precision. `%.3f` truncates, so subsecond
/// digits beyond milliseconds are dropped rather than rounded.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Error, Debug)]
pub enum EncodeError {
  #[error(transparent)]
  Serialize(#[from] serde_json::Error),
  #[error("event document must serialize to a JSON object")]
  NotAnObject,
}

/// One encoded bulk item: the action line and the source line.
#[derive(Debug, Clone)]
pub struct EncodedItem {
  pub(crate) action: Bytes,
  pub(crate) source: Bytes,
}

impl EncodedItem {
  pub fn action(&self) -> &[u8] {
    &self.action
  }

  pub fn source(&self) -> &[u8] {
    &self.source
  }

  /// Uncompressed wire size of this item, trailing newlines included.
  pub fn uncompressed_size(&self) -> usize {
    self.action.len() + self.source.len() + 2
  }
}

#[derive(Serialize)]
struct Action<'a> {
  create: Create<'a>,
}

#[derive(Serialize)]
struct Create<'a> {
  #[serde(rename = "_index")]
  index: &'a str,
}

struct SourceDoc<'a> {
  timestamp: String,
  data_stream: &'a DataStream,
  fields: &'a serde_json::Map<String, Value>,
}

impl Serialize for SourceDoc<'_> {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(4 + self.fields.len()))?;
    map.serialize_entry("@timestamp", &self.timestamp)?;
    map.serialize_entry("data_stream.type", &self.data_stream.r#type)?;
    map.serialize_entry("data_stream.dataset", &self.data_stream.dataset)?;
    map.serialize_entry("data_stream.namespace", &self.data_stream.namespace)?;
    for (key, value) in self.fields {
      map.serialize_entry(key, value)?;
    }
    map.end()
  }
}

/// Encodes one event into its two bulk lines. Fails only when the document
/// cannot be serialized or does not serialize to a JSON object.
pub fn encode<T: Serialize>(event: &Event<T>) -> Result<EncodedItem, EncodeError> {
  let index = event.data_stream.index_name();
  let action = serde_json::to_vec(&Action {
    create: Create { index: &index },
  })?;

  let fields = match serde_json::to_value(&event.document)? {
    Value::Object(fields) => fields,
    _ => return Err(EncodeError::NotAnObject),
  };
  let source = serde_json::to_vec(&SourceDoc {
    timestamp: event.timestamp.format(TIMESTAMP_FORMAT).to_string(),
    data_stream: &event.data_stream,
    fields: &fields,
  })?;

  Ok(EncodedItem {
    action: action.into(),
    source: source.into(),
  })
}
