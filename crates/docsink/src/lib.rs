//! Bulk event indexing pipeline.
//!
//! docsink batches APM events into framed (optionally gzip-compressed) bulk
//! payloads and streams them to an Elasticsearch-compatible `_bulk` endpoint
//! through a pluggable [`BulkTransport`], with a dynamically scaled worker
//! pool, bounded-queue backpressure, per-item failure accounting, and a
//! draining close.
//!
//! The entry point is [`Indexer`]: hand it a transport and a [`Config`], feed
//! it batches of [`Event`]s, and read progress from [`Indexer::stats`].

mod active;
mod buffer;
mod encode;
mod log_limit;
mod scaling;

pub mod config;
pub mod error;
pub mod event;
pub mod stats;
pub mod transport;

mod indexer;

pub use config::{CompressionLevel, Config, ScaleTrigger, ScalingConfig};
pub use encode::{EncodeError, EncodedItem, encode};
pub use error::IndexerError;
pub use event::{DataStream, Event};
pub use indexer::Indexer;
pub use stats::Stats;
pub use transport::{
  BulkRequest, BulkResponse, BulkTransport, GZIP_CONTENT_ENCODING, PRODUCT_ORIGIN_HEADER, TransportError,
};
