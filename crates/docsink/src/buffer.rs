//! Framed bulk payload buffer with optional streaming compression.
//!
//! Writes stream through a gzip encoder whose sink is the raw buffer, so
//! `size()` reports the bytes that will actually go on the wire and the
//! byte-based flush trigger sees compressed growth.

use std::io::Write;

use bytes::buf::Writer;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::GzEncoder;

use crate::config::CompressionLevel;
use crate::encode::EncodedItem;

const INITIAL_CAPACITY: usize = 64 * 1024;

enum Framer {
  Plain(Writer<BytesMut>),
  Gzip(GzEncoder<Writer<BytesMut>>),
}

/// Accumulates encoded items into a single framed bulk payload.
///
/// A buffer is owned by exactly one worker (or one in-flight flush) at a time
/// and cycles through the pool's free list between uses. `reset()` retains the
/// underlying allocation.
pub(crate) struct BulkBuffer {
  framer: Option<Framer>,
  /// Storage recovered from the previous payload, reused for the next one.
  spare: BytesMut,
  compression: CompressionLevel,
  items: usize,
  raw_bytes: usize,
}

impl BulkBuffer {
  pub(crate) fn new(compression: CompressionLevel) -> Self {
    Self {
      framer: None,
      spare: BytesMut::with_capacity(INITIAL_CAPACITY),
      compression,
      items: 0,
      raw_bytes: 0,
    }
  }

  fn framer(&mut self) -> &mut Framer {
    let Self {
      framer,
      spare,
      compression,
      ..
    } = self;
    framer.get_or_insert_with(|| {
      let storage = std::mem::take(spare).writer();
      match compression.gzip() {
        None => Framer::Plain(storage),
        Some(level) => Framer::Gzip(GzEncoder::new(storage, level)),
      }
    })
  }

  /// Appends one item as two newline-terminated lines.
  pub(crate) fn append(&mut self, item: &EncodedItem) -> std::io::Result<()> {
    let sink: &mut dyn Write = match self.framer() {
      Framer::Plain(writer) => writer,
      Framer::Gzip(encoder) => encoder,
    };
    sink.write_all(&item.action)?;
    sink.write_all(b"\n")?;
    sink.write_all(&item.source)?;
    sink.write_all(b"\n")?;

    self.items += 1;
    self.raw_bytes += item.uncompressed_size();
    Ok(())
  }

  /// Bytes accumulated in the raw buffer so far: the compressed length when
  /// compression is enabled, the raw length otherwise.
  pub(crate) fn size(&self) -> usize {
    match &self.framer {
      None => 0,
      Some(Framer::Plain(writer)) => writer.get_ref().len(),
      Some(Framer::Gzip(encoder)) => encoder.get_ref().get_ref().len(),
    }
  }

  pub(crate) fn item_count(&self) -> usize {
    self.items
  }

  pub(crate) fn raw_bytes(&self) -> usize {
    self.raw_bytes
  }

  /// Finalizes the payload framing and hands out the payload. The gzip stream
  /// is finished here, so the returned bytes are a complete member. Call
  /// `reset()` before reusing the buffer.
  pub(crate) fn seal(&mut self) -> std::io::Result<Bytes> {
    match self.framer.take() {
      None => Ok(Bytes::new()),
      Some(Framer::Plain(writer)) => {
        let mut storage = writer.into_inner();
        let payload = storage.split().freeze();
        self.spare = storage;
        Ok(payload)
      }
      Some(Framer::Gzip(encoder)) => {
        let mut storage = encoder.finish()?.into_inner();
        let payload = storage.split().freeze();
        self.spare = storage;
        Ok(payload)
      }
    }
  }

  /// Clears counters and any partially framed data for reuse.
  pub(crate) fn reset(&mut self) {
    self.items = 0;
    self.raw_bytes = 0;
    if let Some(framer) = self.framer.take() {
      let mut storage = match framer {
        Framer::Plain(writer) => writer.into_inner(),
        Framer::Gzip(encoder) => match encoder.finish() {
          Ok(writer) => writer.into_inner(),
          Err(_) => BytesMut::with_capacity(INITIAL_CAPACITY),
        },
      };
      storage.clear();
      self.spare = storage;
    }
  }
}
