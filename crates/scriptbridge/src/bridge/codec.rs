//! Framed codecs for peer communication.
//!
//! [`LineCodec`] splits a byte stream on `\n` without touching `\r`, so carriage
//! returns inside block payloads survive. [`FrameCodec`] layers the protocol
//! frames on top and reassembles `BLOCK` payloads.

use std::io;
use std::marker::PhantomData;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, Decoder, Encoder};

use super::protocol::{Frame, FrameError, Parsed};

/// Upper bound on a single line; a peer writing more is treated as broken.
pub const MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Newline-delimited chunks of raw bytes.
pub struct LineCodec {
    inner: AnyDelimiterCodec,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                vec![b'\n'],
                vec![b'\n'],
                MAX_LINE_LENGTH,
            ),
        }
    }
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode(src).map_err(invalid_data)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode_eof(src).map_err(invalid_data)
    }
}

impl Encoder<&str> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

struct PendingBlock {
    status: String,
    remaining: usize,
    lines: Vec<String>,
}

/// Codec for one direction of the protocol.
pub struct FrameCodec<T> {
    lines: LineCodec,
    pending: Option<PendingBlock>,
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            lines: LineCodec::new(),
            pending: None,
            _phantom: PhantomData,
        }
    }
}

impl<T: Frame> FrameCodec<T> {
    fn accept(&mut self, raw: &[u8]) -> Result<Option<T>, io::Error> {
        let line = std::str::from_utf8(raw).map_err(|_| invalid_data(FrameError::InvalidUtf8))?;

        if let Some(block) = self.pending.as_mut() {
            block.lines.push(line.to_owned());
            block.remaining -= 1;
            if block.remaining > 0 {
                return Ok(None);
            }
            let Some(block) = self.pending.take() else {
                return Ok(None);
            };
            let payload = block.lines.join("\n");
            return T::parse_block(&block.status, &payload)
                .map(Some)
                .map_err(invalid_data);
        }

        match T::parse_line(line).map_err(invalid_data)? {
            Parsed::Frame(frame) => Ok(Some(frame)),
            Parsed::Block { status, lines: 0 } => {
                T::parse_block(&status, "").map(Some).map_err(invalid_data)
            }
            Parsed::Block { status, lines } => {
                tracing::trace!(%status, lines, "Reading block frame");
                self.pending = Some(PendingBlock {
                    status,
                    remaining: lines,
                    lines: Vec::with_capacity(lines.min(1024)),
                });
                Ok(None)
            }
        }
    }
}

impl<T: Frame> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.lines.decode(src)? {
            if let Some(frame) = self.accept(&line)? {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.lines.decode_eof(src)? {
            if let Some(frame) = self.accept(&line)? {
                return Ok(Some(frame));
            }
        }
        if let Some(block) = self.pending.take() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream closed with {} line(s) of a {} block outstanding",
                    block.remaining, block.status
                ),
            ));
        }
        Ok(None)
    }
}

impl<T: Frame> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut text = String::new();
        item.write_to(&mut text);
        tracing::trace!(frame_bytes = text.len(), "Encoding frame");
        if text.len() > 100_000 {
            tracing::debug!(
                frame_bytes = text.len(),
                frame_kb = text.len() / 1024,
                "Large frame being encoded"
            );
        }
        dst.extend_from_slice(text.as_bytes());
        Ok(())
    }
}
