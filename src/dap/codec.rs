//! Content-Length frame codec for DAP byte streams.
//!
//! Each frame is an ASCII header block terminated by a blank line, followed
//! by exactly `Content-Length` bytes of JSON body:
//!
//! ```text
//! Content-Length: 54\r\n
//! \r\n
//! {"seq":1,"type":"request","command":"initialize",...}
//! ```
//!
//! [`FrameCodec`] implements [`Decoder`] and [`Encoder`] so it can drive
//! [`tokio_util::codec::FramedRead`] / [`tokio_util::codec::FramedWrite`],
//! and is also used chunk-by-chunk by
//! [`FrameReader`](crate::dap::transport::FrameReader). Partial headers and
//! partial bodies stay buffered in the source `BytesMut` until complete.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::dap::message::Message;
use crate::{AppError, Result};

/// Blank-line terminator that ends the header block.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest header block accepted before the terminator must appear.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Largest body accepted: 64 MiB.
///
/// A declared `Content-Length` above this limit fails with
/// [`AppError::Framing`] before any body bytes are buffered.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Frame codec for DAP streams.
///
/// Stateful across calls: once a header is parsed, the declared body length
/// is remembered until the body has fully arrived.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Body length of the frame whose header has been consumed.
    pending_body: Option<usize>,
}

impl FrameCodec {
    /// Create a codec with no partially decoded frame.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Encode `message` into a complete frame.
///
/// The `Content-Length` header is always computed from the serialised body.
///
/// # Errors
///
/// Returns [`AppError::Framing`] if the message cannot be serialised.
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    FrameCodec::new().encode(message, &mut dst)?;
    Ok(dst.freeze())
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = AppError;

    /// Decode the next complete frame from `src`.
    ///
    /// Returns `Ok(None)` while the header terminator or the full body has
    /// not arrived yet.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let body_len = if let Some(len) = self.pending_body {
            len
        } else {
            let Some(header_end) = find_terminator(src) else {
                if src.len() > MAX_HEADER_BYTES {
                    return Err(AppError::Framing(format!(
                        "header exceeds {MAX_HEADER_BYTES} bytes without terminator"
                    )));
                }
                return Ok(None);
            };

            let len = parse_content_length(&src[..header_end])?;
            let _ = src.split_to(header_end + HEADER_TERMINATOR.len());
            self.pending_body = Some(len);
            len
        };

        if src.len() < body_len {
            src.reserve(body_len - src.len());
            return Ok(None);
        }

        let body = src.split_to(body_len);
        self.pending_body = None;

        let message = serde_json::from_slice::<Message>(&body)?;
        Ok(Some(message))
    }

    /// Decode at end of stream; leftover bytes mean the peer hung up mid-frame.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }

        match self.pending_body {
            Some(expected) => Err(AppError::Framing(format!(
                "stream ended after {} of {expected} body bytes",
                src.len()
            ))),
            None if !src.is_empty() => Err(AppError::Framing(format!(
                "stream ended inside a header ({} bytes buffered)",
                src.len()
            ))),
            None => Ok(None),
        }
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        let body = serde_json::to_vec(item)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Extract the `Content-Length` value from a header block (terminator excluded).
///
/// Header names are case-insensitive; other headers are ignored.
fn parse_content_length(header: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| AppError::Framing("header is not valid ascii".into()))?;

    let mut content_length = None;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(AppError::Framing(format!("malformed header line: {line:?}")));
        };

        if name.trim().eq_ignore_ascii_case("content-length") {
            let declared: i64 = value.trim().parse().map_err(|_| {
                AppError::Framing(format!("invalid content-length value: {:?}", value.trim()))
            })?;
            let len = usize::try_from(declared)
                .map_err(|_| AppError::Framing(format!("negative content-length: {declared}")))?;
            if len > MAX_BODY_BYTES {
                return Err(AppError::Framing(format!(
                    "content-length {len} exceeds {MAX_BODY_BYTES} bytes"
                )));
            }
            content_length = Some(len);
        }
    }

    content_length.ok_or_else(|| AppError::Framing("missing content-length header".into()))
}
