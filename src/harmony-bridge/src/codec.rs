//! Length-prefixed framing.
//!
//! Each frame is a 4-byte big-endian payload length followed by that many
//! bytes of encoded text holding one JSON document: `[u32 length][payload]`.
//! The length counts bytes, not characters.
//!
//! Decoding is resumable: bytes may arrive split at any boundary, and a
//! partially received frame (including a partially received length prefix)
//! is kept until the next call supplies the rest.

use crate::protocol::Message;
use harmony_core::TextEncoding;
use thiserror::Error;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound for a single payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Fatal: there is no resync marker, so the stream cannot be recovered.
    #[error("frame length {len} exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

/// Fatal decode failure.
///
/// Frames completed before the bad prefix in the same call are kept in
/// `decoded` so they can still be delivered.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct FramingLost {
    pub decoded: Vec<Message>,
    pub source: CodecError,
}

/// Stateful frame encoder/decoder for one connection.
#[derive(Debug)]
pub struct FrameCodec {
    outbound: TextEncoding,
    inbound: TextEncoding,
    max_frame_len: usize,
    /// Payload length announced by the last prefix, if its payload is still
    /// incomplete.
    expected_len: Option<usize>,
    buffer: Vec<u8>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(TextEncoding::Utf8)
    }
}

impl FrameCodec {
    /// Codec using the same encoding in both directions.
    pub fn new(encoding: TextEncoding) -> Self {
        Self::with_encodings(encoding, encoding)
    }

    pub fn with_encodings(outbound: TextEncoding, inbound: TextEncoding) -> Self {
        Self {
            outbound,
            inbound,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            expected_len: None,
            buffer: Vec::new(),
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Serialize `message` into a complete frame.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let text = serde_json::to_string(message)?;
        let payload = encode_text(&text, self.outbound);
        if payload.len() > self.max_frame_len || payload.len() > u32::MAX as usize {
            return Err(CodecError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Append `incoming` to the stream and return every message completed by
    /// it, in order.
    ///
    /// Frames whose payload is not valid text or JSON, or that do not form a
    /// valid envelope, are logged and skipped. An oversized length prefix is
    /// returned as [`FramingLost`], together with the messages that preceded
    /// it. The buffer is discarded and the connection should be dropped.
    pub fn decode_stream(&mut self, incoming: &[u8]) -> Result<Vec<Message>, FramingLost> {
        self.buffer.extend_from_slice(incoming);

        let mut messages = Vec::new();
        let mut offset = 0;
        loop {
            let len = match self.expected_len {
                Some(len) => len,
                None => {
                    let Some(prefix) = self.buffer.get(offset..offset + LENGTH_PREFIX_SIZE) else {
                        break;
                    };
                    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]])
                        as usize;
                    offset += LENGTH_PREFIX_SIZE;
                    if len > self.max_frame_len {
                        self.reset();
                        return Err(FramingLost {
                            decoded: messages,
                            source: CodecError::FrameTooLarge {
                                len,
                                max: self.max_frame_len,
                            },
                        });
                    }
                    self.expected_len = Some(len);
                    len
                }
            };

            let Some(payload) = self.buffer.get(offset..offset + len) else {
                break;
            };
            if let Some(message) = self.decode_payload(payload) {
                messages.push(message);
            }
            offset += len;
            self.expected_len = None;
        }

        self.buffer.drain(..offset);
        Ok(messages)
    }

    /// Bytes held back while waiting for the rest of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Payload length of the frame currently being assembled.
    pub fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    /// Drop all partial state, e.g. after reconnecting.
    pub fn reset(&mut self) {
        self.expected_len = None;
        self.buffer.clear();
    }

    fn decode_payload(&self, payload: &[u8]) -> Option<Message> {
        if payload.is_empty() {
            tracing::debug!("skipping empty frame");
            return None;
        }

        let Some(text) = decode_text(payload, self.inbound) else {
            tracing::warn!(
                len = payload.len(),
                encoding = ?self.inbound,
                "ignoring frame, payload is not valid text"
            );
            return None;
        };

        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, payload = %text, "ignoring frame, not well formed JSON");
                return None;
            }
        };

        match Message::from_value(value) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(error = %e, payload = %text, "ignoring frame, not a valid message");
                None
            }
        }
    }
}

fn encode_text(text: &str, encoding: TextEncoding) -> Vec<u8> {
    match encoding {
        TextEncoding::Utf8 => text.as_bytes().to_vec(),
        TextEncoding::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
    }
}

fn decode_text(payload: &[u8], encoding: TextEncoding) -> Option<String> {
    match encoding {
        TextEncoding::Utf8 => std::str::from_utf8(payload).ok().map(str::to_owned),
        TextEncoding::Utf16Be => {
            if payload.len() % 2 != 0 {
                return None;
            }
            let units = payload
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
            char::decode_utf16(units).collect::<Result<String, _>>().ok()
        }
    }
}
