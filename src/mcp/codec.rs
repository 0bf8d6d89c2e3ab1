//! Wire framing for both transports
//!
//! Stdio uses newline-delimited JSON through [`JsonLineCodec`]. HTTP bodies
//! carry one message or a batch array and are decoded with [`decode_body`].

use std::io;

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::ProtocolError;
use crate::mcp::message::{Message, RequestId};

pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// A frame that could not be turned into a [`Message`].
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct DecodeError {
    pub id: Option<RequestId>,
    pub reason: ProtocolError,
}

impl DecodeError {
    pub fn new(id: Option<RequestId>, reason: ProtocolError) -> Self {
        Self { id, reason }
    }

    /// Error frame to send back, or `None` when no id was recoverable.
    pub fn reply(self) -> Option<Message> {
        let id = self.id?;
        Some(self.reason.into_message(Some(id)))
    }
}

#[derive(Debug)]
pub enum Frame {
    Message(Message),
    Malformed(DecodeError),
}

pub fn decode_slice(bytes: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| DecodeError::new(None, ProtocolError::Parse(err.to_string())))?;
    Message::from_value(value)
}

/// Decodes an HTTP request body. A batch yields one entry per element, so a
/// bad element does not hide its well-formed neighbours.
pub fn decode_body(bytes: &[u8]) -> Result<Vec<Result<Message, DecodeError>>, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| DecodeError::new(None, ProtocolError::Parse(err.to_string())))?;

    match value {
        Value::Array(items) if items.is_empty() => Err(DecodeError::new(
            None,
            ProtocolError::InvalidRequest("empty batch".into()),
        )),
        Value::Array(items) => Ok(items.into_iter().map(Message::from_value).collect()),
        single => Ok(vec![Message::from_value(single)]),
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Newline-delimited JSON codec. Malformed lines surface as
/// [`Frame::Malformed`] instead of an error so the stream keeps going.
#[derive(Debug)]
pub struct JsonLineCodec {
    next_index: usize,
    discarding: bool,
    max_length: usize,
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            discarding: false,
            max_length,
        }
    }

    fn oversized(&self) -> Frame {
        Frame::Malformed(DecodeError::new(
            None,
            ProtocolError::Parse(format!("frame exceeds {} bytes", self.max_length)),
        ))
    }

    fn decode_line(line: &[u8]) -> Option<Frame> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }
        Some(match decode_slice(line) {
            Ok(message) => Frame::Message(message),
            Err(err) => Frame::Malformed(err),
        })
    }
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLineCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|byte| *byte == b'\n')
                .map(|offset| self.next_index + offset);

            let Some(end) = newline else {
                if buf.len() > self.max_length {
                    // Drop what we have and skip ahead to the next delimiter.
                    self.discarding = true;
                    buf.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = buf.len();
                }
                return Ok(None);
            };

            let line = buf.split_to(end + 1);
            self.next_index = 0;

            if self.discarding {
                self.discarding = false;
                return Ok(Some(self.oversized()));
            }
            if end > self.max_length {
                return Ok(Some(self.oversized()));
            }
            if let Some(frame) = Self::decode_line(&line[..end]) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(self.oversized()));
        }

        let rest = buf.split();
        Ok(Self::decode_line(&rest))
    }
}

impl Encoder<Message> for JsonLineCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> io::Result<()> {
        let bytes = encode(&message)?;
        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}
