//! Frame encoding and decoding.
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────────────┐
//! │  Version (2) │   Kind (2)   │      Body Length (4)       │
//! ├──────────────┴──────────────┴────────────────────────────┤
//! │                 MessagePack-encoded body                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All header integers are big-endian. The body type is chosen by the kind.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::protocol::envelope::{Envelope, MessageKind, CURRENT_VERSION, MIN_SUPPORTED_VERSION};
use crate::protocol::message::Message;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum body size (10 MiB).
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub kind: MessageKind,
    pub body_len: u32,
}

impl FrameHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.kind.as_u16().to_be_bytes());
        buf[4..8].copy_from_slice(&self.body_len.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(CodecError::Truncated {
                expected: FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        let raw_kind = u16::from_be_bytes([bytes[2], bytes[3]]);
        let body_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if !(MIN_SUPPORTED_VERSION..=CURRENT_VERSION).contains(&version) {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let kind = MessageKind::from_u16(raw_kind).ok_or(CodecError::UnknownKind(raw_kind))?;

        let header = Self {
            version,
            kind,
            body_len,
        };
        header.validate_body_len()?;
        Ok(header)
    }

    pub fn validate_body_len(&self) -> Result<(), CodecError> {
        let len = self.body_len as usize;
        if len > MAX_BODY_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: len,
                max: MAX_BODY_SIZE,
            });
        }
        Ok(())
    }
}

/// Encodes `body` under `envelope`. Identical input always yields identical bytes.
pub fn encode(envelope: &Envelope, body: &Message) -> Result<Vec<u8>, CodecError> {
    if envelope.kind != body.kind() {
        return Err(CodecError::KindMismatch {
            envelope: envelope.kind.to_string(),
            body: body.kind().to_string(),
        });
    }
    if !envelope.is_compatible() {
        return Err(CodecError::UnsupportedVersion(envelope.version));
    }

    let payload = match body {
        Message::Job(m) => to_body(m)?,
        Message::Result(m) => to_body(m)?,
        Message::Heartbeat(m) => to_body(m)?,
        Message::ControlAck(m) => to_body(m)?,
        Message::Cancel(m) => to_body(m)?,
    };
    if payload.len() > MAX_BODY_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: payload.len(),
            max: MAX_BODY_SIZE,
        });
    }

    let header = FrameHeader {
        version: envelope.version,
        kind: envelope.kind,
        body_len: payload.len() as u32,
    };
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Encodes a message under a current-version envelope of the matching kind.
pub fn encode_message(body: &Message) -> Result<Vec<u8>, CodecError> {
    encode(&Envelope::new(body.kind()), body)
}

/// Decodes a complete frame. Truncated frames, trailing bytes and bodies
/// that do not parse as the declared kind are all rejected.
pub fn decode(bytes: &[u8]) -> Result<(Envelope, Message), CodecError> {
    let header = FrameHeader::decode(bytes)?;
    let expected = FRAME_HEADER_SIZE + header.body_len as usize;
    if bytes.len() < expected {
        return Err(CodecError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    if bytes.len() > expected {
        return Err(CodecError::TrailingBytes(bytes.len() - expected));
    }

    let body = &bytes[FRAME_HEADER_SIZE..];
    let message = match header.kind {
        MessageKind::Job => Message::Job(from_body(body)?),
        MessageKind::Result => Message::Result(from_body(body)?),
        MessageKind::Heartbeat => Message::Heartbeat(from_body(body)?),
        MessageKind::ControlAck => Message::ControlAck(from_body(body)?),
        MessageKind::Cancel => Message::Cancel(from_body(body)?),
    };

    let envelope = Envelope {
        version: header.version,
        kind: header.kind,
    };
    Ok((envelope, message))
}

fn to_body<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode(e.to_string()))
}

fn from_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
