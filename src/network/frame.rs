//! Transport framing for the TCP link
//!
//! Header: magic(4) + frame type(1) + length(4) + sequence(4), big-endian,
//! followed by a bincode body. Channel packets travel inside `Frame::Packet`.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::protocol::MAGIC_BYTES;
use crate::transport::{ConnectionId, EndpointId};

/// Maximum frame body size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Header size: magic(4) + type(1) + length(4) + sequence(4) = 13 bytes
const HEADER_SIZE: usize = 13;

/// Framing errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Frame type {header:#04x} does not match body {body:#04x}")]
    TypeMismatch { header: u8, body: u8 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Frames exchanged by the TCP link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Sent by the client on connect
    Hello { protocol_version: u32, name: String },

    /// Server's answer; on acceptance carries the ids assigned to the client
    HelloAck {
        protocol_version: u32,
        accepted: bool,
        reason: Option<String>,
        connection: ConnectionId,
        endpoint: EndpointId,
    },

    /// One channel message
    Packet { channel: String, payload: Vec<u8> },

    /// Graceful disconnect
    Disconnect { reason: String },
}

impl Frame {
    /// Get the frame type identifier
    pub fn type_id(&self) -> u8 {
        match self {
            Frame::Hello { .. } => 0x01,
            Frame::HelloAck { .. } => 0x02,
            Frame::Packet { .. } => 0x10,
            Frame::Disconnect { .. } => 0xFE,
        }
    }
}

/// A frame with its sequence number
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sequence: u32,
    pub frame: Frame,
}

/// Encodes frames into the wire format
pub struct FrameEncoder {
    sequence: u32,
    max_frame_size: usize,
}

impl FrameEncoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            sequence: 0,
            max_frame_size,
        }
    }

    pub fn encode(&mut self, frame: &Frame, buf: &mut BytesMut) -> Result<(), FrameError> {
        let body = bincode::serialize(frame)?;

        if body.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge(body.len(), self.max_frame_size));
        }

        buf.reserve(HEADER_SIZE + body.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(frame.type_id());
        buf.put_u32(body.len() as u32);
        buf.put_u32(self.sequence);
        buf.put_slice(&body);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

/// Decodes frames from the wire format
pub struct FrameDecoder {
    state: DecodeState,
    max_frame_size: usize,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Body {
        frame_type: u8,
        length: usize,
        sequence: u32,
    },
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_frame_size,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, FrameError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MAGIC_BYTES {
                        return Err(FrameError::InvalidMagic);
                    }

                    let frame_type = buf[4];
                    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                    let sequence = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);

                    if length > self.max_frame_size {
                        return Err(FrameError::FrameTooLarge(length, self.max_frame_size));
                    }

                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Body {
                        frame_type,
                        length,
                        sequence,
                    };
                }
                DecodeState::Body {
                    frame_type,
                    length,
                    sequence,
                } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let body = buf.split_to(length);
                    self.state = DecodeState::Header;

                    let frame: Frame = bincode::deserialize(&body)?;
                    if frame.type_id() != frame_type {
                        return Err(FrameError::TypeMismatch {
                            header: frame_type,
                            body: frame.type_id(),
                        });
                    }

                    return Ok(Some(Envelope { sequence, frame }));
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_reads() {
        let mut encoder = FrameEncoder::default();
        let mut decoder = FrameDecoder::default();
        let mut wire = BytesMut::new();

        let frame = Frame::Packet {
            channel: "bounce".to_string(),
            payload: vec![1, 0, 0, 0, 0, 0, 0, 0, 5],
        };
        encoder.encode(&frame, &mut wire).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..5]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[5..20]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[20..]);

        let envelope = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(envelope.sequence, 0);
        assert_eq!(envelope.frame, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_sequence_numbers() {
        let mut encoder = FrameEncoder::default();
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();

        let frames = vec![
            Frame::Hello {
                protocol_version: 1,
                name: "client".to_string(),
            },
            Frame::Disconnect {
                reason: "bye".to_string(),
            },
        ];
        for frame in &frames {
            encoder.encode(frame, &mut buf).unwrap();
        }

        for i in 0..frames.len() {
            let envelope = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(envelope.sequence, i as u32);
            assert_eq!(envelope.frame, frames[i]);
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&[0u8; HEADER_SIZE][..]);
        assert!(matches!(decoder.decode(&mut buf), Err(FrameError::InvalidMagic)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut encoder = FrameEncoder::new(8);
        let frame = Frame::Packet {
            channel: "bounce".to_string(),
            payload: vec![0; 32],
        };
        assert!(matches!(
            encoder.encode(&frame, &mut BytesMut::new()),
            Err(FrameError::FrameTooLarge(_, 8))
        ));
    }
}
