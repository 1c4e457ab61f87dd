//! Length-prefixed peer message framing: `<len:u32><id:u8><payload>`.
//!
//! The decoder is pull-based over a caller-owned growing buffer (per the
//! design note on avoiding generator-style parsers): each call inspects
//! the buffer's front, and either reports that more bytes are needed or
//! hands back one parsed message plus how many bytes it consumed. The
//! caller is responsible for draining consumed bytes and re-calling for
//! whatever follows.
use bytes::{Buf, Bytes};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message payload too short for id {id}: got {got} bytes, need {need}")]
    PayloadTooShort { id: u8, got: usize, need: usize },
}

pub type MessageResult<T> = std::result::Result<T, MessageError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have { .. } => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
        }
    }

    /// Serializes this message to its wire frame, including the 4-byte
    /// length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return vec![0, 0, 0, 0];
        };
        let mut payload = Vec::new();
        match self {
            Message::Have { index } => payload.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bits) => payload.extend_from_slice(bits),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            _ => {}
        }
        let len = 1 + payload.len() as u32;
        let mut frame = Vec::with_capacity(4 + payload.len() + 1);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(id);
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Result of one decode attempt over the front of a buffer.
pub enum Decoded {
    /// Fewer than a full frame's bytes are currently buffered.
    Incomplete,
    /// A full frame was consumed. `message` is `None` when the frame's id
    /// byte was unrecognized — it is still consumed (and logged by the
    /// caller), just not turned into a `Message`.
    Frame { message: Option<Message>, consumed: usize },
}

/// Attempts to decode exactly one frame from the front of `buf`.
pub fn decode_frame(buf: &[u8]) -> MessageResult<Decoded> {
    if buf.len() < 4 {
        return Ok(Decoded::Incomplete);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        return Ok(Decoded::Frame {
            message: Some(Message::KeepAlive),
            consumed: 4,
        });
    }
    if buf.len() < 4 + len {
        return Ok(Decoded::Incomplete);
    }

    let id = buf[4];
    let mut payload = bytes::Bytes::copy_from_slice(&buf[5..4 + len]);
    let consumed = 4 + len;

    let require = |got: usize, need: usize| -> MessageResult<()> {
        if got < need {
            Err(MessageError::PayloadTooShort { id, got, need })
        } else {
            Ok(())
        }
    };

    let message = match id {
        0 => Some(Message::Choke),
        1 => Some(Message::Unchoke),
        2 => Some(Message::Interested),
        3 => Some(Message::NotInterested),
        4 => {
            require(payload.len(), 4)?;
            Some(Message::Have { index: payload.get_u32() })
        }
        5 => Some(Message::Bitfield(payload)),
        6 => {
            require(payload.len(), 12)?;
            Some(Message::Request {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            })
        }
        7 => {
            require(payload.len(), 8)?;
            let index = payload.get_u32();
            let begin = payload.get_u32();
            Some(Message::Piece {
                index,
                begin,
                block: payload,
            })
        }
        8 => {
            require(payload.len(), 12)?;
            Some(Message::Cancel {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            })
        }
        _ => None,
    };

    Ok(Decoded::Frame { message, consumed })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let encoded = message.encode();
        match decode_frame(&encoded).unwrap() {
            Decoded::Frame { message: Some(decoded), consumed } => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, message);
            }
            _ => panic!("expected a decoded frame"),
        }
    }

    #[test]
    fn keep_alive_round_trips() {
        round_trip(Message::KeepAlive);
    }

    #[test]
    fn have_encodes_per_spec_example() {
        let encoded = Message::Have { index: 5 }.encode();
        assert_eq!(encoded, vec![0, 0, 0, 5, 4, 0, 0, 0, 5]);
        round_trip(Message::Have { index: 5 });
    }

    #[test]
    fn fixed_size_messages_round_trip() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
    }

    #[test]
    fn variable_length_messages_round_trip() {
        round_trip(Message::Bitfield(Bytes::from_static(&[0b1010_0000])));
        round_trip(Message::Request {
            index: 1,
            begin: 2,
            length: 16384,
        });
        round_trip(Message::Piece {
            index: 1,
            begin: 0,
            block: Bytes::from_static(b"payload"),
        });
        round_trip(Message::Cancel {
            index: 1,
            begin: 2,
            length: 16384,
        });
    }

    #[test]
    fn incomplete_header_reports_incomplete() {
        assert!(matches!(decode_frame(&[0, 0]).unwrap(), Decoded::Incomplete));
    }

    #[test]
    fn incomplete_payload_reports_incomplete() {
        let buf = [0, 0, 0, 5, 4]; // claims 5 bytes but only the id byte is present
        assert!(matches!(decode_frame(&buf).unwrap(), Decoded::Incomplete));
    }

    #[test]
    fn unknown_id_is_consumed_but_not_turned_into_a_message() {
        let buf = [0, 0, 0, 1, 200];
        match decode_frame(&buf).unwrap() {
            Decoded::Frame { message: None, consumed } => assert_eq!(consumed, 5),
            _ => panic!("expected a consumed-but-unrecognized frame"),
        }
    }

    #[test]
    fn trailing_bytes_are_left_untouched() {
        let mut buf = Message::Choke.encode();
        buf.extend_from_slice(&[1, 2, 3]);
        match decode_frame(&buf).unwrap() {
            Decoded::Frame { consumed, .. } => assert_eq!(consumed, 5),
            Decoded::Incomplete => panic!("expected a frame"),
        }
    }
}
