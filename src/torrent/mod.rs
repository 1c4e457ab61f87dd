//! Torrent metainfo: parses a `.torrent` file into the immutable facts the
//! rest of the engine needs — announce URL, info hash, piece layout, and
//! output file name.
use crate::bencode::{self, BencodeDict, BencodeValue};
use sha1::{Digest, Sha1};
use std::path::Path;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode: {0}")]
    Bencode(#[from] bencode::BencodeError),

    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(String),

    #[error("multi-file torrents are not supported")]
    UnsupportedMultiFile,
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;

/// Immutable metainfo for a single-file torrent, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub announce_url: String,
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub total_size: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub output_name: String,
}

impl Torrent {
    /// Reads and parses a `.torrent` file at `path`.
    #[instrument(level = "debug")]
    pub fn load(path: &Path) -> TorrentResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Parses an already-read `.torrent` file body.
    pub fn from_bytes(bytes: &[u8]) -> TorrentResult<Self> {
        let root = bencode::decode(bytes)?;
        let BencodeValue::Dict(mut root) = root else {
            return Err(TorrentError::InvalidMetainfo(
                "top-level value is not a dictionary".into(),
            ));
        };

        let announce_url = take_string(&mut root, "announce")?;

        let info_value = root
            .remove(b"info")
            .ok_or_else(|| missing("info"))?;
        let BencodeValue::Dict(info) = info_value else {
            return Err(TorrentError::InvalidMetainfo("info is not a dictionary".into()));
        };

        if info.get(b"files").is_some() {
            return Err(TorrentError::UnsupportedMultiFile);
        }

        // info_hash is computed over the info dictionary exactly as it was
        // laid out in the source file: a conformant torrent file already
        // stores its keys in canonical (sorted) order, so re-encoding the
        // decoded dictionary reproduces those bytes byte-for-byte.
        let info_hash = {
            let encoded = bencode::encode(&BencodeValue::Dict(info.clone()))?;
            let digest = Sha1::digest(&encoded);
            let mut out = [0u8; 20];
            out.copy_from_slice(&digest);
            out
        };

        let piece_length = take_integer(&info, "piece length")?;
        if piece_length <= 0 {
            return Err(TorrentError::InvalidMetainfo("piece length must be positive".into()));
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = take_bytes(&info, "pieces")?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::InvalidMetainfo(
                "pieces length is not a multiple of 20".into(),
            ));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let total_size = take_integer(&info, "length")?;
        if total_size < 0 {
            return Err(TorrentError::InvalidMetainfo("length must not be negative".into()));
        }
        let total_size = total_size as u64;

        let output_name = String::from_utf8(take_bytes(&info, "name")?)
            .map_err(|_| TorrentError::InvalidMetainfo("name is not valid utf-8".into()))?;

        Ok(Torrent {
            announce_url,
            info_hash,
            piece_length,
            total_size,
            piece_hashes,
            output_name,
        })
    }

    pub fn total_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size in bytes of the piece at `index`, accounting for a short final
    /// piece (ceiling division doesn't apply here: a piece is just
    /// whatever bytes remain).
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 < self.piece_hashes.len() {
            self.piece_length
        } else {
            let remainder = self.total_size % self.piece_length;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder
            }
        }
    }
}

fn missing(field: &str) -> TorrentError {
    TorrentError::InvalidMetainfo(format!("missing required field '{field}'"))
}

fn take_string(dict: &mut BencodeDict, key: &str) -> TorrentResult<String> {
    match dict.remove(key.as_bytes()) {
        Some(BencodeValue::String(bytes)) => {
            String::from_utf8(bytes).map_err(|_| TorrentError::InvalidMetainfo(format!("'{key}' is not valid utf-8")))
        }
        Some(_) => Err(TorrentError::InvalidMetainfo(format!("'{key}' is not a string"))),
        None => Err(missing(key)),
    }
}

fn take_integer(dict: &BencodeDict, key: &str) -> TorrentResult<i64> {
    match dict.get(key.as_bytes()) {
        Some(BencodeValue::Integer(i)) => Ok(*i),
        Some(_) => Err(TorrentError::InvalidMetainfo(format!("'{key}' is not an integer"))),
        None => Err(missing(key)),
    }
}

fn take_bytes(dict: &BencodeDict, key: &str) -> TorrentResult<Vec<u8>> {
    match dict.get(key.as_bytes()) {
        Some(BencodeValue::String(bytes)) => Ok(bytes.clone()),
        Some(_) => Err(TorrentError::InvalidMetainfo(format!("'{key}' is not a byte string"))),
        None => Err(missing(key)),
    }
}
