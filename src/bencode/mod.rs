//! Bencode codec used to parse `.torrent` metadata and tracker replies.
//!
//! Bencode has four value kinds: byte strings (`<len>:<bytes>`), integers
//! (`i<digits>e`), lists (`l<items>e`), and dictionaries
//! (`d(<key><value>)*e`). Dictionary keys are byte strings and canonical
//! order sorts them by raw byte value; decoding preserves whatever order the
//! source bytes were in so that re-encoding the `info` subtree reproduces
//! the exact bytes used to compute `info_hash`.
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded or to-be-encoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BencodeDict),
}

/// An ordered bencode dictionary.
///
/// Backed by a `Vec` rather than a hash map: bencode dictionaries are only
/// canonical when their keys are sorted, but the decoder must preserve
/// whatever order it found in the source bytes (see module docs), and a
/// hash map cannot make that distinction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BencodeDict(Vec<(Vec<u8>, BencodeValue)>);

impl BencodeDict {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Inserts a key, overwriting any existing value for the same key but
    /// keeping that key's original position.
    pub fn insert(&mut self, key: Vec<u8>, value: BencodeValue) {
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| k == &key) {
            slot.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<BencodeValue> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Vec<u8>, BencodeValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy of this dictionary with its keys sorted by raw byte
    /// value, i.e. in bencode canonical order.
    pub fn into_canonical(mut self) -> Self {
        self.0.sort_by(|(a, _), (b, _)| a.cmp(b));
        self
    }
}

impl FromIterator<(Vec<u8>, BencodeValue)> for BencodeDict {
    fn from_iter<I: IntoIterator<Item = (Vec<u8>, BencodeValue)>>(iter: I) -> Self {
        let mut dict = BencodeDict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected token at offset {offset}: {description}")]
    UnexpectedToken { offset: usize, description: String },

    #[error("invalid string length at offset {offset}")]
    InvalidStringLength { offset: usize },

    #[error("invalid integer at offset {offset}")]
    InvalidInteger { offset: usize },

    #[error("missing terminator for value starting at offset {offset}")]
    MissingTerminator { offset: usize },

    #[error("dictionary keys must be byte strings")]
    DictKeyNotString,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

pub use decoder::decode;
pub use encoder::encode;

#[cfg(test)]
mod tests {
    use super::*;

    fn s(bytes: &[u8]) -> BencodeValue {
        BencodeValue::String(bytes.to_vec())
    }

    #[test]
    fn round_trip_dict() {
        let input = b"d3:cow3:moo4:spam4:eggse";
        let value = decode(input).unwrap();
        let mut expected = BencodeDict::new();
        expected.insert(b"cow".to_vec(), s(b"moo"));
        expected.insert(b"spam".to_vec(), s(b"eggs"));
        assert_eq!(value, BencodeValue::Dict(expected));

        let reencoded = encode(&value).unwrap();
        assert_eq!(reencoded, input);
    }

    #[test]
    fn round_trip_list_and_integer() {
        let input = b"li42ei-1ee";
        let value = decode(input).unwrap();
        assert_eq!(
            value,
            BencodeValue::List(vec![BencodeValue::Integer(42), BencodeValue::Integer(-1)])
        );
        assert_eq!(encode(&value).unwrap(), input);
    }

    #[test]
    fn round_trip_string() {
        let input = b"4:spam";
        let value = decode(input).unwrap();
        assert_eq!(value, s(b"spam"));
        assert_eq!(encode(&value).unwrap(), input);
    }

    #[test]
    fn decode_preserves_nesting() {
        let input = b"d4:infod6:lengthi100e4:name4:filee8:announce3:urle";
        let value = decode(input).unwrap();
        let BencodeValue::Dict(dict) = &value else {
            panic!("expected dict");
        };
        assert!(dict.get(b"info").is_some());
        assert!(dict.get(b"announce").is_some());
        assert_eq!(encode(&value).unwrap(), input);
    }

    #[test]
    fn rejects_truncated_string() {
        let err = decode(b"5:hi").unwrap_err();
        assert!(matches!(err, BencodeError::UnexpectedEof));
    }

    #[test]
    fn rejects_negative_length() {
        let err = decode(b"-1:x").unwrap_err();
        assert!(matches!(err, BencodeError::UnexpectedToken { .. }));
    }

    #[test]
    fn rejects_missing_terminator() {
        let err = decode(b"i42").unwrap_err();
        assert!(matches!(err, BencodeError::MissingTerminator { offset: 1 }));
    }

    #[test]
    fn rejects_non_digit_length() {
        let err = decode(b"a:hi").unwrap_err();
        assert!(matches!(err, BencodeError::UnexpectedToken { .. }));
    }
}
