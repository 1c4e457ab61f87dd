//! Bencode encoder.
//!
//! Dictionaries are emitted in whatever key order the [`BencodeDict`] holds;
//! the encoder never sorts for you. Callers that need canonical form (e.g.
//! to compute `info_hash`) must build or convert the dictionary with
//! [`BencodeDict::into_canonical`] first.
use super::{BencodeDict, BencodeError, BencodeResult, BencodeValue};
use std::io::Write;
use tracing::instrument;

/// Encodes `value` to its bencode byte representation.
#[instrument(skip(value), level = "debug")]
pub fn encode(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(&mut buf, value)?;
    Ok(buf)
}

/// Encodes `value` into an existing writer, avoiding an intermediate
/// allocation when the caller already owns a buffer (e.g. building up a
/// tracker announce body).
pub fn encode_into<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(items) => encode_list(writer, items),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{i}e")?;
    Ok(())
}

fn encode_list<W: Write>(writer: &mut W, items: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in items {
        encode_into(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_dict<W: Write>(writer: &mut W, dict: &BencodeDict) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict.iter() {
        encode_string(writer, key)?;
        encode_into(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::decode;
    use super::*;

    #[test]
    fn encodes_text_as_utf8_bytes() {
        let value = BencodeValue::String("hello".as_bytes().to_vec());
        assert_eq!(encode(&value).unwrap(), b"5:hello");
    }

    #[test]
    fn canonical_order_sorts_keys() {
        let mut dict = BencodeDict::new();
        dict.insert(b"zebra".to_vec(), BencodeValue::Integer(1));
        dict.insert(b"apple".to_vec(), BencodeValue::Integer(2));
        let encoded = encode(&BencodeValue::Dict(dict.into_canonical())).unwrap();
        assert_eq!(encoded, b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn non_canonical_order_is_preserved() {
        let mut dict = BencodeDict::new();
        dict.insert(b"zebra".to_vec(), BencodeValue::Integer(1));
        dict.insert(b"apple".to_vec(), BencodeValue::Integer(2));
        let encoded = encode(&BencodeValue::Dict(dict)).unwrap();
        assert_eq!(encoded, b"d5:zebrai1e5:applei2ee");
    }

    #[test]
    fn decode_then_encode_is_identity_for_canonical_input() {
        let input = b"d3:cow3:moo4:spam4:eggse";
        let value = decode(input).unwrap();
        assert_eq!(encode(&value).unwrap(), input);
    }
}
