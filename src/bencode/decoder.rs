//! Pull-based bencode decoder over an in-memory byte slice.
use super::{BencodeDict, BencodeError, BencodeResult, BencodeValue};
use tracing::instrument;

/// Decodes a single bencode value from `input`.
///
/// Trailing bytes after the value are ignored; callers that need to detect
/// trailing garbage can compare the cursor's final position themselves via
/// [`decode_prefix`].
#[instrument(skip(input), level = "debug")]
pub fn decode(input: &[u8]) -> BencodeResult<BencodeValue> {
    let mut cursor = Cursor::new(input);
    cursor.decode_value()
}

/// Decodes a single bencode value and returns it together with the number
/// of bytes consumed, leaving the caller free to inspect or decode
/// whatever follows.
pub fn decode_prefix(input: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut cursor = Cursor::new(input);
    let value = cursor.decode_value()?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn advance(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BencodeError::UnexpectedEof)?;
        let slice = self
            .input
            .get(self.pos..end)
            .ok_or(BencodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn expect(&mut self, byte: u8) -> BencodeResult<()> {
        if self.peek()? == byte {
            self.pos += 1;
            Ok(())
        } else {
            Err(BencodeError::UnexpectedToken {
                offset: self.pos,
                description: format!("expected '{}'", byte as char),
            })
        }
    }

    /// Reads ASCII digit bytes (with an optional leading `-`) up to `until`.
    fn read_digits_until(&mut self, until: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        let terminator = self
            .input
            .get(start..)
            .and_then(|rest| rest.iter().position(|&b| b == until))
            .ok_or(BencodeError::MissingTerminator { offset: start })?;
        let end = start + terminator;
        self.pos = end + 1;
        Ok(&self.input[start..end])
    }

    fn decode_value(&mut self) -> BencodeResult<BencodeValue> {
        match self.peek()? {
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            b'0'..=b'9' => self.decode_string().map(BencodeValue::String),
            other => Err(BencodeError::UnexpectedToken {
                offset: self.pos,
                description: format!("unexpected byte 0x{other:02x}"),
            }),
        }
    }

    /// `<len>:<bytes>` — `len` must be a non-negative decimal with no
    /// leading zero (other than the literal value `0`).
    fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let offset = self.pos;
        let digits = self.read_digits_until(b':')?;
        let text = std::str::from_utf8(digits)
            .map_err(|_| BencodeError::InvalidStringLength { offset })?;
        if text.starts_with('-') {
            return Err(BencodeError::UnexpectedToken {
                offset,
                description: "string length cannot be negative".into(),
            });
        }
        if text.len() > 1 && text.starts_with('0') {
            return Err(BencodeError::InvalidStringLength { offset });
        }
        let length: usize = text
            .parse()
            .map_err(|_| BencodeError::InvalidStringLength { offset })?;
        Ok(self.advance(length)?.to_vec())
    }

    /// `i<digits>e`.
    fn decode_integer(&mut self) -> BencodeResult<i64> {
        let offset = self.pos;
        self.expect(b'i')?;
        let digits = self.read_digits_until(b'e')?;
        let text =
            std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger { offset })?;
        if text.is_empty() || text == "-" || text == "-0" {
            return Err(BencodeError::InvalidInteger { offset });
        }
        let unsigned = text.strip_prefix('-').unwrap_or(text);
        if unsigned.len() > 1 && unsigned.starts_with('0') {
            return Err(BencodeError::InvalidInteger { offset });
        }
        text.parse().map_err(|_| BencodeError::InvalidInteger { offset })
    }

    /// `l<items>e`.
    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        self.expect(b'l')?;
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.decode_value()?);
        }
    }

    /// `d(<key><value>)*e`. Key order from the source is preserved.
    fn decode_dict(&mut self) -> BencodeResult<BencodeDict> {
        self.expect(b'd')?;
        let mut dict = BencodeDict::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(dict);
            }
            let key = match self.decode_value()? {
                BencodeValue::String(s) => s,
                _ => return Err(BencodeError::DictKeyNotString),
            };
            let value = self.decode_value()?;
            dict.insert(key, value);
        }
    }
}
