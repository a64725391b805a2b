//! Order-preserving key encoding.
//!
//! Every encoded key is self-delimiting, so no encoding is a proper prefix
//! of another. This lets index entries append a primary key after the index
//! key and still compare correctly, and it makes a partial tuple sort
//! directly before every tuple it prefixes.
//!
//! ```text
//! null    0x10
//! false   0x20
//! true    0x21
//! number  0x30 + 8 bytes (big-endian, sign-flipped IEEE 754)
//! text    0x40 + bytes with 0x00 escaped as 0x00 0xFF + 0x00 0x00
//! array   0x50 + encoded elements + 0x00
//! ```

use crate::error::{CodecError, CodecResult};
use crate::value::KeyValue;

const TAG_NULL: u8 = 0x10;
const TAG_FALSE: u8 = 0x20;
const TAG_TRUE: u8 = 0x21;
const TAG_NUMBER: u8 = 0x30;
const TAG_TEXT: u8 = 0x40;
const TAG_ARRAY: u8 = 0x50;

const ARRAY_END: u8 = 0x00;
const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TEXT_END: u8 = 0x00;

/// Byte that sorts after every continuation of an encoded key.
///
/// No encoding contains `0xFF` at a position where a continuation could
/// start (UTF-8 never emits it and escapes begin with `0x00`), so
/// `prefix ++ [KEY_CEILING]` bounds everything that starts with `prefix`.
pub const KEY_CEILING: u8 = 0xFF;

const SIGN_MASK: u64 = 1 << 63;

/// Encodes a key value into its order-preserving byte form.
///
/// # Errors
///
/// Returns [`CodecError::NaNForbidden`] for NaN numbers.
pub fn encode_key(value: &KeyValue) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    write_key(&mut out, value)?;
    Ok(out)
}

/// Encodes a string as a text key.
#[must_use]
pub fn encode_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 3);
    out.push(TAG_TEXT);
    push_escaped(&mut out, text.as_bytes());
    out.push(ESCAPE);
    out.push(TEXT_END);
    out
}

/// Returns the shared byte prefix of every text key starting with `prefix`.
#[must_use]
pub fn text_prefix(prefix: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 1);
    out.push(TAG_TEXT);
    push_escaped(&mut out, prefix.as_bytes());
    out
}

/// Returns `bytes ++ [KEY_CEILING]`: the smallest bound above every key
/// that starts with `bytes`.
#[must_use]
pub fn ceiling_of(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.extend_from_slice(bytes);
    out.push(KEY_CEILING);
    out
}

fn write_key(out: &mut Vec<u8>, value: &KeyValue) -> CodecResult<()> {
    match value {
        KeyValue::Null => out.push(TAG_NULL),
        KeyValue::Bool(false) => out.push(TAG_FALSE),
        KeyValue::Bool(true) => out.push(TAG_TRUE),
        KeyValue::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64(*n)?);
        }
        KeyValue::Text(s) => {
            out.push(TAG_TEXT);
            push_escaped(out, s.as_bytes());
            out.push(ESCAPE);
            out.push(TEXT_END);
        }
        KeyValue::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                write_key(out, item)?;
            }
            out.push(ARRAY_END);
        }
    }
    Ok(())
}

fn push_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == ESCAPE {
            out.push(ESCAPE);
            out.push(ESCAPED_ZERO);
        } else {
            out.push(b);
        }
    }
}

fn encode_f64(n: f64) -> CodecResult<[u8; 8]> {
    if n.is_nan() {
        return Err(CodecError::NaNForbidden);
    }
    // -0.0 and 0.0 are the same key
    let n = if n == 0.0 { 0.0 } else { n };
    let bits = n.to_bits();
    let ordered = if bits & SIGN_MASK != 0 {
        !bits
    } else {
        bits ^ SIGN_MASK
    };
    Ok(ordered.to_be_bytes())
}

fn decode_f64(bytes: [u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(bytes);
    let bits = if ordered & SIGN_MASK != 0 {
        ordered ^ SIGN_MASK
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

/// Decodes a complete key.
///
/// # Errors
///
/// Fails on malformed input or if bytes remain after the key.
pub fn decode_key(bytes: &[u8]) -> CodecResult<KeyValue> {
    let (value, used) = decode_key_prefix(bytes)?;
    if used != bytes.len() {
        return Err(CodecError::TrailingBytes {
            count: bytes.len() - used,
        });
    }
    Ok(value)
}

/// Decodes the key at the start of `bytes`, returning it with the number
/// of bytes consumed.
///
/// # Errors
///
/// Fails on malformed input.
pub fn decode_key_prefix(bytes: &[u8]) -> CodecResult<(KeyValue, usize)> {
    let mut reader = Reader { bytes, pos: 0 };
    let value = reader.read_key()?;
    Ok((value, reader.pos))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn next(&mut self) -> CodecResult<u8> {
        let b = *self.bytes.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> CodecResult<u8> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(CodecError::UnexpectedEof)
    }

    fn read_key(&mut self) -> CodecResult<KeyValue> {
        let offset = self.pos;
        match self.next()? {
            TAG_NULL => Ok(KeyValue::Null),
            TAG_FALSE => Ok(KeyValue::Bool(false)),
            TAG_TRUE => Ok(KeyValue::Bool(true)),
            TAG_NUMBER => {
                let end = self.pos + 8;
                let raw: [u8; 8] = self
                    .bytes
                    .get(self.pos..end)
                    .ok_or(CodecError::UnexpectedEof)?
                    .try_into()
                    .map_err(|_| CodecError::decoding_failed("invalid number"))?;
                self.pos = end;
                Ok(KeyValue::Number(decode_f64(raw)))
            }
            TAG_TEXT => self.read_text().map(KeyValue::Text),
            TAG_ARRAY => {
                let mut items = Vec::new();
                while self.peek()? != ARRAY_END {
                    items.push(self.read_key()?);
                }
                self.pos += 1;
                Ok(KeyValue::Array(items))
            }
            tag => Err(CodecError::UnknownTag { tag, offset }),
        }
    }

    fn read_text(&mut self) -> CodecResult<String> {
        let mut raw = Vec::new();
        loop {
            let b = self.next()?;
            if b != ESCAPE {
                raw.push(b);
                continue;
            }
            match self.next()? {
                TEXT_END => break,
                ESCAPED_ZERO => raw.push(0),
                other => {
                    return Err(CodecError::decoding_failed(format!(
                        "invalid escape byte 0x{other:02x}"
                    )))
                }
            }
        }
        String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn enc(v: impl Into<KeyValue>) -> Vec<u8> {
        encode_key(&v.into()).unwrap()
    }

    fn tuple(items: Vec<KeyValue>) -> KeyValue {
        KeyValue::Array(items)
    }

    #[test]
    fn numbers_sort_by_magnitude() {
        let values = [f64::NEG_INFINITY, -1e9, -2.5, -1.0, 0.0, 0.5, 1.0, 3.0, 1e12, f64::INFINITY];
        for pair in values.windows(2) {
            assert!(
                enc(KeyValue::Number(pair[0])) < enc(KeyValue::Number(pair[1])),
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn negative_zero_is_zero() {
        assert_eq!(enc(KeyValue::Number(-0.0)), enc(KeyValue::Number(0.0)));
    }

    #[test]
    fn strings_sort_by_code_point() {
        let values = ["", "\0", "\0a", "a", "a\0", "ab", "b", "é", "\u{1F600}"];
        for pair in values.windows(2) {
            assert!(enc(pair[0]) < enc(pair[1]), "{:?} < {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn partial_tuple_sorts_before_extensions() {
        let rice = tuple(vec!["Rice".into()]);
        let rice_jared = tuple(vec!["Rice".into(), "Jared".into()]);
        let rice_stan = tuple(vec!["Rice".into(), "Stan".into()]);
        let riceb = tuple(vec!["Riceb".into()]);
        assert!(enc(rice.clone()) < enc(rice_jared.clone()));
        assert!(enc(rice_jared) < enc(rice_stan.clone()));
        assert!(enc(rice_stan) < enc(riceb));
    }

    #[test]
    fn encodings_are_prefix_free() {
        let a = enc(tuple(vec!["a".into()]));
        let b = enc(tuple(vec!["a".into(), 1.into()]));
        assert!(!b.starts_with(&a));
        assert!(!enc("ab").starts_with(&enc("a")));
    }

    #[test]
    fn decode_restores_values() {
        let value = tuple(vec![
            KeyValue::Null,
            true.into(),
            KeyValue::Number(-12.75),
            "with\0nul".into(),
            tuple(vec![]),
        ]);
        assert_eq!(decode_key(&encode_key(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn decode_prefix_reports_consumed_bytes() {
        let mut bytes = enc("key");
        let key_len = bytes.len();
        bytes.extend(encode_text("dweb://a/1.json"));
        let (value, used) = decode_key_prefix(&bytes).unwrap();
        assert_eq!(value, KeyValue::from("key"));
        assert_eq!(used, key_len);
        assert_eq!(
            decode_key(&bytes[used..]).unwrap(),
            KeyValue::from("dweb://a/1.json")
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_key(&[0x99]),
            Err(CodecError::UnknownTag { tag: 0x99, .. })
        ));
        assert_eq!(decode_key(&[TAG_TEXT, b'a']), Err(CodecError::UnexpectedEof));
        assert!(matches!(
            decode_key(&[TAG_NULL, TAG_NULL]),
            Err(CodecError::TrailingBytes { count: 1 })
        ));
    }

    #[test]
    fn text_prefix_covers_extensions() {
        let prefix = text_prefix("ap");
        let ceiling = ceiling_of(&prefix);
        for s in ["ap", "apple", "ap\0", "apé"] {
            let key = enc(s);
            assert!(key >= prefix && key < ceiling, "{s:?} inside prefix range");
        }
        for s in ["ao", "aq", "a"] {
            let key = enc(s);
            assert!(key < prefix || key >= ceiling, "{s:?} outside prefix range");
        }
    }

    proptest! {
        #[test]
        fn number_order_preserved(a in any::<f64>(), b in any::<f64>()) {
            prop_assume!(!a.is_nan() && !b.is_nan());
            let (ka, kb) = (enc(KeyValue::Number(a)), enc(KeyValue::Number(b)));
            prop_assert_eq!(a.partial_cmp(&b).unwrap(), ka.cmp(&kb));
        }

        #[test]
        fn string_order_preserved(a in ".*", b in ".*") {
            prop_assert_eq!(a.cmp(&b), enc(a.as_str()).cmp(&enc(b.as_str())));
        }

        #[test]
        fn tuple_order_preserved(
            a in prop::collection::vec(("[a-c]{0,3}", -5i32..5), 1..3),
            b in prop::collection::vec(("[a-c]{0,3}", -5i32..5), 1..3),
        ) {
            let to_key = |items: &Vec<(String, i32)>| {
                KeyValue::Array(
                    items
                        .iter()
                        .map(|(s, n)| KeyValue::Array(vec![s.as_str().into(), (*n).into()]))
                        .collect(),
                )
            };
            prop_assert_eq!(a.cmp(&b), enc(to_key(&a)).cmp(&enc(to_key(&b))));
        }
    }
}
