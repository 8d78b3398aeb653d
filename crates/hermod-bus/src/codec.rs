//! Compact binary serialization for [`ValueContainer`].
//!
//! The format is a self-describing stream of entries:
//!
//! ```text
//! <tag:1 byte><key-len:varint><key bytes><value-len:varint><value bytes>
//! ```
//!
//! Integers are little-endian at the fixed width of their tag, floats are
//! IEEE-754, strings are UTF-8 and byte sequences are raw. Nested containers
//! are embedded with their total encoded length as the value length, so a
//! reader can skip an entry without recursing. Varints are unsigned LEB128.
//!
//! Exactly one tag alphabet is emitted and accepted (the constants below);
//! the alternative character-code alphabet seen in older payloads is not
//! wire-compatible and is rejected as an unknown tag.
//!
//! Decoding fails with `InvalidPayload` on an unknown tag, a truncated
//! stream, a length that disagrees with the tag's fixed width, or nesting
//! deeper than [`MAX_DEPTH`].

use crate::error::{BusError, BusResult};
use crate::value::{Value, ValueContainer};

/// Maximum container nesting depth accepted by encode and decode.
pub const MAX_DEPTH: usize = 32;

mod tag {
    pub const NULL: u8 = 0x00;
    pub const BOOL: u8 = 0x01;
    pub const I8: u8 = 0x02;
    pub const I16: u8 = 0x03;
    pub const I32: u8 = 0x04;
    pub const I64: u8 = 0x05;
    pub const U8: u8 = 0x06;
    pub const U16: u8 = 0x07;
    pub const U32: u8 = 0x08;
    pub const U64: u8 = 0x09;
    pub const F32: u8 = 0x0A;
    pub const F64: u8 = 0x0B;
    pub const STR: u8 = 0x0C;
    pub const BYTES: u8 = 0x0D;
    pub const CONTAINER: u8 = 0x0E;
}

/// Serialize a container to its binary form.
pub fn encode(container: &ValueContainer) -> BusResult<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded_len(container));
    encode_into(container, &mut out, 0)?;
    Ok(out)
}

/// Deserialize a container from its binary form.
///
/// The whole input must be consumed; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> BusResult<ValueContainer> {
    let mut cursor = Cursor { buf: bytes, pos: 0 };
    let container = decode_container(&mut cursor, bytes.len(), 0)?;
    if cursor.pos != bytes.len() {
        return Err(BusError::InvalidPayload(format!(
            "trailing bytes after container: {} unread",
            bytes.len() - cursor.pos
        )));
    }
    Ok(container)
}

/// Serialize to the human-readable secondary form (JSON).
pub fn encode_json(container: &ValueContainer) -> BusResult<String> {
    serde_json::to_string(container).map_err(BusError::from)
}

/// Deserialize from the human-readable secondary form (JSON).
pub fn decode_json(text: &str) -> BusResult<ValueContainer> {
    serde_json::from_str(text).map_err(BusError::from)
}

/// Exact byte length of [`encode`]'s output for `container`.
pub fn encoded_len(container: &ValueContainer) -> usize {
    container
        .iter()
        .map(|(key, value)| {
            let vlen = value_len(value);
            1 + varint_len(key.len() as u64) + key.len() + varint_len(vlen as u64) + vlen
        })
        .sum()
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::I8(_) | Value::U8(_) => 1,
        Value::I16(_) | Value::U16(_) => 2,
        Value::I32(_) | Value::U32(_) | Value::F32(_) => 4,
        Value::I64(_) | Value::U64(_) | Value::F64(_) => 8,
        Value::Str(s) => s.len(),
        Value::Bytes(b) => b.len(),
        Value::Container(c) => encoded_len(c),
    }
}

fn encode_into(container: &ValueContainer, out: &mut Vec<u8>, depth: usize) -> BusResult<()> {
    if depth >= MAX_DEPTH {
        return Err(BusError::InvalidPayload(format!(
            "container nesting exceeds max depth {MAX_DEPTH}"
        )));
    }

    for (key, value) in container.iter() {
        out.push(value_tag(value));
        write_varint(out, key.len() as u64);
        out.extend_from_slice(key.as_bytes());
        write_varint(out, value_len(value) as u64);
        match value {
            Value::Null => {}
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Str(s) => out.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => out.extend_from_slice(b),
            Value::Container(c) => encode_into(c, out, depth + 1)?,
        }
    }
    Ok(())
}

fn value_tag(value: &Value) -> u8 {
    match value {
        Value::Null => tag::NULL,
        Value::Bool(_) => tag::BOOL,
        Value::I8(_) => tag::I8,
        Value::I16(_) => tag::I16,
        Value::I32(_) => tag::I32,
        Value::I64(_) => tag::I64,
        Value::U8(_) => tag::U8,
        Value::U16(_) => tag::U16,
        Value::U32(_) => tag::U32,
        Value::U64(_) => tag::U64,
        Value::F32(_) => tag::F32,
        Value::F64(_) => tag::F64,
        Value::Str(_) => tag::STR,
        Value::Bytes(_) => tag::BYTES,
        Value::Container(_) => tag::CONTAINER,
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> BusResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                BusError::InvalidPayload(format!(
                    "truncated stream: need {n} bytes at offset {}",
                    self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> BusResult<u8> {
        Ok(self.take(1)?[0])
    }
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn read_varint(cursor: &mut Cursor<'_>) -> BusResult<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = cursor.byte()?;
        if shift >= 64 {
            return Err(BusError::InvalidPayload("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn decode_container(cursor: &mut Cursor<'_>, len: usize, depth: usize) -> BusResult<ValueContainer> {
    if depth >= MAX_DEPTH {
        return Err(BusError::InvalidPayload(format!(
            "container nesting exceeds max depth {MAX_DEPTH}"
        )));
    }

    let end = cursor.pos + len;
    let mut container = ValueContainer::new();

    while cursor.pos < end {
        let tag_byte = cursor.byte()?;
        let key_len = read_varint(cursor)? as usize;
        let key = std::str::from_utf8(cursor.take(key_len)?)
            .map_err(|e| BusError::InvalidPayload(format!("key is not UTF-8: {e}")))?
            .to_string();
        let val_len = usize::try_from(read_varint(cursor)?)
            .ok()
            .filter(|&n| cursor.pos.checked_add(n).is_some_and(|e| e <= end))
            .ok_or_else(|| {
                BusError::InvalidPayload(format!("entry '{key}' overruns container bounds"))
            })?;
        let value = decode_value(cursor, tag_byte, val_len, depth, &key)?;
        container.set(key, value);
    }

    if cursor.pos != end {
        return Err(BusError::InvalidPayload(
            "entry overruns container bounds".into(),
        ));
    }
    Ok(container)
}

fn decode_value(
    cursor: &mut Cursor<'_>,
    tag_byte: u8,
    len: usize,
    depth: usize,
    key: &str,
) -> BusResult<Value> {
    let fixed = |expected: usize| -> BusResult<()> {
        if len == expected {
            Ok(())
        } else {
            Err(BusError::InvalidPayload(format!(
                "entry '{key}': tag 0x{tag_byte:02X} expects {expected} bytes, got {len}"
            )))
        }
    };

    let value = match tag_byte {
        tag::NULL => {
            fixed(0)?;
            Value::Null
        }
        tag::BOOL => {
            fixed(1)?;
            Value::Bool(cursor.byte()? != 0)
        }
        tag::I8 => {
            fixed(1)?;
            Value::I8(i8::from_le_bytes(cursor.take(1)?.try_into().unwrap()))
        }
        tag::I16 => {
            fixed(2)?;
            Value::I16(i16::from_le_bytes(cursor.take(2)?.try_into().unwrap()))
        }
        tag::I32 => {
            fixed(4)?;
            Value::I32(i32::from_le_bytes(cursor.take(4)?.try_into().unwrap()))
        }
        tag::I64 => {
            fixed(8)?;
            Value::I64(i64::from_le_bytes(cursor.take(8)?.try_into().unwrap()))
        }
        tag::U8 => {
            fixed(1)?;
            Value::U8(cursor.byte()?)
        }
        tag::U16 => {
            fixed(2)?;
            Value::U16(u16::from_le_bytes(cursor.take(2)?.try_into().unwrap()))
        }
        tag::U32 => {
            fixed(4)?;
            Value::U32(u32::from_le_bytes(cursor.take(4)?.try_into().unwrap()))
        }
        tag::U64 => {
            fixed(8)?;
            Value::U64(u64::from_le_bytes(cursor.take(8)?.try_into().unwrap()))
        }
        tag::F32 => {
            fixed(4)?;
            Value::F32(f32::from_le_bytes(cursor.take(4)?.try_into().unwrap()))
        }
        tag::F64 => {
            fixed(8)?;
            Value::F64(f64::from_le_bytes(cursor.take(8)?.try_into().unwrap()))
        }
        tag::STR => {
            let text = std::str::from_utf8(cursor.take(len)?)
                .map_err(|e| BusError::InvalidPayload(format!("entry '{key}' not UTF-8: {e}")))?;
            Value::Str(text.to_string())
        }
        tag::BYTES => Value::Bytes(cursor.take(len)?.to_vec()),
        tag::CONTAINER => Value::Container(decode_container(cursor, len, depth + 1)?),
        other => {
            return Err(BusError::InvalidPayload(format!(
                "entry '{key}': unknown tag 0x{other:02X}"
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ValueContainer {
        ValueContainer::new()
            .with("null", Value::Null)
            .with("flag", true)
            .with("i8", Value::I8(-8))
            .with("i16", Value::I16(-1600))
            .with("i32", Value::I32(-320_000))
            .with("i64", -64_000_000_000i64)
            .with("u8", Value::U8(8))
            .with("u16", Value::U16(1600))
            .with("u32", Value::U32(320_000))
            .with("u64", Value::U64(u64::MAX))
            .with("f32", Value::F32(1.5))
            .with("f64", 2.25f64)
            .with("text", "héllo wörld")
            .with("blob", vec![0u8, 1, 2, 255])
    }

    #[test]
    fn test_round_trip_identity() {
        let original = sample();
        let bytes = encode(&original).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_nested() {
        let inner = ValueContainer::new().with("x", 1i64).with("y", "deep");
        let mid = ValueContainer::new().with("inner", inner);
        let outer = sample().with("nested", mid);

        let bytes = encode(&outer).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, outer);
        assert_eq!(
            decoded
                .get_container("nested")
                .unwrap()
                .get_container("inner")
                .unwrap()
                .get_str("y"),
            Some("deep")
        );
    }

    #[test]
    fn test_deterministic_output() {
        let a = sample();
        let b = sample();
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());

        // Same keys, different insertion order: different bytes
        let c = ValueContainer::new().with("a", 1i64).with("b", 2i64);
        let d = ValueContainer::new().with("b", 2i64).with("a", 1i64);
        assert_ne!(encode(&c).unwrap(), encode(&d).unwrap());
    }

    #[test]
    fn test_encoded_len_matches() {
        let container = sample();
        assert_eq!(encode(&container).unwrap().len(), encoded_len(&container));
        assert_eq!(container.byte_size(), encoded_len(&container));
    }

    #[test]
    fn test_empty_container() {
        let empty = ValueContainer::new();
        let bytes = encode(&empty).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(decode(&bytes).unwrap(), empty);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = encode(&ValueContainer::new().with("k", 1i64)).unwrap();
        bytes[0] = 0x7F;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, BusError::InvalidPayload(_)));
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let bytes = encode(&sample()).unwrap();
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            let err = decode(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, BusError::InvalidPayload(_)), "cut at {cut}");
        }
    }

    #[test]
    fn test_wrong_fixed_width_rejected() {
        // i32 entry claiming 2 bytes of payload
        let mut bytes = Vec::new();
        bytes.push(0x04); // I32 tag
        bytes.push(1); // key len
        bytes.push(b'k');
        bytes.push(2); // bogus value len
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            BusError::InvalidPayload(_)
        ));
    }

    #[test]
    fn test_depth_limit() {
        let mut container = ValueContainer::new().with("leaf", 1i64);
        for _ in 0..MAX_DEPTH {
            container = ValueContainer::new().with("c", container);
        }
        assert!(matches!(
            encode(&container).unwrap_err(),
            BusError::InvalidPayload(_)
        ));
    }

    #[test]
    fn test_depth_just_under_limit() {
        let mut container = ValueContainer::new().with("leaf", 1i64);
        for _ in 0..(MAX_DEPTH - 1) {
            container = ValueContainer::new().with("c", container);
        }
        let bytes = encode(&container).unwrap();
        assert_eq!(decode(&bytes).unwrap(), container);
    }

    #[test]
    fn test_json_secondary_form() {
        let original = sample();
        let text = encode_json(&original).unwrap();
        let decoded = decode_json(&text).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_varint_boundaries() {
        let mut out = Vec::new();
        for v in [0u64, 127, 128, 16_383, 16_384, u64::MAX] {
            out.clear();
            write_varint(&mut out, v);
            assert_eq!(out.len(), varint_len(v));
            let mut cursor = Cursor { buf: &out, pos: 0 };
            assert_eq!(read_varint(&mut cursor).unwrap(), v);
        }
    }

    #[test]
    fn test_skip_ability_of_nested_entries() {
        // A reader can skip the nested entry using only its value length.
        let inner = ValueContainer::new().with("deep", "value");
        let outer = ValueContainer::new()
            .with("nested", inner)
            .with("after", 42i64);
        let bytes = encode(&outer).unwrap();

        let mut cursor = Cursor { buf: &bytes, pos: 0 };
        let _tag = cursor.byte().unwrap();
        let key_len = read_varint(&mut cursor).unwrap() as usize;
        cursor.take(key_len).unwrap();
        let val_len = read_varint(&mut cursor).unwrap() as usize;
        cursor.take(val_len).unwrap(); // skip the whole nested container

        // Next entry is readable in place.
        let tag_byte = cursor.byte().unwrap();
        assert_eq!(tag_byte, 0x05); // I64
    }
}
