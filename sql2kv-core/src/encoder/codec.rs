//! Datum and row value encoding.
//!
//! A row value is a flat sequence of datums alternating column id and column
//! value. Each datum starts with a one byte flag. An empty row is a single nil
//! flag.

use super::EncodeError;

const NIL_FLAG: u8 = 0;
const COMPACT_BYTES_FLAG: u8 = 2;
const FLOAT_FLAG: u8 = 5;
const VARINT_FLAG: u8 = 8;

const SIGN_MASK: u64 = 1 << 63;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// SQL `NULL`.
    Null,
    /// Signed integer; booleans are stored as 0 or 1.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String or binary value.
    Bytes(Vec<u8>),
}

impl Datum {
    /// Append the datum with its flag.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Null => buf.push(NIL_FLAG),
            Self::Int(value) => {
                buf.push(VARINT_FLAG);
                put_varint(buf, *value);
            }
            Self::Float(value) => {
                buf.push(FLOAT_FLAG);
                buf.extend_from_slice(&float_to_comparable(*value).to_be_bytes());
            }
            Self::Bytes(bytes) => {
                buf.push(COMPACT_BYTES_FLAG);
                put_varint(buf, bytes.len() as i64);
                buf.extend_from_slice(bytes);
            }
        }
    }

    /// Decode one datum, returning it with the unread remainder.
    ///
    /// # Errors
    ///
    /// [`EncodeError::Malformed`] on unknown flags or truncated input.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), EncodeError> {
        let Some((&flag, rest)) = bytes.split_first() else {
            return Err(malformed("empty datum"));
        };
        match flag {
            NIL_FLAG => Ok((Self::Null, rest)),
            VARINT_FLAG => {
                let (value, rest) = get_varint(rest)?;
                Ok((Self::Int(value), rest))
            }
            FLOAT_FLAG => {
                let raw: [u8; 8] = rest
                    .get(..8)
                    .and_then(|slice| slice.try_into().ok())
                    .ok_or_else(|| malformed("truncated float"))?;
                let value = comparable_to_float(u64::from_be_bytes(raw));
                Ok((Self::Float(value), &rest[8..]))
            }
            COMPACT_BYTES_FLAG => {
                let (len, rest) = get_varint(rest)?;
                let len = usize::try_from(len).map_err(|_| malformed("negative length"))?;
                if rest.len() < len {
                    return Err(malformed("truncated bytes"));
                }
                let (bytes, rest) = rest.split_at(len);
                Ok((Self::Bytes(bytes.to_vec()), rest))
            }
            other => Err(EncodeError::Malformed(format!("unknown datum flag {other}"))),
        }
    }
}

/// Encode `(column id, value)` pairs as a row value.
#[must_use]
pub fn encode_row(columns: &[(i64, Datum)]) -> Vec<u8> {
    if columns.is_empty() {
        return vec![NIL_FLAG];
    }
    let mut buf = Vec::new();
    for (column_id, datum) in columns {
        Datum::Int(*column_id).encode(&mut buf);
        datum.encode(&mut buf);
    }
    buf
}

/// Decode a row value produced by [`encode_row`].
///
/// # Errors
///
/// [`EncodeError::Malformed`] on truncated input or a non-integer column id.
pub fn decode_row(mut bytes: &[u8]) -> Result<Vec<(i64, Datum)>, EncodeError> {
    if bytes == [NIL_FLAG] {
        return Ok(Vec::new());
    }
    let mut columns = Vec::new();
    while !bytes.is_empty() {
        let (id, rest) = Datum::decode(bytes)?;
        let Datum::Int(column_id) = id else {
            return Err(malformed("column id is not an integer"));
        };
        let (value, rest) = Datum::decode(rest)?;
        columns.push((column_id, value));
        bytes = rest;
    }
    Ok(columns)
}

fn malformed(what: &str) -> EncodeError {
    EncodeError::Malformed(what.to_string())
}

/// Zigzag LEB128.
fn put_varint(buf: &mut Vec<u8>, value: i64) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    while zigzag >= 0x80 {
        buf.push((zigzag as u8) | 0x80);
        zigzag >>= 7;
    }
    buf.push(zigzag as u8);
}

fn get_varint(bytes: &[u8]) -> Result<(i64, &[u8]), EncodeError> {
    let mut zigzag = 0u64;
    for (index, &byte) in bytes.iter().enumerate().take(10) {
        zigzag |= u64::from(byte & 0x7f) << (7 * index);
        if byte < 0x80 {
            let value = ((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64);
            return Ok((value, &bytes[index + 1..]));
        }
    }
    Err(malformed("truncated varint"))
}

fn float_to_comparable(value: f64) -> u64 {
    let bits = value.to_bits();
    if value >= 0.0 { bits | SIGN_MASK } else { !bits }
}

fn comparable_to_float(raw: u64) -> f64 {
    let bits = if raw & SIGN_MASK > 0 { raw & !SIGN_MASK } else { !raw };
    f64::from_bits(bits)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_int_datum_uses_zigzag_varint() {
        let mut buf = Vec::new();
        Datum::Int(-1).encode(&mut buf);
        assert_eq!(buf, [VARINT_FLAG, 0x01]);

        buf.clear();
        Datum::Int(300).encode(&mut buf);
        assert_eq!(buf, [VARINT_FLAG, 0xd8, 0x04]);
    }

    #[test]
    fn test_bytes_datum_is_length_prefixed() {
        let mut buf = Vec::new();
        Datum::Bytes(b"abc".to_vec()).encode(&mut buf);
        assert_eq!(buf, [COMPACT_BYTES_FLAG, 0x06, b'a', b'b', b'c']);
    }

    #[test]
    fn test_float_bytes_sort_numerically() {
        let encoded: Vec<u64> = [-2.5, -0.5, 0.0, 0.25, 8.0]
            .iter()
            .map(|&f| float_to_comparable(f))
            .collect();
        assert!(encoded.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(comparable_to_float(float_to_comparable(-2.5)), -2.5);
    }

    #[test]
    fn test_row_value() {
        let row = vec![
            (2, Datum::Bytes(b"alice".to_vec())),
            (3, Datum::Null),
            (4, Datum::Float(1.5)),
            (5, Datum::Int(i64::MIN)),
        ];
        let encoded = encode_row(&row);
        assert_eq!(decode_row(&encoded).unwrap(), row);
    }

    #[test]
    fn test_empty_row_is_single_nil() {
        assert_eq!(encode_row(&[]), vec![NIL_FLAG]);
        assert!(decode_row(&[NIL_FLAG]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        assert!(Datum::decode(&[]).is_err());
        assert!(Datum::decode(&[FLOAT_FLAG, 1, 2]).is_err());
        assert!(Datum::decode(&[COMPACT_BYTES_FLAG, 0x0a, b'a']).is_err());
        assert!(Datum::decode(&[VARINT_FLAG, 0x80]).is_err());
        assert!(Datum::decode(&[42]).is_err());
    }
}
