//! Record key layout.
//!
//! ```text
//! t{table_id}_r{handle}
//! ```
//!
//! Both integers use the memcomparable form: sign bit flipped, big endian, so
//! byte order matches numeric order.

use super::EncodeError;

const TABLE_PREFIX: u8 = b't';
const RECORD_SEPARATOR: &[u8] = b"_r";
const SIGN_MASK: u64 = 1 << 63;
const INT_LEN: usize = 8;

/// Length of `t{table_id}`.
pub const TABLE_PREFIX_LEN: usize = 1 + INT_LEN;
/// Length of a complete record key.
pub const RECORD_KEY_LEN: usize = TABLE_PREFIX_LEN + RECORD_SEPARATOR.len() + INT_LEN;

/// Append `value` in memcomparable form.
pub fn encode_int(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&((value as u64) ^ SIGN_MASK).to_be_bytes());
}

/// Decode a memcomparable integer from the first 8 bytes of `bytes`.
///
/// # Errors
///
/// [`EncodeError::Malformed`] when fewer than 8 bytes are available.
pub fn decode_int(bytes: &[u8]) -> Result<i64, EncodeError> {
    let raw: [u8; INT_LEN] = bytes
        .get(..INT_LEN)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| EncodeError::Malformed(format!("need {INT_LEN} bytes, got {}", bytes.len())))?;
    Ok((u64::from_be_bytes(raw) ^ SIGN_MASK) as i64)
}

/// `t{table_id}`.
#[must_use]
pub fn encode_table_prefix(table_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(TABLE_PREFIX_LEN);
    key.push(TABLE_PREFIX);
    encode_int(&mut key, table_id);
    key
}

/// `t{table_id}_r`.
#[must_use]
pub fn encode_record_prefix(table_id: i64) -> Vec<u8> {
    let mut key = encode_table_prefix(table_id);
    key.extend_from_slice(RECORD_SEPARATOR);
    key
}

/// `t{table_id}_r{handle}`.
#[must_use]
pub fn encode_record_key(table_id: i64, handle: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(RECORD_KEY_LEN);
    key.push(TABLE_PREFIX);
    encode_int(&mut key, table_id);
    key.extend_from_slice(RECORD_SEPARATOR);
    encode_int(&mut key, handle);
    key
}

/// Table id of any key under a table prefix.
///
/// # Errors
///
/// [`EncodeError::Malformed`] when `key` is not a table key.
pub fn decode_table_id(key: &[u8]) -> Result<i64, EncodeError> {
    match key.split_first() {
        Some((&TABLE_PREFIX, rest)) => decode_int(rest),
        _ => Err(EncodeError::Malformed("key lacks table prefix".to_string())),
    }
}

/// Split a record key into `(table_id, handle)`.
///
/// # Errors
///
/// [`EncodeError::Malformed`] when `key` is not a record key.
pub fn decode_record_key(key: &[u8]) -> Result<(i64, i64), EncodeError> {
    if key.len() != RECORD_KEY_LEN {
        return Err(EncodeError::Malformed(format!(
            "record key has {} bytes, expected {RECORD_KEY_LEN}",
            key.len()
        )));
    }
    let table_id = decode_table_id(key)?;
    let rest = &key[TABLE_PREFIX_LEN..];
    let Some(handle) = rest.strip_prefix(RECORD_SEPARATOR) else {
        return Err(EncodeError::Malformed("key lacks record separator".to_string()));
    };
    Ok((table_id, decode_int(handle)?))
}

/// Smallest key greater than every key starting with `key`.
#[must_use]
pub fn prefix_next(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    for byte in next.iter_mut().rev() {
        if *byte == u8::MAX {
            *byte = 0;
        } else {
            *byte += 1;
            return next;
        }
    }
    // Every byte overflowed.
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// Half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub start: Vec<u8>,
    /// Exclusive upper bound.
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Every key of `table_id`, records and indexes alike.
    #[must_use]
    pub fn table(table_id: i64) -> Self {
        let start = encode_table_prefix(table_id);
        let end = prefix_next(&start);
        Self { start, end }
    }

    /// Whether `key` falls inside the range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_layout() {
        let key = encode_record_key(1, 2);
        assert_eq!(
            key,
            [
                b't', 0x80, 0, 0, 0, 0, 0, 0, 1, b'_', b'r', 0x80, 0, 0, 0, 0, 0, 0, 2
            ]
        );
        assert_eq!(decode_record_key(&key).unwrap(), (1, 2));
        assert!(key.starts_with(&encode_record_prefix(1)));
    }

    #[test]
    fn test_integer_order_is_preserved() {
        let values = [i64::MIN, -1000, -1, 0, 1, 42, i64::MAX];
        let keys: Vec<_> = values.iter().map(|&h| encode_record_key(5, h)).collect();
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        for (value, key) in values.iter().zip(&keys) {
            assert_eq!(decode_record_key(key).unwrap(), (5, *value));
        }
    }

    #[test]
    fn test_decode_rejects_foreign_keys() {
        assert!(decode_record_key(b"short").is_err());
        assert!(decode_table_id(b"x123456789").is_err());

        let mut index_key = encode_table_prefix(3);
        index_key.extend_from_slice(b"_i");
        encode_int(&mut index_key, 1);
        assert!(decode_record_key(&index_key).is_err());
        assert_eq!(decode_table_id(&index_key).unwrap(), 3);
    }

    #[test]
    fn test_prefix_next() {
        assert_eq!(prefix_next(b"ab"), b"ac");
        assert_eq!(prefix_next(&[1, 0xff]), vec![2, 0]);
        assert_eq!(prefix_next(&[0xff, 0xff]), vec![0xff, 0xff, 0]);
    }

    #[test]
    fn test_table_range_covers_records() {
        let range = KeyRange::table(7);
        assert!(range.contains(&encode_record_key(7, i64::MIN)));
        assert!(range.contains(&encode_record_key(7, i64::MAX)));
        assert!(!range.contains(&encode_record_key(8, 0)));
        assert!(!range.contains(&encode_record_key(6, i64::MAX)));
        assert_eq!(range.end, encode_table_prefix(8));
    }
}
