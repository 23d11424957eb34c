// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::error::{Fail, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

//==============================================================================
// Associate Functions
//==============================================================================

/// Encodes a name list as `u32 count` followed by `count` ×
/// (`u32 len`, `len` bytes UTF-8) (spec §6).
pub fn encode_name_list(names: &[String]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(names.len() as u32)?;
    for name in names {
        if !name.is_ascii() {
            return Err(Fail::Corrupt {
                detail: format!("name {:?} is not ASCII", name),
            });
        }
        let bytes = name.as_bytes();
        buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
        buf.extend_from_slice(bytes);
    }
    Ok(buf)
}

/// Decodes a name list written by [encode_name_list].
pub fn decode_name_list(payload: &[u8]) -> Result<Vec<String>> {
    let mut cursor = Cursor::new(payload);
    let count = cursor.read_u32::<LittleEndian>()?;
    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        let start = cursor.position() as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= payload.len())
            .ok_or_else(|| Fail::Corrupt {
                detail: "name length field overruns payload".into(),
            })?;
        let name = std::str::from_utf8(&payload[start..end])
            .map_err(|_| Fail::Corrupt {
                detail: "name is not valid UTF-8".into(),
            })?
            .to_owned();
        if !name.is_ascii() {
            return Err(Fail::Corrupt {
                detail: "name is not ASCII".into(),
            });
        }
        cursor.set_position(end as u64);
        names.push(name);
    }
    Ok(names)
}

/// Encodes a sequence of `f64` tightly packed little-endian, in order.
pub fn encode_vector(values: &[f64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 8);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Decodes a packed little-endian `f64` vector of the given length, starting
/// at byte `offset` in `payload`. Returns the values and the offset just
/// past them, so callers can chain multiple vectors out of one payload (as
/// `RUN_FINISHED` does: parameters, then observations, then a duration).
pub fn decode_vector(payload: &[u8], offset: usize, count: usize) -> Result<(Vec<f64>, usize)> {
    let end = offset
        .checked_add(count * 8)
        .filter(|&end| end <= payload.len())
        .ok_or_else(|| Fail::Corrupt {
            detail: "packed f64 vector overruns payload".into(),
        })?;
    let mut values = Vec::with_capacity(count);
    for chunk in payload[offset..end].chunks_exact(8) {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(chunk);
        values.push(f64::from_le_bytes(arr));
    }
    Ok((values, end))
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_list_round_trip() {
        let names: Vec<String> = vec!["k1".into(), "recharge".into(), "hk".into()];
        let encoded = encode_name_list(&names).unwrap();
        let decoded = decode_name_list(&encoded).unwrap();
        assert_eq!(names, decoded);
    }

    #[test]
    fn empty_name_list_round_trips() {
        let encoded = encode_name_list(&[]).unwrap();
        assert_eq!(decode_name_list(&encoded).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn vector_round_trip_bitwise() {
        let values = vec![1.5_f64, -2.25, 0.0, f64::NAN];
        let encoded = encode_vector(&values);
        let (decoded, end) = decode_vector(&encoded, 0, values.len()).unwrap();
        assert_eq!(end, encoded.len());
        assert_eq!(values[..3], decoded[..3]);
        assert!(decoded[3].is_nan());
    }

    #[test]
    fn truncated_vector_is_rejected() {
        let encoded = encode_vector(&[1.0, 2.0]);
        assert!(decode_vector(&encoded, 0, 3).is_err());
    }
}
