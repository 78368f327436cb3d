//! Compact-size integers.
//!
//! One byte below 0xfd; otherwise a 0xfd/0xfe/0xff marker followed by a
//! little-endian u16/u32/u64. Decoding rejects non-canonical encodings
//! (a value that would have fit in a shorter form).

use super::ByteReader;
use crate::error::{ChainError, Result};

/// Append the compact-size encoding of `value` to `out`.
pub fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Number of bytes `write_compact_size` would emit.
pub fn compact_size_length(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Decode a compact-size integer from the cursor.
pub fn read_compact_size(reader: &mut ByteReader) -> Result<u64> {
    let marker = reader.read_u8()?;
    let value = match marker {
        0xfd => {
            let value = reader.read_u16()? as u64;
            if value < 0xfd {
                return Err(non_canonical());
            }
            value
        }
        0xfe => {
            let value = reader.read_u32()? as u64;
            if value <= 0xffff {
                return Err(non_canonical());
            }
            value
        }
        0xff => {
            let value = reader.read_u64()?;
            if value <= 0xffff_ffff {
                return Err(non_canonical());
            }
            value
        }
        byte => byte as u64,
    };
    Ok(value)
}

fn non_canonical() -> ChainError {
    ChainError::Serialization("non-canonical compact size".into())
}
