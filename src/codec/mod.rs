//! MQTT Packet Codec
//!
//! Binary framing for the broker: control byte, variable-length remaining
//! length field, then the variable header and payload region.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum number of bytes in a remaining length field
pub const MAX_VARIABLE_INT_LEN: usize = 4;

/// Read a Variable Byte Integer from buffer
/// Returns (value, bytes_consumed) or error
///
/// Fails with `InvalidRemainingLength` as soon as a fifth byte would be
/// required, whether or not it has arrived yet.
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= MAX_VARIABLE_INT_LEN {
            return Err(DecodeError::InvalidRemainingLength);
        }
        if pos >= buf.len() {
            return Err(DecodeError::InsufficientData);
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a Variable Byte Integer to buffer
/// Returns bytes written
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Calculate the number of bytes needed to encode a Variable Byte Integer
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

/// Read a Two Byte Integer (u16 big-endian)
#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Read a length-prefixed UTF-8 string
/// Returns (string, bytes_consumed) or error
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let total_len = 2 + len;

    if buf.len() < total_len {
        return Err(DecodeError::InsufficientData);
    }

    let s = std::str::from_utf8(&buf[2..total_len]).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok((s, total_len))
}
