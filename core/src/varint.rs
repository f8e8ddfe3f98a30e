//! Unsigned LEB128 varints with ZigZag encoding for signed values.
//!
//! Seven data bits per byte, little-endian groups, continuation bit in the
//! high bit. A 64-bit value never occupies more than 10 bytes; an eleventh
//! continuation byte is a format error, not an overflow panic.

use crate::error::{Error, Result};
use std::io::{Read, Write};

/// Longest legal encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

pub fn write_u64<W: Write>(out: &mut W, mut value: u64) -> Result<usize> {
    let mut written = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.write_all(&[byte])?;
            return Ok(written + 1);
        }
        out.write_all(&[byte | 0x80])?;
        written += 1;
    }
}

pub fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        if input.read(&mut byte)? == 0 {
            return Err(Error::UnexpectedEof(format!(
                "varint truncated after {i} bytes"
            )));
        }
        let b = byte[0];
        // The tenth byte of a u64 may only carry the single remaining bit.
        if i == MAX_VARINT_LEN - 1 && b > 0x01 {
            return Err(Error::Format("varint exceeds 64 bits".into()));
        }
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(Error::Format("varint longer than 10 bytes".into()))
}

pub fn write_usize<W: Write>(out: &mut W, value: usize) -> Result<usize> {
    write_u64(out, value as u64)
}

pub fn read_usize<R: Read>(input: &mut R) -> Result<usize> {
    let v = read_u64(input)?;
    usize::try_from(v).map_err(|_| Error::Format(format!("varint {v} overflows usize")))
}

pub fn write_u32<W: Write>(out: &mut W, value: u32) -> Result<usize> {
    write_u64(out, u64::from(value))
}

pub fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let v = read_u64(input)?;
    u32::try_from(v).map_err(|_| Error::Format(format!("varint {v} overflows u32")))
}

/// ZigZag: maps signed values to unsigned so small magnitudes stay short.
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn write_i64<W: Write>(out: &mut W, value: i64) -> Result<usize> {
    write_u64(out, zigzag_encode(value))
}

pub fn read_i64<R: Read>(input: &mut R) -> Result<i64> {
    Ok(zigzag_decode(read_u64(input)?))
}

pub fn write_i32<W: Write>(out: &mut W, value: i32) -> Result<usize> {
    write_i64(out, i64::from(value))
}

pub fn read_i32<R: Read>(input: &mut R) -> Result<i32> {
    let v = read_i64(input)?;
    i32::try_from(v).map_err(|_| Error::Format(format!("varint {v} overflows i32")))
}

/// Encode to a fresh buffer; handy for length-prefix framing.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN);
    write_u64(&mut buf, value).expect("Vec write cannot fail");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip_u64(value: u64) {
        let buf = encode_u64(value);
        assert_eq!(read_u64(&mut Cursor::new(&buf)).unwrap(), value);
    }

    #[test]
    fn zero_is_one_byte() {
        assert_eq!(encode_u64(0), vec![0x00]);
    }

    #[test]
    fn unsigned_round_trips() {
        for v in [0, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64, u64::MAX] {
            round_trip_u64(v);
        }
    }

    #[test]
    fn signed_round_trips() {
        for v in [0i64, -1, 1, -64, 63, i32::MIN as i64, i32::MAX as i64, i64::MIN, i64::MAX] {
            let mut buf = Vec::new();
            write_i64(&mut buf, v).unwrap();
            assert_eq!(read_i64(&mut Cursor::new(&buf)).unwrap(), v);
        }
    }

    #[test]
    fn minus_one_is_single_0x01() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -1).unwrap();
        assert_eq!(buf, vec![0x01]);
        assert_eq!(read_i32(&mut Cursor::new(&buf)).unwrap(), -1);
    }

    #[test]
    fn truncated_input_is_eof() {
        // Continuation bit set but stream ends.
        let buf = vec![0x80, 0x80];
        match read_u64(&mut Cursor::new(&buf)) {
            Err(Error::UnexpectedEof(_)) => {}
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn overlong_encoding_is_format_error() {
        let buf = vec![0xff; 11];
        match read_u64(&mut Cursor::new(&buf)) {
            Err(Error::Format(_)) => {}
            other => panic!("expected Format, got {other:?}"),
        }
    }

    #[test]
    fn max_u64_uses_ten_bytes() {
        let buf = encode_u64(u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(read_u64(&mut Cursor::new(&buf)).unwrap(), u64::MAX);
    }
}
