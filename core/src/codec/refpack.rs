//! Bit-packed chunk-reference blocks.
//!
//! A file's chunk sequence is a run of `(delta_index, offset, length)`
//! triples. Each block picks the minimal bit width per field from the
//! maxima across the run, then packs every triple at those widths. A zero
//! width is legal only when the field is zero for every entry, which is
//! the common case for `offset` (chunks consumed whole from position 0).

use crate::bitio::{BitReader, BitWriter};
use crate::error::{Error, Result};
use crate::varint;
use std::io::{Read, Write};

/// One element of a file's chunk sequence.
///
/// `delta_index` is the non-negative distance from the running cursor over
/// the release's chunk table; the absolute chunk index of entry `i` is the
/// prefix sum of deltas through `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaChunkRef {
    pub delta_index: u32,
    pub offset: u64,
    pub length: u64,
}

/// Bits needed to represent `max`; 0 when `max` is 0.
pub fn bit_width(max: u64) -> u8 {
    if max == 0 {
        0
    } else {
        (64 - max.leading_zeros()) as u8
    }
}

/// Write one bit-packed block: `varint(count)`, three width bytes,
/// `varint(packed_byte_len)`, packed payload.
pub fn write_refs<W: Write>(out: &mut W, refs: &[DeltaChunkRef]) -> Result<()> {
    varint::write_usize(out, refs.len())?;
    if refs.is_empty() {
        out.write_all(&[0, 0, 0])?;
        varint::write_usize(out, 0)?;
        return Ok(());
    }

    let bits_delta = bit_width(refs.iter().map(|r| u64::from(r.delta_index)).max().unwrap_or(0));
    let bits_offset = bit_width(refs.iter().map(|r| r.offset).max().unwrap_or(0));
    let bits_length = bit_width(refs.iter().map(|r| r.length).max().unwrap_or(0));

    let mut packer = BitWriter::new();
    for r in refs {
        packer.write_bits(u64::from(r.delta_index), u32::from(bits_delta))?;
        packer.write_bits(r.offset, u32::from(bits_offset))?;
        packer.write_bits(r.length, u32::from(bits_length))?;
    }
    let packed = packer.finish();

    out.write_all(&[bits_delta, bits_offset, bits_length])?;
    varint::write_usize(out, packed.len())?;
    out.write_all(&packed)?;
    Ok(())
}

/// Read one bit-packed block written by [`write_refs`].
pub fn read_refs<R: Read>(input: &mut R) -> Result<Vec<DeltaChunkRef>> {
    let count = varint::read_usize(input)?;
    let mut header = [0u8; 3];
    input
        .read_exact(&mut header)
        .map_err(|_| Error::UnexpectedEof("chunk-ref block truncated in header".into()))?;
    let [bits_delta, bits_offset, bits_length] = header;
    let packed_len = varint::read_usize(input)?;

    if count == 0 {
        if bits_delta != 0 || bits_offset != 0 || bits_length != 0 || packed_len != 0 {
            return Err(Error::Format(
                "empty chunk-ref block carries non-zero widths or payload".into(),
            ));
        }
        return Ok(Vec::new());
    }
    if bits_delta > 32 || bits_offset > 64 || bits_length > 64 {
        return Err(Error::Format(format!(
            "chunk-ref bit widths {bits_delta}/{bits_offset}/{bits_length} out of range"
        )));
    }

    let total_bits = usize::from(bits_delta) + usize::from(bits_offset) + usize::from(bits_length);
    let required = (count * total_bits).div_ceil(8);
    if packed_len < required {
        return Err(Error::Format(format!(
            "chunk-ref block declares {packed_len} packed bytes, needs {required}"
        )));
    }

    let mut packed = vec![0u8; packed_len];
    input
        .read_exact(&mut packed)
        .map_err(|_| Error::UnexpectedEof("chunk-ref block truncated in payload".into()))?;

    let mut reader = BitReader::new(&packed);
    let mut refs = Vec::with_capacity(count);
    for _ in 0..count {
        let delta_index = reader.read_bits(u32::from(bits_delta))? as u32;
        let offset = reader.read_bits(u32::from(bits_offset))?;
        let length = reader.read_bits(u32::from(bits_length))?;
        refs.push(DeltaChunkRef {
            delta_index,
            offset,
            length,
        });
    }
    Ok(refs)
}
