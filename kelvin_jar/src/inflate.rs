//! RFC 1951 DEFLATE decompression.
//!
//! The decoder is sized for small devices: Huffman code tables use a
//! two-level scheme with a primary direct-lookup table covering codes up
//! to `quick_bits` wide and secondary tables for longer codes, so the
//! common case is a single indexed load.
//!
//! Input is pulled through a [`ByteSource`] callback so the same decoder
//! serves in-memory archives and streamed ones. The bit-buffer protocol
//! may read up to [`INFLATER_EXTRA_BYTES`] past the final byte of the
//! compressed data; callers must ensure that much padding is readable.
//! The decoder never *uses* bits from the padding, and rejects streams
//! that try to consume beyond it.

use crate::error::Error::{InvalidData, UnexpectedEof};
use crate::error::Result;

/// The decoder may read up to this many bytes past the compressed data.
pub const INFLATER_EXTRA_BYTES: usize = 4;

/// Supplies compressed bytes to the inflater.
pub trait ByteSource {
    /// Produce the next byte. Called at most `compressed_len +
    /// INFLATER_EXTRA_BYTES` times; bytes past the logical end may be
    /// arbitrary padding.
    fn next_byte(&mut self) -> u8;
}

/// A [`ByteSource`] over an in-memory slice, producing zero padding past
/// the end of the slice.
#[derive(Debug)]
pub struct SliceSource<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> SliceSource<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        SliceSource { data, position: 0 }
    }
}

impl ByteSource for SliceSource<'_> {
    fn next_byte(&mut self) -> u8 {
        let byte = self.data.get(self.position).copied().unwrap_or(0);
        self.position += 1;
        byte
    }
}

// Length codes 257-285: base length and extra bits.
const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115,
    131, 163, 195, 227, 258,
];
const LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];

// Distance codes 0-29: base distance and extra bits.
const DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12,
    13, 13,
];

// Order in which code-length-code lengths are transmitted.
const CLEN_ORDER: [usize; 19] = [16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15];

const MAX_BITS: usize = 15;
const MAX_QUICK_LIT: u32 = 9;
const MAX_QUICK_DIST: u32 = 6;
const MAX_QUICK_CLEN: u32 = 7;

const LONG_FLAG: u16 = 0x8000;

/// A two-level Huffman decode table.
///
/// Primary entries pack `(symbol << 4) | code_length` in 16 bits; an
/// entry with the high bit set redirects to the secondary table whose
/// index is in the low bits. Entry 0 marks an unused code.
struct HuffmanTable {
    quick_bits: u32,
    primary: Vec<u16>,
    secondary: Vec<SecondaryTable>,
}

struct SecondaryTable {
    bits: u32,
    entries: Vec<u16>,
}

impl HuffmanTable {
    /// Build a canonical-code table from per-symbol code lengths
    /// (length 0 = symbol unused).
    fn build(lengths: &[u8], max_quick_bits: u32) -> Result<Self> {
        let max_length = usize::from(lengths.iter().copied().max().unwrap_or(0));
        if max_length == 0 || max_length > MAX_BITS {
            return Err(InvalidData("empty or oversized Huffman code".to_string()));
        }

        // Canonical code assignment (RFC 1951 3.2.2).
        let mut count = [0usize; MAX_BITS + 1];
        for &length in lengths {
            count[usize::from(length)] += 1;
        }
        count[0] = 0;
        let mut code = 0usize;
        let mut next_code = [0usize; MAX_BITS + 1];
        for bits in 1..=MAX_BITS {
            code = (code + count[bits - 1]) << 1;
            next_code[bits] = code;
        }

        let quick_bits = max_quick_bits.min(max_length as u32);
        let mut table = HuffmanTable {
            quick_bits,
            primary: vec![0; 1 << quick_bits],
            secondary: Vec::new(),
        };

        for (symbol, &length) in lengths.iter().enumerate() {
            if length == 0 {
                continue;
            }
            let length = usize::from(length);
            let assigned = next_code[length];
            next_code[length] += 1;
            let reversed = reverse_bits(assigned, length);
            let entry = pack_entry(symbol, length)?;

            if length as u32 <= quick_bits {
                // Fill every primary slot whose low bits match the code.
                let step = 1usize << length;
                let mut index = reversed;
                while index < table.primary.len() {
                    if table.primary[index] != 0 {
                        return Err(InvalidData("overlapping Huffman codes".to_string()));
                    }
                    table.primary[index] = entry;
                    index += step;
                }
            } else {
                let prefix = reversed & ((1 << quick_bits) - 1);
                let high = reversed >> quick_bits;
                let extra = length as u32 - quick_bits;
                let secondary_index = match table.primary[prefix] {
                    0 => {
                        let index = table.secondary.len();
                        if index >= usize::from(LONG_FLAG) {
                            return Err(InvalidData("too many secondary tables".to_string()));
                        }
                        table.secondary.push(SecondaryTable {
                            bits: extra,
                            entries: vec![0; 1 << extra],
                        });
                        table.primary[prefix] = LONG_FLAG | u16::try_from(index).map_err(|_| {
                            InvalidData("too many secondary tables".to_string())
                        })?;
                        index
                    }
                    slot if slot & LONG_FLAG != 0 => usize::from(slot & !LONG_FLAG),
                    _ => return Err(InvalidData("overlapping Huffman codes".to_string())),
                };

                let sub = &mut table.secondary[secondary_index];
                if extra > sub.bits {
                    // Widen the subtable, replicating existing entries.
                    let old_bits = sub.bits;
                    let mut widened = vec![0u16; 1 << extra];
                    for (index, slot) in widened.iter_mut().enumerate() {
                        *slot = sub.entries[index & ((1 << old_bits) - 1)];
                    }
                    sub.bits = extra;
                    sub.entries = widened;
                }
                let step = 1usize << extra;
                let mut index = high;
                while index < sub.entries.len() {
                    if sub.entries[index] != 0 {
                        return Err(InvalidData("overlapping Huffman codes".to_string()));
                    }
                    sub.entries[index] = entry;
                    index += step;
                }
            }
        }

        Ok(table)
    }

    /// The fixed literal/length table (RFC 1951 3.2.6).
    fn fixed_literal() -> Result<Self> {
        let mut lengths = [0u8; 288];
        for (symbol, length) in lengths.iter_mut().enumerate() {
            *length = match symbol {
                0..=143 => 8,
                144..=255 => 9,
                256..=279 => 7,
                _ => 8,
            };
        }
        Self::build(&lengths, MAX_QUICK_LIT)
    }

    /// The fixed distance table: thirty 5-bit codes.
    fn fixed_distance() -> Result<Self> {
        Self::build(&[5u8; 30], MAX_QUICK_DIST)
    }
}

fn pack_entry(symbol: usize, length: usize) -> Result<u16> {
    let entry = (symbol << 4) | length;
    u16::try_from(entry)
        .ok()
        .filter(|&entry| entry & LONG_FLAG == 0)
        .ok_or_else(|| InvalidData("Huffman symbol out of range".to_string()))
}

fn reverse_bits(value: usize, bits: usize) -> usize {
    let mut reversed = 0;
    for bit in 0..bits {
        reversed |= ((value >> bit) & 1) << (bits - 1 - bit);
    }
    reversed
}

/// Bit-buffer state over a [`ByteSource`].
struct BitReader<'a> {
    source: &'a mut dyn ByteSource,
    bit_buffer: u32,
    bit_count: u32,
    /// Bytes still permitted to be pulled from the source, including the
    /// trailing padding allowance.
    in_remaining: usize,
}

impl<'a> BitReader<'a> {
    fn new(source: &'a mut dyn ByteSource, compressed_len: usize) -> Self {
        BitReader {
            source,
            bit_buffer: 0,
            bit_count: 0,
            in_remaining: compressed_len + INFLATER_EXTRA_BYTES,
        }
    }

    /// Ensure at least `bits` bits are buffered.
    fn need(&mut self, bits: u32) -> Result<()> {
        while self.bit_count < bits {
            if self.in_remaining == 0 {
                return Err(UnexpectedEof);
            }
            self.in_remaining -= 1;
            self.bit_buffer |= u32::from(self.source.next_byte()) << self.bit_count;
            self.bit_count += 8;
        }
        Ok(())
    }

    fn peek(&self, bits: u32) -> u32 {
        self.bit_buffer & ((1u32 << bits) - 1)
    }

    fn drop_bits(&mut self, bits: u32) {
        self.bit_buffer >>= bits;
        self.bit_count -= bits;
    }

    fn take(&mut self, bits: u32) -> Result<u32> {
        if bits == 0 {
            return Ok(0);
        }
        self.need(bits)?;
        let value = self.peek(bits);
        self.drop_bits(bits);
        Ok(value)
    }

    /// Discard buffered bits up to the next byte boundary.
    fn align_to_byte(&mut self) {
        let partial = self.bit_count & 7;
        self.drop_bits(partial);
    }

    /// Decode one symbol through a two-level table.
    fn decode(&mut self, table: &HuffmanTable) -> Result<usize> {
        self.need(table.quick_bits)?;
        let entry = table.primary[self.peek(table.quick_bits) as usize];
        let entry = if entry & LONG_FLAG == 0 {
            entry
        } else {
            let sub = &table.secondary[usize::from(entry & !LONG_FLAG)];
            self.need(table.quick_bits + sub.bits)?;
            let high = (self.bit_buffer >> table.quick_bits) & ((1 << sub.bits) - 1);
            sub.entries[high as usize]
        };
        if entry == 0 {
            return Err(InvalidData("invalid Huffman code".to_string()));
        }
        self.drop_bits(u32::from(entry) & 0xF);
        Ok(usize::from(entry >> 4))
    }
}

/// Inflate `compressed_len` bytes from `source` into a buffer of
/// exactly `expected_len` bytes.
///
/// # Errors
/// Returns an error on malformed data, premature end of input, or an
/// output length that does not match `expected_len`.
pub fn inflate(
    source: &mut dyn ByteSource,
    compressed_len: usize,
    expected_len: usize,
) -> Result<Vec<u8>> {
    let mut reader = BitReader::new(source, compressed_len);
    let mut output = Vec::with_capacity(expected_len);

    loop {
        let last_block = reader.take(1)? == 1;
        let block_type = reader.take(2)?;
        match block_type {
            0 => inflate_stored(&mut reader, &mut output)?,
            1 => {
                let literals = HuffmanTable::fixed_literal()?;
                let distances = HuffmanTable::fixed_distance()?;
                inflate_huffman(&mut reader, &literals, &distances, &mut output, expected_len)?;
            }
            2 => {
                let (literals, distances) = decode_dynamic_tables(&mut reader)?;
                inflate_huffman(&mut reader, &literals, &distances, &mut output, expected_len)?;
            }
            _ => return Err(InvalidData("reserved block type".to_string())),
        }
        if last_block {
            break;
        }
    }

    if output.len() != expected_len {
        return Err(InvalidData(format!(
            "inflated {} bytes, expected {expected_len}",
            output.len()
        )));
    }
    Ok(output)
}

fn inflate_stored(reader: &mut BitReader<'_>, output: &mut Vec<u8>) -> Result<()> {
    reader.align_to_byte();
    let length = reader.take(16)?;
    let complement = reader.take(16)?;
    if length != !complement & 0xFFFF {
        return Err(InvalidData("stored block length check failed".to_string()));
    }
    for _ in 0..length {
        output.push(u8::try_from(reader.take(8)?).unwrap_or(0));
    }
    Ok(())
}

fn inflate_huffman(
    reader: &mut BitReader<'_>,
    literals: &HuffmanTable,
    distances: &HuffmanTable,
    output: &mut Vec<u8>,
    expected_len: usize,
) -> Result<()> {
    loop {
        let symbol = reader.decode(literals)?;
        match symbol {
            0..=255 => {
                if output.len() >= expected_len {
                    return Err(InvalidData("output overrun".to_string()));
                }
                output.push(symbol as u8);
            }
            256 => return Ok(()),
            257..=285 => {
                let index = symbol - 257;
                let length = usize::from(LENGTH_BASE[index])
                    + reader.take(u32::from(LENGTH_EXTRA[index]))? as usize;

                let dist_symbol = reader.decode(distances)?;
                if dist_symbol >= DIST_BASE.len() {
                    return Err(InvalidData("invalid distance code".to_string()));
                }
                let distance = usize::from(DIST_BASE[dist_symbol])
                    + reader.take(u32::from(DIST_EXTRA[dist_symbol]))? as usize;

                if distance > output.len() {
                    return Err(InvalidData("distance beyond output start".to_string()));
                }
                if output.len() + length > expected_len {
                    return Err(InvalidData("output overrun".to_string()));
                }
                // Byte-at-a-time copy: ranges may overlap by design.
                let start = output.len() - distance;
                for offset in 0..length {
                    let byte = output[start + offset];
                    output.push(byte);
                }
            }
            _ => return Err(InvalidData("invalid literal/length code".to_string())),
        }
    }
}

fn decode_dynamic_tables(reader: &mut BitReader<'_>) -> Result<(HuffmanTable, HuffmanTable)> {
    let literal_count = reader.take(5)? as usize + 257;
    let distance_count = reader.take(5)? as usize + 1;
    let clen_count = reader.take(4)? as usize + 4;
    if literal_count > 286 || distance_count > 30 {
        return Err(InvalidData("dynamic table counts out of range".to_string()));
    }

    let mut clen_lengths = [0u8; 19];
    for &position in CLEN_ORDER.iter().take(clen_count) {
        clen_lengths[position] = u8::try_from(reader.take(3)?).unwrap_or(0);
    }
    let clen_table = HuffmanTable::build(&clen_lengths, MAX_QUICK_CLEN)?;

    // Literal/length and distance code lengths share one coded stream.
    let mut lengths = vec![0u8; literal_count + distance_count];
    let mut index = 0;
    while index < lengths.len() {
        let symbol = reader.decode(&clen_table)?;
        match symbol {
            0..=15 => {
                lengths[index] = symbol as u8;
                index += 1;
            }
            16 => {
                if index == 0 {
                    return Err(InvalidData("repeat with no previous length".to_string()));
                }
                let previous = lengths[index - 1];
                let repeat = reader.take(2)? as usize + 3;
                if index + repeat > lengths.len() {
                    return Err(InvalidData("length repeat overrun".to_string()));
                }
                for _ in 0..repeat {
                    lengths[index] = previous;
                    index += 1;
                }
            }
            17 => {
                let repeat = reader.take(3)? as usize + 3;
                if index + repeat > lengths.len() {
                    return Err(InvalidData("length repeat overrun".to_string()));
                }
                index += repeat;
            }
            18 => {
                let repeat = reader.take(7)? as usize + 11;
                if index + repeat > lengths.len() {
                    return Err(InvalidData("length repeat overrun".to_string()));
                }
                index += repeat;
            }
            _ => return Err(InvalidData("invalid code length symbol".to_string())),
        }
    }

    let literals = HuffmanTable::build(&lengths[..literal_count], MAX_QUICK_LIT)?;
    let distances = if lengths[literal_count..].iter().all(|&length| length == 0) {
        // A block with no distance codes (literals only) is legal; give
        // the decoder a table that rejects any distance code.
        HuffmanTable::build(&[1, 1], MAX_QUICK_DIST)?
    } else {
        HuffmanTable::build(&lengths[literal_count..], MAX_QUICK_DIST)?
    };
    Ok((literals, distances))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8], level: Compression) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), level);
        encoder.write_all(data).expect("deflate write");
        encoder.finish().expect("deflate finish")
    }

    fn inflate_slice(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let mut source = SliceSource::new(compressed);
        inflate(&mut source, compressed.len(), expected_len)
    }

    #[test_log::test]
    fn test_stored_block() -> Result<()> {
        let data = b"stored, not compressed";
        let compressed = deflate(data, Compression::none());
        assert_eq!(inflate_slice(&compressed, data.len())?, data);
        Ok(())
    }

    #[test_log::test]
    fn test_fixed_and_dynamic_blocks() -> Result<()> {
        // Short repetitive data compresses with the fixed tables; the
        // longer mixed payload forces dynamic tables.
        let short = b"abababababababab";
        let compressed = deflate(short, Compression::fast());
        assert_eq!(inflate_slice(&compressed, short.len())?, short);

        let mut long = Vec::new();
        for i in 0..4096u32 {
            long.extend_from_slice(format!("entry-{i};").as_bytes());
        }
        let compressed = deflate(&long, Compression::best());
        assert_eq!(inflate_slice(&compressed, long.len())?, long);
        Ok(())
    }

    #[test_log::test]
    fn test_incompressible_data() -> Result<()> {
        // A simple LCG makes deterministic pseudo-random bytes.
        let mut seed = 0x2545_F491u32;
        let data: Vec<u8> = (0..8192)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (seed >> 16) as u8
            })
            .collect();
        let compressed = deflate(&data, Compression::best());
        assert_eq!(inflate_slice(&compressed, data.len())?, data);
        Ok(())
    }

    #[test_log::test]
    fn test_truncated_input() {
        let data = b"truncate me truncate me truncate me";
        let compressed = deflate(data, Compression::best());
        let truncated = &compressed[..compressed.len() / 2];
        let result = inflate_slice(truncated, data.len());
        assert!(result.is_err());
    }

    #[test_log::test]
    fn test_wrong_expected_length() {
        let data = b"length mismatch";
        let compressed = deflate(data, Compression::best());
        assert!(inflate_slice(&compressed, data.len() + 1).is_err());
    }

    #[test_log::test]
    fn test_reads_bounded_by_padding() -> Result<()> {
        // Count how many bytes the decoder pulls; it must never exceed
        // the compressed size plus the documented padding.
        struct CountingSource<'a> {
            inner: SliceSource<'a>,
            reads: usize,
        }
        impl ByteSource for CountingSource<'_> {
            fn next_byte(&mut self) -> u8 {
                self.reads += 1;
                self.inner.next_byte()
            }
        }

        let data = b"padding-bounded";
        let compressed = deflate(data, Compression::best());
        let mut source = CountingSource {
            inner: SliceSource::new(&compressed),
            reads: 0,
        };
        let output = inflate(&mut source, compressed.len(), data.len())?;
        assert_eq!(output, data);
        assert!(source.reads <= compressed.len() + INFLATER_EXTRA_BYTES);
        Ok(())
    }
}
