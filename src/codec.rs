//! Wire-to-canonical sample transforms.
//!
//! Two device families are covered: the ChronoVu LA8, whose SDRAM readout is
//! interleaved across 1 MiB super-blocks, and the SUMP-compatible Logic
//! Sniffer, which optionally run-length compresses its 32-bit samples.

use std::time::Duration;

use crate::capability::{ConfigError, SamplerateTable};

/// LA8 base clock.
pub const LA8_BASE_CLOCK_HZ: u64 = 100_000_000;
/// Bytes per block read from the LA8.
pub const LA8_BLOCK_SIZE: usize = 4096;
/// Blocks per full capture.
pub const LA8_NUM_BLOCKS: usize = 2048;
/// 8 MiB of sample memory, one byte per sample.
pub const LA8_SDRAM_SIZE: usize = LA8_BLOCK_SIZE * LA8_NUM_BLOCKS;

const MIB: usize = 1024 * 1024;

/// Time the LA8 needs to fill its SDRAM at divcount 0: 2^23 samples at 10 ns.
const LA8_CAPTURE_NANOS_PER_DIVCOUNT_STEP: u64 = 83_886_080;

/// All 255 LA8 samplerates, ascending (100 MHz / 255 .. 100 MHz).
pub fn la8_samplerates() -> SamplerateTable {
    SamplerateTable::list((1..=255).map(divcount_to_samplerate_raw).collect())
}

fn divcount_to_samplerate_raw(divisor: u64) -> u64 {
    LA8_BASE_CLOCK_HZ / divisor
}

/// Samplerate produced by a given divcount: `100 MHz / (divcount + 1)`.
pub fn divcount_to_samplerate(divcount: u8) -> u64 {
    divcount_to_samplerate_raw(u64::from(divcount) + 1)
}

/// Divcount for a supported samplerate. The LA8 sample period is
/// `(divcount + 1) * 10 ns`, so valid divcounts run 0x00..=0xfe.
pub fn samplerate_to_divcount(samplerate: u64) -> Result<u8, ConfigError> {
    if samplerate == 0 || !la8_samplerates().contains(samplerate) {
        return Err(ConfigError::InvalidSamplerate(samplerate));
    }
    let divcount = LA8_BASE_CLOCK_HZ / samplerate - 1;
    u8::try_from(divcount).map_err(|_| ConfigError::InvalidSamplerate(samplerate))
}

/// How long the LA8 takes to fill its SDRAM once triggered.
pub fn capture_duration(divcount: u8) -> Duration {
    Duration::from_nanos((u64::from(divcount) + 1) * LA8_CAPTURE_NANOS_PER_DIVCOUNT_STEP)
}

/// Canonical buffer position of the byte at `offset` in the raw readout.
pub fn demangled_index(offset: usize, divcount: u8) -> usize {
    let megabyte = offset / MIB;
    let parity = offset & 1;
    let index = megabyte * 2 + ((offset - megabyte * MIB) / 2) * 16;
    if divcount == 0 {
        index + parity
    } else {
        index + (1 - parity)
    }
}

/// De-mangle one raw block into its place in the canonical capture buffer.
pub fn demangle_block(raw: &[u8], block: usize, divcount: u8, canonical: &mut [u8]) {
    let byte_offset = block * LA8_BLOCK_SIZE;
    for (i, &byte) in raw.iter().enumerate() {
        canonical[demangled_index(byte_offset + i, divcount)] = byte;
    }
}

/// Inverse of [`demangle_block`] over a whole capture: produce the byte order
/// the LA8 would send for a canonical buffer.
pub fn mangle_capture(canonical: &[u8], divcount: u8) -> Vec<u8> {
    (0..canonical.len())
        .map(|offset| canonical[demangled_index(offset, divcount)])
        .collect()
}

/// Byte order of a 32-bit sample on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SampleByteOrder {
    #[default]
    Little,
    Big,
}

impl SampleByteOrder {
    pub fn decode(self, bytes: [u8; 4]) -> u32 {
        match self {
            SampleByteOrder::Little => u32::from_le_bytes(bytes),
            SampleByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }
}

const RLE_COUNT_FLAG: u32 = 0x8000_0000;

/// One decoded unit of the 32-bit sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RleOutput {
    Literal(u32),
    /// `count` further copies of the preceding literal.
    Run { value: u32, count: u32 },
}

impl RleOutput {
    pub fn value(&self) -> u32 {
        match self {
            RleOutput::Literal(value) | RleOutput::Run { value, .. } => *value,
        }
    }

    pub fn sample_count(&self) -> u64 {
        match self {
            RleOutput::Literal(_) => 1,
            RleOutput::Run { count, .. } => u64::from(*count),
        }
    }
}

/// Stateful run-length decoder for the Logic Sniffer sample stream.
#[derive(Debug, Clone)]
pub struct RleDecoder {
    enabled: bool,
    byte_order: SampleByteOrder,
    /// Previous raw sample; starts out with the count flag set so a leading
    /// flagged sample is taken as a literal.
    previous_raw: u32,
    last_literal: Option<u32>,
}

impl RleDecoder {
    pub fn new(enabled: bool, byte_order: SampleByteOrder) -> Self {
        Self {
            enabled,
            byte_order,
            previous_raw: RLE_COUNT_FLAG,
            last_literal: None,
        }
    }

    pub fn reset(&mut self) {
        self.previous_raw = RLE_COUNT_FLAG;
        self.last_literal = None;
    }

    pub fn push(&mut self, bytes: [u8; 4]) -> RleOutput {
        let raw = self.byte_order.decode(bytes);
        let previous = std::mem::replace(&mut self.previous_raw, raw);

        if self.enabled && raw & RLE_COUNT_FLAG != 0 && previous & RLE_COUNT_FLAG == 0 {
            if let Some(value) = self.last_literal {
                return RleOutput::Run {
                    value,
                    count: raw & !RLE_COUNT_FLAG,
                };
            }
        }

        self.last_literal = Some(raw);
        RleOutput::Literal(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divcount_round_trip() {
        for divisor in 1..=255u64 {
            if LA8_BASE_CLOCK_HZ % divisor != 0 {
                continue;
            }
            let rate = LA8_BASE_CLOCK_HZ / divisor;
            let divcount = samplerate_to_divcount(rate).unwrap();
            assert_eq!(u64::from(divcount), divisor - 1);
            assert_eq!(divcount_to_samplerate(divcount), rate);
        }
    }

    #[test]
    fn test_samplerate_table() {
        let table = la8_samplerates();
        assert_eq!(table.lowest(), Some(392_156));
        assert_eq!(table.highest(), Some(100_000_000));
        assert!(table.contains(1_000_000));
        assert_eq!(samplerate_to_divcount(1_000_000), Ok(99));
        assert!(samplerate_to_divcount(0).is_err());
        assert!(samplerate_to_divcount(1_000_001).is_err());
    }

    #[test]
    fn test_capture_duration() {
        assert_eq!(capture_duration(0), Duration::from_nanos(83_886_080));
        assert_eq!(capture_duration(99), Duration::from_nanos(8_388_608_000));
    }

    #[test]
    fn test_demangled_index_layout() {
        assert_eq!(demangled_index(0, 0), 0);
        assert_eq!(demangled_index(1, 0), 1);
        assert_eq!(demangled_index(2, 0), 16);
        assert_eq!(demangled_index(0, 5), 1);
        assert_eq!(demangled_index(1, 5), 0);
        assert_eq!(demangled_index(MIB, 0), 2);
        assert_eq!(demangled_index(MIB + 3, 0), 2 + 16 + 1);
    }

    #[test]
    fn test_demangle_is_bijection() {
        let canonical: Vec<u8> = (0..LA8_SDRAM_SIZE)
            .map(|i| (i.wrapping_mul(31) ^ (i >> 9)) as u8)
            .collect();

        for divcount in [0u8, 1, 127, 254] {
            let raw = mangle_capture(&canonical, divcount);
            let mut rebuilt = vec![0u8; LA8_SDRAM_SIZE];
            for (block, chunk) in raw.chunks(LA8_BLOCK_SIZE).enumerate() {
                demangle_block(chunk, block, divcount, &mut rebuilt);
            }
            assert!(rebuilt == canonical, "divcount {divcount} did not round-trip");
        }
    }

    #[test]
    fn test_rle_expands_run() {
        let mut decoder = RleDecoder::new(true, SampleByteOrder::Little);
        assert_eq!(
            decoder.push(0x0000_00aau32.to_le_bytes()),
            RleOutput::Literal(0xaa)
        );
        assert_eq!(
            decoder.push((RLE_COUNT_FLAG | 5).to_le_bytes()),
            RleOutput::Run {
                value: 0xaa,
                count: 5
            }
        );
    }

    #[test]
    fn test_rle_consecutive_counts_do_not_re_expand() {
        let mut decoder = RleDecoder::new(true, SampleByteOrder::Little);
        decoder.push(0x11u32.to_le_bytes());
        let first = decoder.push((RLE_COUNT_FLAG | 3).to_le_bytes());
        assert_eq!(first.sample_count(), 3);
        let second = decoder.push((RLE_COUNT_FLAG | 7).to_le_bytes());
        assert_eq!(second, RleOutput::Literal(RLE_COUNT_FLAG | 7));
    }

    #[test]
    fn test_rle_leading_flagged_sample_is_literal() {
        let mut decoder = RleDecoder::new(true, SampleByteOrder::Little);
        assert_eq!(
            decoder.push((RLE_COUNT_FLAG | 2).to_le_bytes()),
            RleOutput::Literal(RLE_COUNT_FLAG | 2)
        );
    }

    #[test]
    fn test_rle_disabled_passes_through() {
        let mut decoder = RleDecoder::new(false, SampleByteOrder::Little);
        decoder.push(0x01u32.to_le_bytes());
        assert_eq!(
            decoder.push((RLE_COUNT_FLAG | 4).to_le_bytes()),
            RleOutput::Literal(RLE_COUNT_FLAG | 4)
        );
    }

    #[test]
    fn test_big_endian_count_flag() {
        let mut decoder = RleDecoder::new(true, SampleByteOrder::Big);
        decoder.push([0x00, 0x00, 0x00, 0x42]);
        assert_eq!(
            decoder.push([0x80, 0x00, 0x00, 0x02]),
            RleOutput::Run {
                value: 0x42,
                count: 2
            }
        );
    }
}
