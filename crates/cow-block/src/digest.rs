//! CRC-64 content digest.
//!
//! Reflected ECMA-182 polynomial with all-ones initial state and a final
//! complement (the CRC-64/XZ parameter set), driven by a 256-entry table
//! that is built once per process.

use std::hash::Hasher;

use once_cell::sync::Lazy;

use crate::ident::BlockId;

/// Bit-reversed ECMA-182 polynomial.
pub const CRC64_POLY: u64 = 0xC96C_5795_D787_0F42;

const CRC64_INIT: u64 = u64::MAX;

static CRC64_TABLE: Lazy<[u64; 256]> = Lazy::new(build_table);

fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    for (byte, slot) in table.iter_mut().enumerate() {
        let mut crc = byte as u64;
        for _ in 0..8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ CRC64_POLY
            } else {
                crc >> 1
            };
        }
        *slot = crc;
    }
    table
}

/// Byte order used when presenting a checksum.
///
/// External CRC-64 tools (7-Zip, `xz --list`) print the value byte-reversed
/// relative to the in-memory little-endian accumulator, hence `Big` is the
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    Little,
    #[default]
    Big,
}

/// Incremental CRC-64 accumulator.
#[derive(Debug, Clone)]
pub struct Crc64 {
    state: u64,
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc64 {
    pub fn new() -> Self {
        Self { state: CRC64_INIT }
    }

    /// Fold `data` into the running checksum.
    pub fn update(&mut self, data: &[u8]) {
        let table = &*CRC64_TABLE;
        let mut state = self.state;
        for &byte in data {
            state = table[((state ^ byte as u64) & 0xFF) as usize] ^ (state >> 8);
        }
        self.state = state;
    }

    /// Final checksum, complemented and arranged in `endian` order.
    pub fn checksum(&self, endian: Endian) -> u64 {
        let value = self.state ^ CRC64_INIT;
        match endian {
            Endian::Little => value,
            Endian::Big => value.swap_bytes(),
        }
    }

    pub fn reset(&mut self) {
        self.state = CRC64_INIT;
    }
}

impl Hasher for Crc64 {
    fn finish(&self) -> u64 {
        self.checksum(Endian::Little)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.update(bytes);
    }
}

/// CRC-64 of `data` as a plain integer (`0x995DC9BBDF1939FA` for `"123456789"`).
#[inline]
pub fn crc64(data: &[u8]) -> u64 {
    let mut crc = Crc64::new();
    crc.update(data);
    crc.checksum(Endian::Little)
}

/// Content identifier of `data`.
///
/// The identifier bytes are the checksum in big-endian order, so its hex form
/// reads the same as the value printed by external CRC-64 tooling.
#[inline]
pub fn digest(data: &[u8]) -> BlockId {
    BlockId::from_bytes(crc64(data).to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc64(b"123456789"), 0x995D_C9BB_DF19_39FA);
        assert_eq!(digest(b"123456789").to_string(), "995dc9bbdf1939fa");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(crc64(b""), 0);
    }

    #[test]
    fn test_table_entries() {
        assert_eq!(CRC64_TABLE[0], 0);
        // 0x80 shifts down to bit 0 on the last round, leaving exactly the polynomial
        assert_eq!(CRC64_TABLE[0x80], CRC64_POLY);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut crc = Crc64::new();
        for chunk in data.chunks(7) {
            crc.update(chunk);
        }
        assert_eq!(crc.checksum(Endian::Little), crc64(data));
    }

    #[test]
    fn test_big_endian_presentation() {
        let mut crc = Crc64::new();
        crc.update(b"123456789");
        assert_eq!(crc.checksum(Endian::Big), 0xFA39_19DF_BBC9_5D99);
        assert_eq!(
            crc.checksum(Endian::Big),
            crc.checksum(Endian::Little).swap_bytes()
        );
    }

    #[test]
    fn test_reset() {
        let mut crc = Crc64::new();
        crc.update(b"garbage");
        crc.reset();
        crc.update(b"123456789");
        assert_eq!(crc.checksum(Endian::Little), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn test_hasher_impl() {
        use std::hash::Hash;

        let mut hasher = Crc64::new();
        [1u8, 2, 3].hash(&mut hasher);
        let a = hasher.finish();

        let mut hasher = Crc64::new();
        [1u8, 2, 3].hash(&mut hasher);
        assert_eq!(a, hasher.finish());
    }

    #[test]
    fn test_zero_blocks_of_different_sizes_differ() {
        assert_ne!(digest(&[0u8; 512]), digest(&[0u8; 4096]));
    }
}
