//! Fixed-format attribute record stored per block identifier.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "CWBA"
//! 4       1     format version (1)
//! 5       1     flags
//! 6       2     reserved, zero
//! 8       8     reference_count (LE)
//! 16      8     size_bytes (LE)
//! 24      8     crc64 of bytes 0..24 (LE)
//! ```

use thiserror::Error;

use crate::digest::crc64;

pub const RECORD_LEN: usize = 32;

const RECORD_MAGIC: &[u8; 4] = b"CWBA";
const RECORD_VERSION: u8 = 1;
const CHECKED_LEN: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordDecodeError {
    #[error("expected 32 bytes, got {0}")]
    Length(usize),

    #[error("bad magic")]
    Magic,

    #[error("unsupported record version {0}")]
    Version(u8),

    #[error("record checksum mismatch")]
    Checksum,
}

/// Per-block flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockFlags(u8);

impl BlockFlags {
    /// One of the references is held by the store itself (the zero block).
    pub const STANDING: BlockFlags = BlockFlags(0x01);
    /// Payload was fsynced before the record was published.
    pub const SYNCED: BlockFlags = BlockFlags(0x02);

    pub const fn empty() -> Self {
        BlockFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        BlockFlags(bits)
    }

    pub const fn contains(self, other: BlockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BlockFlags) {
        self.0 |= other.0;
    }
}

/// Metadata kept for every distinct block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAttributeRecord {
    pub reference_count: u64,
    pub size_bytes: u64,
    pub flags: BlockFlags,
}

impl BlockAttributeRecord {
    /// Record for a freshly allocated block holding one reference.
    pub fn new(size_bytes: u64) -> Self {
        Self {
            reference_count: 1,
            size_bytes,
            flags: BlockFlags::empty(),
        }
    }

    /// A zero count marks the block as awaiting reclamation.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.reference_count > 0
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..4].copy_from_slice(RECORD_MAGIC);
        buf[4] = RECORD_VERSION;
        buf[5] = self.flags.bits();
        buf[8..16].copy_from_slice(&self.reference_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size_bytes.to_le_bytes());
        let check = crc64(&buf[..CHECKED_LEN]);
        buf[24..32].copy_from_slice(&check.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordDecodeError> {
        let buf: &[u8; RECORD_LEN] = bytes
            .try_into()
            .map_err(|_| RecordDecodeError::Length(bytes.len()))?;
        if &buf[0..4] != RECORD_MAGIC {
            return Err(RecordDecodeError::Magic);
        }
        if buf[4] != RECORD_VERSION {
            return Err(RecordDecodeError::Version(buf[4]));
        }
        let stored = u64::from_le_bytes(le8(&buf[24..32]));
        if stored != crc64(&buf[..CHECKED_LEN]) {
            return Err(RecordDecodeError::Checksum);
        }

        Ok(Self {
            reference_count: u64::from_le_bytes(le8(&buf[8..16])),
            size_bytes: u64::from_le_bytes(le8(&buf[16..24])),
            flags: BlockFlags::from_bits(buf[5]),
        })
    }
}

fn le8(slice: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockAttributeRecord {
        let mut flags = BlockFlags::STANDING;
        flags.insert(BlockFlags::SYNCED);
        BlockAttributeRecord {
            reference_count: 42,
            size_bytes: 4096,
            flags,
        }
    }

    #[test]
    fn test_layout() {
        let buf = sample().encode();
        assert_eq!(&buf[0..4], b"CWBA");
        assert_eq!(buf[4], 1);
        assert_eq!(buf[5], 0x03);
        assert_eq!(&buf[6..8], &[0u8, 0]);
        assert_eq!(u64::from_le_bytes(le8(&buf[8..16])), 42);
        assert_eq!(u64::from_le_bytes(le8(&buf[16..24])), 4096);
        assert_eq!(BlockAttributeRecord::decode(&buf).unwrap(), sample());
    }

    #[test]
    fn test_rejects_truncated() {
        let buf = sample().encode();
        assert_eq!(
            BlockAttributeRecord::decode(&buf[..31]),
            Err(RecordDecodeError::Length(31))
        );
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let mut buf = sample().encode();
        buf[0] = b'X';
        assert_eq!(BlockAttributeRecord::decode(&buf), Err(RecordDecodeError::Magic));

        let mut buf = sample().encode();
        buf[4] = 9;
        assert_eq!(
            BlockAttributeRecord::decode(&buf),
            Err(RecordDecodeError::Version(9))
        );
    }

    #[test]
    fn test_detects_bit_flip() {
        let mut buf = sample().encode();
        buf[9] ^= 0x10;
        assert_eq!(
            BlockAttributeRecord::decode(&buf),
            Err(RecordDecodeError::Checksum)
        );
    }

    #[test]
    fn test_flags() {
        let mut flags = BlockFlags::empty();
        assert!(!flags.contains(BlockFlags::STANDING));
        flags.insert(BlockFlags::STANDING);
        assert!(flags.contains(BlockFlags::STANDING));
        assert!(!flags.contains(BlockFlags::SYNCED));
    }

    #[test]
    fn test_liveness() {
        let mut record = BlockAttributeRecord::new(512);
        assert!(record.is_live());
        record.reference_count = 0;
        assert!(!record.is_live());
    }
}
