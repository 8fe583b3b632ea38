//! The 16-byte spare area that accompanies each 512-byte sector, and the redundant virtual unit
//! address records stored in it.

use deku::prelude::*;

use super::ecc::ECC_SIZE;
use crate::nand::{Nand, Region};

/// Bytes of spare area used per sector
pub const SPARE_SIZE: usize = 16;

/// Largest virtual unit number an address record can hold
pub const MAX_VIRTUAL_UNITS: u32 = 1 << 11;

/// The spare area of one sector, in SmartMedia layout
#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
pub struct SpareArea {
    /// Cleared when a page is programmed, so that an all-0xFF payload isn't mistaken for an
    /// erased page
    pub written: u8,

    pub reserved: [u8; 3],

    /// 0xFF while the sector holds live data (or is erased); anything else means deleted
    pub data_status: u8,

    /// Factory or runtime bad-unit marker
    pub block_status: u8,

    #[deku(endian = "big")]
    pub address1: u16,

    /// ECC of the second half of the sector
    pub ecc2: [u8; ECC_SIZE],

    #[deku(endian = "big")]
    pub address2: u16,

    /// ECC of the first half of the sector
    pub ecc1: [u8; ECC_SIZE],
}

impl Default for SpareArea {
    fn default() -> Self {
        Self::ERASED
    }
}

impl SpareArea {
    /// An untouched spare area; also "leave everything alone" when used for partial programming
    pub const ERASED: Self = Self {
        written: 0xFF,
        reserved: [0xFF; 3],
        data_status: 0xFF,
        block_status: 0xFF,
        address1: 0xFFFF,
        ecc2: [0xFF; ECC_SIZE],
        address2: 0xFFFF,
        ecc1: [0xFF; ECC_SIZE],
    };

    /// Spare content to program alongside sector data with the given codes
    pub fn with_ecc(ecc1: [u8; ECC_SIZE], ecc2: [u8; ECC_SIZE]) -> Self {
        Self {
            written: 0x00,
            ecc1,
            ecc2,
            ..Self::ERASED
        }
    }

    /// Like [SpareArea::with_ecc], also carrying the owning virtual unit's address records
    pub fn with_ecc_and_address(ecc1: [u8; ECC_SIZE], ecc2: [u8; ECC_SIZE], unit: u32) -> Self {
        let record = encode_address(unit);
        Self {
            address1: record,
            address2: record,
            ..Self::with_ecc(ecc1, ecc2)
        }
    }

    /// Spare content that records `unit` as the owning virtual unit, in both records
    pub fn with_address(unit: u32) -> Self {
        let record = encode_address(unit);
        Self {
            address1: record,
            address2: record,
            ..Self::ERASED
        }
    }

    /// Spare content that marks the sector deleted
    pub fn deleted() -> Self {
        Self {
            data_status: 0x00,
            ..Self::ERASED
        }
    }

    /// Spare content that marks the whole unit bad
    pub fn bad_block() -> Self {
        Self {
            block_status: 0x00,
            ..Self::ERASED
        }
    }

    /// Does the sector still hold live data (or nothing at all)?
    pub fn is_live(&self) -> bool {
        self.data_status == 0xFF
    }

    /// Has a page been programmed along with this spare area? Tolerates a few flipped bits.
    pub fn is_written(&self) -> bool {
        self.written.count_ones() < 4
    }

    /// Is the unit marked bad? Up to one flipped bit in the marker is tolerated.
    pub fn is_bad_block(&self) -> bool {
        self.block_status.count_ones() < 7
    }

    /// Are the code bytes still erased?
    pub fn ecc_erased(&self) -> bool {
        self.ecc1 == [0xFF; ECC_SIZE] && self.ecc2 == [0xFF; ECC_SIZE]
    }

    /// Both address records, decoded; either may be missing or corrupt
    pub fn addresses(&self) -> [Option<u32>; 2] {
        [decode_address(self.address1), decode_address(self.address2)]
    }

    /// The first address record holding a virtual unit number below `limit`
    pub fn unit_address(&self, limit: u32) -> Option<u32> {
        self.addresses()
            .into_iter()
            .flatten()
            .find(|&unit| unit < limit)
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, spare) = Self::from_bytes((bytes, 0)).ok()?;
        Some(spare)
    }

    /// Write into a byte slice
    pub fn encode(&self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = self.to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }

    /// Convert into the on-card representation
    pub fn to_array(&self) -> anyhow::Result<[u8; SPARE_SIZE]> {
        let mut bytes = [0xFF; SPARE_SIZE];
        self.encode(&mut bytes)?;
        Ok(bytes)
    }
}

/// Build an address record: `0001 AAAA AAAA AAAP`, where `A` is the 11-bit unit number and `P`
/// makes the number of set bits even.
pub fn encode_address(unit: u32) -> u16 {
    let record = 0x1000 | ((unit as u16 & 0x7FF) << 1);
    record | (record.count_ones() & 1) as u16
}

/// Decode an address record, rejecting erased or corrupt ones
pub fn decode_address(record: u16) -> Option<u32> {
    if record & 0xF000 != 0x1000 || record.count_ones() % 2 != 0 {
        return None;
    }
    Some(u32::from(record >> 1 & 0x7FF))
}

/// Read the spare areas of `count` consecutive sectors beginning at data offset `offset`
pub fn read_spares<N: Nand>(nand: &N, offset: u64, count: u32) -> anyhow::Result<Vec<SpareArea>> {
    let stride = nand.get_layout().spare_per_page;
    anyhow::ensure!(stride >= SPARE_SIZE, "spare area of {stride} bytes is too small");

    let mut buf = vec![0; stride * count as usize];
    nand.read(offset, &mut buf, Region::Spare)?;

    buf.chunks_exact(stride)
        .map(|chunk| SpareArea::decode(chunk).ok_or(anyhow::anyhow!("unparseable spare area")))
        .collect()
}

/// Does either of the first two sectors of the unit at `offset` carry the bad-unit marker?
pub fn unit_is_bad<N: Nand>(nand: &N, offset: u64) -> anyhow::Result<bool> {
    Ok(read_spares(nand, offset, 2)?
        .iter()
        .any(SpareArea::is_bad_block))
}

/// Stamp the bad-unit marker into the first two sectors of the unit at `offset`
pub fn mark_unit_bad<N: Nand>(nand: &mut N, offset: u64) -> anyhow::Result<()> {
    let layout = nand.get_layout();
    let mut buf = vec![0xFF; layout.spare_per_page * 2];
    SpareArea::bad_block().encode(&mut buf)?;
    SpareArea::bad_block().encode(&mut buf[layout.spare_per_page..])?;
    nand.program(offset, &buf, Region::Spare)
}

#[test]
fn test_address_records() {
    assert_eq!(encode_address(0), 0x1001);
    assert_eq!(encode_address(1), 0x1002);
    assert_eq!(encode_address(0x7FF), 0x1FFE);

    assert_eq!(decode_address(0x1002), Some(1));
    assert_eq!(decode_address(encode_address(999)), Some(999));

    // Erased, CIS-style zero, and bad parity
    assert_eq!(decode_address(0xFFFF), None);
    assert_eq!(decode_address(0x0000), None);
    assert_eq!(decode_address(0x1003), None);
}

#[test]
fn test_spare_layout() -> anyhow::Result<()> {
    let mut spare = SpareArea::with_ecc([0x11, 0x22, 0x33], [0x44, 0x55, 0x66]);
    spare.address1 = encode_address(5);
    spare.address2 = 0x0000;

    let bytes = spare.to_array()?;
    assert_eq!(
        bytes,
        [
            0x00, // written
            0xFF, 0xFF, 0xFF, // reserved
            0xFF, 0xFF, // data and block status
            0x10, 0x0B, // address 1
            0x44, 0x55, 0x66, // ecc2
            0x00, 0x00, // address 2
            0x11, 0x22, 0x33, // ecc1
        ]
    );

    let decoded = SpareArea::decode(&bytes).unwrap();
    assert_eq!(decoded, spare);
    assert_eq!(decoded.addresses(), [Some(5), None]);
    assert_eq!(decoded.unit_address(5), None);
    assert_eq!(decoded.unit_address(6), Some(5));
    Ok(())
}

#[test]
fn test_status_markers() {
    assert!(SpareArea::ERASED.is_live());
    assert!(!SpareArea::deleted().is_live());
    assert!(!SpareArea::ERASED.is_written());
    assert!(SpareArea::with_ecc([0xFF; 3], [0xFF; 3]).is_written());
    assert!(SpareArea::with_ecc([0xFF; 3], [0xFF; 3]).ecc_erased());

    let written = SpareArea::with_ecc_and_address([0; 3], [0; 3], 12);
    assert!(written.is_written() && written.is_live());
    assert_eq!(written.addresses(), [Some(12), Some(12)]);
    assert!(!SpareArea::ERASED.is_bad_block());
    assert!(SpareArea::bad_block().is_bad_block());

    let one_flip = SpareArea {
        block_status: 0xFB,
        ..SpareArea::ERASED
    };
    assert!(!one_flip.is_bad_block());
}
