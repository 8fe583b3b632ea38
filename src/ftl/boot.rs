//! The boot/CIS record that marks a card as formatted and describes its geometry.

use deku::prelude::*;

use super::spare::{MAX_VIRTUAL_UNITS, SPARE_SIZE};
use super::SECTOR_SIZE;
use crate::nand::NandLayout;

/// Current descriptor version
pub const FORMAT_VERSION: u8 = 1;

/// The boot record, stored at the start of sectors 0 and 1 of the boot unit.
///
/// It opens with the fixed tuple prefix of the SmartMedia card information structure, followed by
/// the little-endian geometry descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(
    magic = b"\x01\x03\xD9\x01\xFF\x18\x02\xDF\x01\x20",
    endian = "little"
)]
pub struct BootRecord {
    pub version: u8,

    /// Total erase units on the card, including the boot unit and any bad units
    pub units: u32,

    pub sectors_per_unit: u16,
    pub sector_size: u16,

    /// Number of virtual units presented to the host
    pub virtual_units: u16,
}

impl BootRecord {
    /// Describe a fresh format of `layout` with the given number of virtual units
    pub fn new(layout: NandLayout, virtual_units: u16) -> Self {
        Self {
            version: FORMAT_VERSION,
            units: layout.blocks,
            sectors_per_unit: layout.pages_per_block as u16,
            sector_size: SECTOR_SIZE as u16,
            virtual_units,
        }
    }

    /// Convert from a byte slice, if it starts with a boot record
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, record) = Self::from_bytes((bytes, 0)).ok()?;
        Some(record)
    }

    /// Build the full content of a boot sector holding this record
    pub fn to_sector(&self) -> anyhow::Result<Vec<u8>> {
        let mut sector = self.to_bytes()?;
        anyhow::ensure!(sector.len() <= SECTOR_SIZE, "boot record larger than a sector");
        sector.resize(SECTOR_SIZE, 0xFF);
        Ok(sector)
    }

    /// Check this record against the device it was found on, and derive the geometry
    pub fn geometry(&self, layout: NandLayout, boot_unit: u32) -> Result<Geometry, String> {
        if self.version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", self.version));
        }
        if usize::from(self.sector_size) != SECTOR_SIZE {
            return Err(format!("unsupported sector size {}", self.sector_size));
        }
        if self.units != layout.blocks || u32::from(self.sectors_per_unit) != layout.pages_per_block
        {
            return Err(format!(
                "recorded geometry {}x{} does not match the device ({}x{})",
                self.units, self.sectors_per_unit, layout.blocks, layout.pages_per_block
            ));
        }

        let virtual_units = u32::from(self.virtual_units);
        if virtual_units == 0 || virtual_units > MAX_VIRTUAL_UNITS {
            return Err(format!("impossible virtual unit count {virtual_units}"));
        }

        // Besides the boot unit and everything before it, one unit must be left for transfers
        let needed = u64::from(boot_unit) + 2 + u64::from(virtual_units);
        if needed > u64::from(self.units) {
            return Err(format!(
                "{virtual_units} virtual units do not fit in {} units",
                self.units
            ));
        }

        Ok(Geometry {
            units: self.units,
            sectors_per_unit: layout.pages_per_block,
            boot_unit,
            virtual_units,
        })
    }
}

/// Reject devices whose pages can't hold SSFDC sectors
pub fn check_layout(layout: NandLayout) -> Result<(), String> {
    if layout.bytes_per_page != SECTOR_SIZE {
        return Err(format!("page size {} is not {SECTOR_SIZE}", layout.bytes_per_page));
    }
    if layout.spare_per_page < SPARE_SIZE {
        return Err(format!("spare area of {} bytes is too small", layout.spare_per_page));
    }
    if layout.pages_per_block < 2 || layout.pages_per_block > u32::from(u16::MAX) {
        return Err(format!("unsupported unit size of {} sectors", layout.pages_per_block));
    }
    Ok(())
}

/// The shape of a mounted volume
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    /// Physical units on the card
    pub units: u32,

    pub sectors_per_unit: u32,

    /// The unit holding the boot record
    pub boot_unit: u32,

    pub virtual_units: u32,
}

impl Geometry {
    /// Logical sectors presented to the host
    pub fn sector_count(&self) -> u64 {
        u64::from(self.virtual_units) * u64::from(self.sectors_per_unit)
    }

    /// Split a logical sector number into its virtual unit and the index within it
    pub fn split(&self, sector: u64) -> (u32, u32) {
        let per_unit = u64::from(self.sectors_per_unit);
        ((sector / per_unit) as u32, (sector % per_unit) as u32)
    }

    /// Device offset of a physical sector
    pub fn sector_offset(&self, unit: u32, index: u32) -> u64 {
        (u64::from(unit) * u64::from(self.sectors_per_unit) + u64::from(index)) * SECTOR_SIZE as u64
    }

    /// Device offset of the first sector of a physical unit
    pub fn unit_offset(&self, unit: u32) -> u64 {
        self.sector_offset(unit, 0)
    }
}
