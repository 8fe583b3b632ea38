//! Picking erased units for new data, round-robin from a rover.

use tracing::debug;

use super::units::UnitStatus;
use super::volume::Volume;
use super::{FtlError, Result};
use crate::nand::Nand;

impl<N: Nand> Volume<N> {
    /// Find an erased unit to hold a newly written virtual unit.
    ///
    /// The transfer unit must stay free, so this refuses unless at least two `Free` or `Erased`
    /// units (counting the transfer unit) exist.
    pub(super) fn allocate_unit(&mut self) -> Result<u32> {
        let spare = self.units.count(UnitStatus::Free) + self.units.count(UnitStatus::Erased);
        if spare < 2 {
            return Err(FtlError::NoFreeUnit);
        }

        let unit = self.next_erased_unit()?.ok_or(FtlError::NoFreeUnit)?;
        debug!(unit, "allocated unit");
        Ok(unit)
    }

    /// Scan round-robin from the rover for a unit that is, or can be made, `Erased`
    ///
    /// `Free` units are erased along the way; those that fail to erase are retired.
    pub(super) fn next_erased_unit(&mut self) -> Result<Option<u32>> {
        let count = self.geometry.units;
        let mut unit = self.rover;

        for _ in 0..count {
            unit = (unit + 1) % count;
            if unit == self.transfer || unit == self.geometry.boot_unit {
                continue;
            }

            let ready = match self.units.status(unit) {
                UnitStatus::Erased => true,
                UnitStatus::Free => self.erase_unit(unit)?,
                UnitStatus::Available | UnitStatus::Bad => false,
            };
            if ready {
                self.rover = unit;
                return Ok(Some(unit));
            }
        }

        Ok(None)
    }

    /// Pick a new transfer unit after the designated one failed to erase
    pub(super) fn replace_transfer(&mut self) -> Result<()> {
        let unit = self.next_erased_unit()?.ok_or(FtlError::NoFreeUnit)?;
        debug!(old = self.transfer, new = unit, "moved transfer unit");
        self.transfer = unit;
        Ok(())
    }

    /// Erase `Free` units until at least `minimum_free_sectors` sectors sit in erased units
    /// (not counting the transfer unit), or no `Free` units remain.
    ///
    /// Returns the number of sectors in erased units.
    pub fn defragment(&mut self, minimum_free_sectors: u64) -> Result<u64> {
        let per_unit = u64::from(self.geometry.sectors_per_unit);
        let count = self.geometry.units;

        let erased = (0..count)
            .filter(|&u| u != self.transfer && self.units.status(u) == UnitStatus::Erased)
            .count() as u64;
        let mut available = erased * per_unit;

        let mut unit = self.rover;
        for _ in 0..count {
            if available >= minimum_free_sectors {
                break;
            }

            unit = (unit + 1) % count;
            if unit == self.transfer || self.units.status(unit) != UnitStatus::Free {
                continue;
            }
            if self.erase_unit(unit)? {
                available += per_unit;
            }
        }

        debug!(available, minimum_free_sectors, "defragmented");
        Ok(available)
    }
}
