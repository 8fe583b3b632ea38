//! Logical sector to physical sector translation, and the read path.

use tracing::warn;

use super::ecc::{self, Correction, ECC_BLOCK};
use super::replace::SectorState;
use super::volume::Volume;
use super::{FtlError, Result};
use crate::nand::{Nand, Region};

impl<N: Nand> Volume<N> {
    /// Find the physical unit and index currently holding a logical sector's live data
    pub(super) fn locate(&self, sector: u64) -> Result<Option<(u32, u32)>> {
        self.check_range(sector, 1)?;

        let (virtual_unit, index) = self.geometry.split(sector);
        let Some(unit) = self.map.get(virtual_unit) else {
            return Ok(None);
        };
        if self.units.is_erased(unit, index) {
            return Ok(None);
        }

        if self.read_spare(unit, index)?.is_live() {
            return Ok(Some((unit, index)));
        }

        match self.replacement.entry(unit, index) {
            Some(SectorState::Moved) => Ok(Some((self.transfer, index))),
            _ => Ok(None),
        }
    }

    /// Translate a logical sector to the device offset of its data, or `None` if unassigned
    pub fn map_sector(&self, sector: u64) -> Result<Option<u64>> {
        Ok(self
            .locate(sector)?
            .map(|(unit, index)| self.geometry.sector_offset(unit, index)))
    }

    /// Read a logical sector, correcting single-bit errors.
    ///
    /// The returned data lives in the volume's read cache, so reading the same sector again is
    /// free until it's written or deleted.
    pub fn read_sector(&mut self, sector: u64) -> Result<Option<&[u8]>> {
        if self.cache.sector == Some(sector) {
            return Ok(Some(&self.cache.data));
        }

        let Some((unit, index)) = self.locate(sector)? else {
            return Ok(None);
        };

        self.cache.sector = None;
        let offset = self.geometry.sector_offset(unit, index);
        self.nand.read(offset, &mut self.cache.data, Region::Data)?;
        let spare = self.read_spare(unit, index)?;

        let halves = self.cache.data.chunks_exact_mut(ECC_BLOCK);
        for (half, code) in halves.zip([spare.ecc1, spare.ecc2]) {
            match ecc::correct(half, code) {
                Ok(Correction::Clean) => {}
                Ok(correction) => warn!(sector, unit, index, ?correction, "corrected ECC error"),
                Err(_) => return Err(FtlError::Uncorrectable { sector }),
            }
        }

        self.cache.sector = Some(sector);
        Ok(Some(&self.cache.data))
    }
}
