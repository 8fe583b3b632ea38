//! The write and delete paths: in-place writes, replacement through the transfer unit, and
//! consolidation of a replaced unit.

use tracing::{debug, warn};

use super::mount::{Interrupted, Slot};
use super::spare::SpareArea;
use super::units::UnitStatus;
use super::volume::Volume;
use super::{FtlError, Result, SECTOR_SIZE};
use crate::nand::{Nand, Region};

/// Where a sector of the replaced unit stands
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SectorState {
    /// Never written; still writable in place
    Erased,

    /// Live in the replaced unit
    Allocated,

    /// Live in the transfer unit; the copy in the replaced unit is deleted
    Moved,

    /// Dead, and the transfer unit's slot is still erased
    DeletedInPlace,

    /// Dead, and the transfer unit's slot has been used up
    DeletedInTransfer,
}

impl SectorState {
    /// Does a live copy of the sector exist?
    pub fn is_live(self) -> bool {
        matches!(self, Self::Allocated | Self::Moved)
    }

    /// Has the sector's slot in the transfer unit been programmed?
    pub fn uses_transfer(self) -> bool {
        matches!(self, Self::Moved | Self::DeletedInTransfer)
    }
}

/// The replacement state machine. At most one unit is ever being replaced.
#[derive(Debug, Clone, Default)]
pub enum Replacement {
    #[default]
    Idle,

    Replacing {
        /// The unit being phased out
        unit: u32,

        /// One entry per sector of the unit
        sectors: Vec<SectorState>,
    },
}

impl Replacement {
    pub fn unit(&self) -> Option<u32> {
        match self {
            Self::Idle => None,
            Self::Replacing { unit, .. } => Some(*unit),
        }
    }

    /// The state of a sector, if `unit` is the one being replaced
    pub fn entry(&self, unit: u32, index: u32) -> Option<SectorState> {
        match self {
            Self::Replacing { unit: u, sectors } if *u == unit => Some(sectors[index as usize]),
            _ => None,
        }
    }

    fn set(&mut self, index: u32, state: SectorState) {
        if let Self::Replacing { sectors, .. } = self {
            sectors[index as usize] = state;
        }
    }

    /// Is no sector under replacement live anymore?
    fn is_dead(&self) -> bool {
        match self {
            Self::Idle => false,
            Self::Replacing { sectors, .. } => !sectors.iter().any(|s| s.is_live()),
        }
    }
}

/// Did a program attempt use up its sector? A write fault does; any other error leaves it alone.
fn consumed(outcome: &Result<()>) -> bool {
    matches!(outcome, Ok(()) | Err(FtlError::WriteFault { .. }))
}

impl<N: Nand> Volume<N> {
    /// Write one 512-byte logical sector
    pub fn write_sector(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        self.check_range(sector, 1)?;
        if data.len() != SECTOR_SIZE {
            return Err(FtlError::InvalidLength(data.len()));
        }
        if self.cache.sector == Some(sector) {
            self.invalidate_cache();
        }

        let (virtual_unit, index) = self.geometry.split(sector);
        if self.try_write(virtual_unit, index, data)? {
            return Ok(());
        }

        // The sector was already rewritten during this replacement, so its transfer slot is
        // spent. Settle the replacement and go again against the consolidated unit.
        debug!(sector, "sector rewritten twice, consolidating early");
        self.finish_replacement()?;
        if self.try_write(virtual_unit, index, data)? {
            return Ok(());
        }

        let unit = self.map.get(virtual_unit).unwrap_or(self.transfer);
        Err(FtlError::InconsistentReplacement { unit })
    }

    /// Attempt a write; `false` means it needs the current replacement to be finished first
    fn try_write(&mut self, virtual_unit: u32, index: u32, data: &[u8]) -> Result<bool> {
        let unit = match self.map.get(virtual_unit) {
            Some(unit) => unit,
            None => {
                let unit = self.allocate_unit()?;
                self.assign(unit, virtual_unit)?;
                unit
            }
        };

        if self.replacement.unit() != Some(unit) {
            if self.units.is_erased(unit, index) {
                self.program_sector(unit, index, virtual_unit, data)?;
                return Ok(true);
            }

            self.finish_replacement()?;
            self.start_replacement(unit)?;
        }

        self.write_replaced(unit, index, virtual_unit, data)
    }

    /// Give an erased unit to a virtual unit, stamping the address into every sector
    fn assign(&mut self, unit: u32, virtual_unit: u32) -> Result<()> {
        let spare = SpareArea::with_address(virtual_unit);
        for index in 0..self.geometry.sectors_per_unit {
            if let Err(e) = self.program_spare(unit, index, &spare) {
                self.units.mark_free(unit);
                return Err(e);
            }
        }

        self.units.set_status(unit, UnitStatus::Available);
        self.map.set(virtual_unit, unit);
        Ok(())
    }

    /// Begin replacing `unit`, classifying each of its sectors
    fn start_replacement(&mut self, unit: u32) -> Result<()> {
        let mut sectors = Vec::with_capacity(self.geometry.sectors_per_unit as usize);
        for index in 0..self.geometry.sectors_per_unit {
            let state = if self.units.is_erased(unit, index) {
                SectorState::Erased
            } else if self.read_spare(unit, index)?.is_live() {
                SectorState::Allocated
            } else {
                SectorState::DeletedInPlace
            };
            sectors.push(state);
        }

        debug!(unit, transfer = self.transfer, "replacing unit");
        self.replacement = Replacement::Replacing { unit, sectors };
        Ok(())
    }

    /// Write a sector of the unit being replaced.
    ///
    /// Rewritten sectors carry the virtual unit's address into the transfer unit, so a mount
    /// after power loss can pair the two units up again.
    fn write_replaced(
        &mut self,
        unit: u32,
        index: u32,
        virtual_unit: u32,
        data: &[u8],
    ) -> Result<bool> {
        let Some(state) = self.replacement.entry(unit, index) else {
            return Ok(false);
        };

        match state {
            SectorState::Erased => {
                let outcome = self.program_sector(unit, index, virtual_unit, data);
                if consumed(&outcome) {
                    let state = match &outcome {
                        Ok(()) => SectorState::Allocated,
                        Err(_) => SectorState::DeletedInPlace,
                    };
                    self.replacement.set(index, state);
                }
                outcome?;
            }
            SectorState::Allocated | SectorState::DeletedInPlace => {
                let transfer = self.transfer;
                let outcome = self.program_sector(transfer, index, virtual_unit, data);
                if consumed(&outcome) {
                    // Whether or not the new copy took, the old one is superseded
                    if state == SectorState::Allocated {
                        self.delete_in_place(unit, index)?;
                    }

                    let state = match &outcome {
                        Ok(()) => SectorState::Moved,
                        Err(_) => SectorState::DeletedInTransfer,
                    };
                    self.replacement.set(index, state);
                }
                outcome?;
            }
            SectorState::Moved | SectorState::DeletedInTransfer => return Ok(false),
        }

        Ok(true)
    }

    /// The virtual unit a replaced unit belongs to, from the address records of its first sector
    fn replaced_virtual_unit(&self, unit: u32) -> Result<u32> {
        let spare = self.read_spare(unit, 0)?;
        let [first, second] = spare.addresses();

        let owns = |record: Option<u32>| {
            record.filter(|&vu| {
                vu < self.geometry.virtual_units && self.map.get(vu) == Some(unit)
            })
        };

        if let Some(virtual_unit) = owns(first) {
            return Ok(virtual_unit);
        }
        match owns(second) {
            Some(virtual_unit) => {
                warn!(unit, virtual_unit, "first address record unusable, using the second");
                Ok(virtual_unit)
            }
            None => Err(FtlError::InconsistentReplacement { unit }),
        }
    }

    /// Complete the pending replacement, if any.
    ///
    /// Live sectors still in the replaced unit are copied into the transfer unit, which then takes
    /// over the virtual unit; the replaced unit is erased and becomes the new transfer unit. If no
    /// live sector remains, the replacement is simply cancelled.
    pub(super) fn finish_replacement(&mut self) -> Result<()> {
        let unit = match &self.replacement {
            Replacement::Idle => return Ok(()),
            Replacement::Replacing { unit, .. } => *unit,
        };

        if self.replacement.is_dead() {
            return self.cancel_replacement();
        }

        // On failure, everything is left as it was
        let virtual_unit = self.replaced_virtual_unit(unit)?;

        loop {
            let transfer = self.transfer;
            match self.copy_sectors(unit, transfer, virtual_unit, SectorState::Allocated) {
                Ok(()) => break,
                Err(FtlError::WriteFault { offset }) => {
                    warn!(transfer, offset, "copy into transfer unit failed");
                    self.relocate_transfer(virtual_unit)?;
                }
                Err(e) => return Err(e),
            }
        }

        let transfer = self.transfer;
        let address = SpareArea::with_address(virtual_unit);
        for index in 0..self.geometry.sectors_per_unit {
            self.program_spare(transfer, index, &address)?;
        }

        self.units.set_status(transfer, UnitStatus::Available);
        self.map.set(virtual_unit, transfer);
        self.replacement = Replacement::Idle;

        self.transfer = unit;
        if !self.erase_unit(unit)? {
            self.replace_transfer()?;
        }

        debug!(
            old = unit,
            new = transfer,
            virtual_unit,
            "finished replacement"
        );
        Ok(())
    }

    /// Copy every sector of `from` whose entry is `state` into `to`, verbatim with its ECC
    fn copy_sectors(
        &mut self,
        from: u32,
        to: u32,
        virtual_unit: u32,
        state: SectorState,
    ) -> Result<()> {
        let indexes: Vec<u32> = match &self.replacement {
            Replacement::Idle => return Ok(()),
            Replacement::Replacing { sectors, .. } => (0..)
                .zip(sectors)
                .filter(|&(_, s)| *s == state)
                .map(|(index, _)| index)
                .collect(),
        };

        let mut page = vec![0; SECTOR_SIZE];
        for index in indexes {
            let offset = self.geometry.sector_offset(from, index);
            self.nand.read(offset, &mut page, Region::Data)?;
            let old = self.read_spare(from, index)?;
            let spare = SpareArea::with_ecc_and_address(old.ecc1, old.ecc2, virtual_unit);
            self.program_page(to, index, &page, &spare)?;
        }

        Ok(())
    }

    /// Move the pending replacement onto a fresh transfer unit, retiring the current one after it
    /// failed to program.
    ///
    /// Sectors already moved are carried across, and slots the old unit used up for dead sectors
    /// are erased again in the new one.
    fn relocate_transfer(&mut self, virtual_unit: u32) -> Result<()> {
        let failed = self.transfer;

        let fresh = loop {
            let fresh = self.next_erased_unit()?.ok_or(FtlError::NoFreeUnit)?;
            match self.copy_sectors(failed, fresh, virtual_unit, SectorState::Moved) {
                Ok(()) => break fresh,
                Err(FtlError::WriteFault { .. }) => self.retire_unit(fresh),
                Err(e) => return Err(e),
            }
        };

        warn!(old = failed, new = fresh, "retiring failed transfer unit");
        self.retire_unit(failed);
        self.transfer = fresh;

        if let Replacement::Replacing { sectors, .. } = &mut self.replacement {
            for state in sectors.iter_mut() {
                if *state == SectorState::DeletedInTransfer {
                    *state = SectorState::DeletedInPlace;
                }
            }
        }
        Ok(())
    }

    /// Take up a replacement that was cut short by power loss, as found by the mount scan
    pub(super) fn resume_replacement(&mut self, interrupted: &Interrupted) -> Result<()> {
        let unit = interrupted.replaced.unit;
        self.transfer = interrupted.transfer.unit;

        let slots = interrupted
            .replaced
            .slots
            .iter()
            .zip(&interrupted.transfer.slots);

        let mut spoiled = false;
        let mut sectors = Vec::with_capacity(self.geometry.sectors_per_unit as usize);
        for (index, pair) in (0..).zip(slots) {
            let state = match pair {
                (Slot::Erased, _) => SectorState::Erased,
                (Slot::Live, Slot::Erased) => SectorState::Allocated,
                (Slot::Live, Slot::Live) => {
                    // Already copied by the unfinished consolidation; both copies are equal
                    self.delete_in_place(unit, index)?;
                    SectorState::Moved
                }
                (Slot::Live, Slot::Dead) => {
                    spoiled = true;
                    SectorState::Allocated
                }
                (Slot::Dead, Slot::Erased) => SectorState::DeletedInPlace,
                (Slot::Dead, Slot::Live) => SectorState::Moved,
                (Slot::Dead, Slot::Dead) => SectorState::DeletedInTransfer,
            };
            sectors.push(state);
        }

        warn!(
            unit,
            transfer = self.transfer,
            virtual_unit = interrupted.virtual_unit,
            "resuming interrupted replacement"
        );
        self.replacement = Replacement::Replacing { unit, sectors };

        if spoiled {
            self.relocate_transfer(interrupted.virtual_unit)?;
        }
        Ok(())
    }

    /// Abandon a replacement in which nothing live remains, freeing the replaced unit
    fn cancel_replacement(&mut self) -> Result<()> {
        let Replacement::Replacing { unit, sectors } = std::mem::take(&mut self.replacement) else {
            return Ok(());
        };

        if sectors.iter().any(|s| s.uses_transfer()) {
            let transfer = self.transfer;
            if !self.erase_unit(transfer)? {
                self.replace_transfer()?;
            }
        }

        if let Some(virtual_unit) = self.map.owner(unit) {
            self.map.clear(virtual_unit);
        }
        self.units.mark_free(unit);

        debug!(unit, "cancelled replacement");
        Ok(())
    }

    /// Delete `count` logical sectors beginning at `sector`
    pub fn delete_sectors(&mut self, sector: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.check_range(sector, count)?;

        for sector in sector..sector + count {
            if self.cache.sector == Some(sector) {
                self.invalidate_cache();
            }
            self.delete_sector(sector)?;
        }

        Ok(())
    }

    fn delete_sector(&mut self, sector: u64) -> Result<()> {
        let (virtual_unit, index) = self.geometry.split(sector);
        let Some(unit) = self.map.get(virtual_unit) else {
            return Ok(());
        };

        if let Some(state) = self.replacement.entry(unit, index) {
            match state {
                SectorState::Allocated => {
                    self.delete_in_place(unit, index)?;
                    self.replacement.set(index, SectorState::DeletedInPlace);
                }
                SectorState::Moved => {
                    let transfer = self.transfer;
                    self.delete_in_place(transfer, index)?;
                    self.replacement.set(index, SectorState::DeletedInTransfer);
                }
                _ => return Ok(()),
            }

            if self.replacement.is_dead() {
                self.cancel_replacement()?;
            }
            return Ok(());
        }

        if self.units.is_erased(unit, index) || !self.read_spare(unit, index)?.is_live() {
            return Ok(());
        }

        if self.delete_in_place(unit, index)? >= self.geometry.sectors_per_unit {
            debug!(unit, virtual_unit, "unit emptied");
            self.units.mark_free(unit);
            self.map.clear(virtual_unit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ftl::test_util::{formatted, pattern};
    use crate::nand::SimNand;

    /// Write sectors `0..16` (all of virtual unit 0) with distinct patterns
    fn filled() -> anyhow::Result<Volume<SimNand>> {
        let mut volume = Volume::mount(formatted()?)?;
        volume.begin_operation();
        for sector in 0..16 {
            volume.write_sector(sector, &pattern(sector as u8))?;
        }
        volume.end_operation()?;
        Ok(volume)
    }

    #[test]
    fn test_replacement_scenario() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;
        let first_transfer = volume.transfer_unit();

        volume.begin_operation();
        for sector in 0..16 {
            volume.write_sector(sector, &pattern(sector as u8))?;
        }
        let original = volume.virtual_unit(0).unwrap();
        assert_eq!(volume.unit_status(original), UnitStatus::Available);
        assert_eq!(volume.unassigned(original), 0);

        volume.write_sector(3, &pattern(0xA3))?;
        assert_eq!(volume.replaced_unit(), Some(original));
        assert_eq!(
            volume.map_sector(3)?,
            Some(volume.geometry.sector_offset(first_transfer, 3))
        );
        assert_eq!(volume.read_sector(5)?, Some(&pattern(5)[..]));

        volume.nand.reset_stats();
        volume.end_operation()?;

        // Sectors 0..3 and 4..16 were copied; the old unit was erased to become the transfer unit
        assert_eq!(volume.nand.stats().data_programs, 15);
        assert_eq!(volume.nand.stats().erases, 1);
        assert_eq!(volume.replaced_unit(), None);
        assert_eq!(volume.virtual_unit(0), Some(first_transfer));
        assert_eq!(volume.transfer_unit(), original);
        assert_eq!(volume.unit_status(original), UnitStatus::Erased);

        assert_eq!(volume.read_sector(3)?, Some(&pattern(0xA3)[..]));
        assert_eq!(volume.read_sector(5)?, Some(&pattern(5)[..]));
        Ok(())
    }

    #[test]
    fn test_replacement_transparency() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;

        volume.begin_operation();
        volume.write_sector(16, &pattern(1))?;
        volume.write_sector(17, &pattern(2))?;
        volume.write_sector(20, &pattern(3))?;
        volume.end_operation()?;

        volume.begin_operation();
        volume.write_sector(17, &pattern(4))?;
        // Still erased in the replaced unit, so written in place
        volume.write_sector(18, &pattern(5))?;
        assert_eq!(volume.read_sector(16)?, Some(&pattern(1)[..]));
        assert_eq!(volume.read_sector(20)?, Some(&pattern(3)[..]));
        volume.end_operation()?;

        let expected = [(16, 1), (17, 4), (18, 5), (20, 3)];
        for (sector, seed) in expected {
            assert_eq!(volume.read_sector(sector)?, Some(&pattern(seed)[..]));
        }
        assert_eq!(volume.read_sector(19)?, None);
        Ok(())
    }

    #[test]
    fn test_rewrite_within_operation() -> anyhow::Result<()> {
        let mut volume = filled()?;

        volume.begin_operation();
        for seed in 0..3 {
            volume.write_sector(7, &pattern(0x70 + seed))?;
            assert_eq!(volume.read_sector(7)?, Some(&pattern(0x70 + seed)[..]));
        }
        volume.end_operation()?;

        assert_eq!(volume.read_sector(7)?, Some(&pattern(0x72)[..]));
        for sector in (0..16).filter(|&s| s != 7) {
            assert_eq!(volume.read_sector(sector)?, Some(&pattern(sector as u8)[..]));
        }
        Ok(())
    }

    #[test]
    fn test_second_unit_finishes_first_replacement() -> anyhow::Result<()> {
        let mut volume = filled()?;
        volume.write_sector(16, &pattern(0x10))?;
        volume.write_sector(17, &pattern(0x11))?;

        volume.begin_operation();
        volume.write_sector(2, &pattern(0x22))?;
        let first = volume.replaced_unit();
        volume.write_sector(17, &pattern(0x33))?;
        assert_ne!(volume.replaced_unit(), first);
        volume.end_operation()?;

        assert_eq!(volume.read_sector(2)?, Some(&pattern(0x22)[..]));
        assert_eq!(volume.read_sector(3)?, Some(&pattern(3)[..]));
        assert_eq!(volume.read_sector(16)?, Some(&pattern(0x10)[..]));
        assert_eq!(volume.read_sector(17)?, Some(&pattern(0x33)[..]));
        Ok(())
    }

    #[test]
    fn test_idempotent_delete() -> anyhow::Result<()> {
        let mut volume = filled()?;
        let unit = volume.virtual_unit(0).unwrap();

        volume.delete_sectors(4, 1)?;
        assert_eq!(volume.unassigned(unit), 1);
        assert_eq!(volume.read_sector(4)?, None);

        volume.delete_sectors(4, 1)?;
        assert_eq!(volume.unassigned(unit), 1);

        // Never written at all
        volume.delete_sectors(100, 3)?;
        assert!(matches!(
            volume.delete_sectors(volume.sector_count() - 1, 2),
            Err(FtlError::SectorOutOfRange { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unit_reclamation() -> anyhow::Result<()> {
        let mut volume = filled()?;
        let unit = volume.virtual_unit(0).unwrap();

        volume.delete_sectors(0, 16)?;
        assert_eq!(volume.unit_status(unit), UnitStatus::Free);
        assert_eq!(volume.virtual_unit(0), None);
        assert_eq!(volume.read_sector(0)?, None);

        // Make the freed unit the only candidate
        for other in 0..volume.geometry.units {
            if other != unit && volume.unit_status(other) == UnitStatus::Erased {
                volume.units.set_status(other, UnitStatus::Available);
            }
        }
        volume.units.set_status(volume.transfer, UnitStatus::Erased);

        volume.nand.reset_stats();
        assert_eq!(volume.allocate_unit()?, unit);
        assert_eq!(volume.nand.stats().erases, 1);
        Ok(())
    }

    #[test]
    fn test_early_cancel() -> anyhow::Result<()> {
        let mut volume = filled()?;
        let unit = volume.virtual_unit(0).unwrap();
        let transfer = volume.transfer_unit();

        volume.begin_operation();
        volume.write_sector(3, &pattern(0x33))?;
        assert_eq!(volume.replaced_unit(), Some(unit));

        volume.nand.reset_stats();
        volume.delete_sectors(0, 16)?;
        assert_eq!(volume.replaced_unit(), None);
        volume.end_operation()?;

        // No payload was copied; only the dirtied transfer unit was erased
        let stats = volume.nand.stats();
        assert_eq!(stats.data_programs, 0);
        assert_eq!(stats.erases, 1);

        assert_eq!(volume.transfer_unit(), transfer);
        assert_eq!(volume.unit_status(transfer), UnitStatus::Erased);
        assert_eq!(volume.unit_status(unit), UnitStatus::Free);
        assert_eq!(volume.virtual_unit(0), None);

        volume.write_sector(0, &pattern(9))?;
        assert_eq!(volume.read_sector(0)?, Some(&pattern(9)[..]));
        Ok(())
    }

    #[test]
    fn test_cancel_after_rewriting_deleted_sector() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;
        volume.write_sector(0, &pattern(1))?;
        volume.write_sector(1, &pattern(2))?;
        volume.delete_sectors(1, 1)?;
        let unit = volume.virtual_unit(0).unwrap();
        assert_eq!(volume.unassigned(unit), 15);

        // Sector 1 is dead in place, so writing it again goes to the transfer slot
        volume.begin_operation();
        volume.write_sector(1, &pattern(3))?;
        assert_eq!(volume.replaced_unit(), Some(unit));
        assert_eq!(volume.read_sector(1)?, Some(&pattern(3)[..]));

        volume.nand.reset_stats();
        volume.delete_sectors(0, 2)?;
        assert_eq!(volume.replaced_unit(), None);
        volume.end_operation()?;

        assert_eq!(volume.nand.stats().erases, 1);
        assert_eq!(volume.nand.stats().data_programs, 0);
        assert_eq!(volume.read_sector(1)?, None);
        assert_eq!(volume.unit_status(unit), UnitStatus::Free);
        Ok(())
    }

    #[test]
    fn test_write_fault() -> anyhow::Result<()> {
        let mut volume = filled()?;
        let transfer = volume.transfer_unit();
        let offset = volume.geometry.sector_offset(transfer, 6);
        volume.nand.inject_program_fault(offset);

        volume.begin_operation();
        let err = volume.write_sector(6, &pattern(0x66)).unwrap_err();
        assert!(matches!(err, FtlError::WriteFault { offset: o } if o == offset));
        assert_eq!(volume.read_sector(6)?, None);
        volume.end_operation()?;

        // The failed slot was marked deleted, and the rest of the unit survived
        let spare = volume.read_spare(transfer, 6)?;
        assert!(!spare.is_live());
        assert_eq!(volume.virtual_unit(0), Some(transfer));
        assert_eq!(volume.read_sector(6)?, None);
        assert_eq!(volume.read_sector(7)?, Some(&pattern(7)[..]));
        Ok(())
    }

    #[test]
    fn test_copy_fault_moves_transfer_unit() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;
        for sector in [0, 1, 16, 17] {
            volume.write_sector(sector, &pattern(sector as u8))?;
        }
        let transfer = volume.transfer_unit();
        let offset = volume.geometry.sector_offset(transfer, 1);
        volume.nand.inject_program_fault(offset);

        // Sector 0 moves fine; copying sector 1 during consolidation fails
        volume.begin_operation();
        volume.write_sector(0, &pattern(0xA0))?;
        volume.end_operation()?;

        assert_eq!(volume.replaced_unit(), None);
        assert_eq!(volume.unit_status(transfer), UnitStatus::Bad);
        assert_ne!(volume.transfer_unit(), transfer);
        assert_eq!(volume.read_sector(0)?, Some(&pattern(0xA0)[..]));
        assert_eq!(volume.read_sector(1)?, Some(&pattern(1)[..]));

        // Other virtual units still go through replacement normally
        volume.begin_operation();
        volume.write_sector(16, &pattern(0xB0))?;
        volume.end_operation()?;

        let mut volume = Volume::mount(volume.dismount()?)?;
        assert_eq!(volume.unit_status(transfer), UnitStatus::Bad);
        for (sector, seed) in [(0, 0xA0), (1, 1), (16, 0xB0), (17, 17)] {
            assert_eq!(volume.read_sector(sector)?, Some(&pattern(seed)[..]));
        }
        Ok(())
    }

    #[test]
    fn test_record_fallback() -> anyhow::Result<()> {
        let mut volume = filled()?;
        let unit = volume.virtual_unit(0).unwrap();

        // Break the first address record of the unit's first sector
        let offset = volume.geometry.unit_offset(unit);
        volume.nand.corrupt(offset, 6, Region::Spare, 0x01)?;
        assert_eq!(volume.read_spare(unit, 0)?.addresses(), [None, Some(0)]);

        let mut volume = Volume::mount(volume.dismount()?)?;
        assert_eq!(volume.virtual_unit(0), Some(unit));

        volume.begin_operation();
        volume.write_sector(3, &pattern(0x33))?;
        volume.end_operation()?;

        assert_ne!(volume.virtual_unit(0), Some(unit));
        assert_eq!(volume.read_sector(3)?, Some(&pattern(0x33)[..]));
        assert_eq!(volume.read_sector(0)?, Some(&pattern(0)[..]));
        Ok(())
    }

    #[test]
    fn test_inconsistent_replacement() -> anyhow::Result<()> {
        let mut volume = filled()?;
        let unit = volume.virtual_unit(0).unwrap();

        volume.begin_operation();
        volume.write_sector(3, &pattern(0x33))?;

        // Neither record of sector 0 names the unit's virtual unit anymore
        volume.map.clear(0);
        volume.map.set(1, unit);
        assert!(matches!(
            volume.end_operation(),
            Err(FtlError::InconsistentReplacement { unit: u }) if u == unit
        ));
        assert_eq!(volume.replaced_unit(), Some(unit));
        Ok(())
    }
}
