//! The per-volume context, and the low-level sector operations shared by the rest of the layer.

use tracing::{debug, warn};

use super::boot::Geometry;
use super::ecc::{self, ECC_BLOCK};
use super::replace::Replacement;
use super::spare::{self, SpareArea};
use super::units::{UnitStatus, UnitTable, VirtualMap};
use super::{FtlError, Result, SECTOR_SIZE};
use crate::nand::{EraseFault, Nand, ProgramFault, Region};

/// The single-sector read cache
#[derive(Debug)]
pub(super) struct ReadCache {
    pub sector: Option<u64>,
    pub data: Vec<u8>,
}

impl Default for ReadCache {
    fn default() -> Self {
        Self {
            sector: None,
            data: vec![0; SECTOR_SIZE],
        }
    }
}

/// A mounted SSFDC volume
///
/// Owns the device along with every table rebuilt at mount, so any number of volumes (on
/// different devices) can be mounted side by side. Obtain one with [Volume::mount].
#[derive(Debug)]
pub struct Volume<N: Nand> {
    pub(super) nand: N,
    pub(super) geometry: Geometry,
    pub(super) units: UnitTable,
    pub(super) map: VirtualMap,

    /// The erased unit that receives rewritten sectors during a replacement
    pub(super) transfer: u32,

    /// Where the last allocation scan stopped
    pub(super) rover: u32,

    pub(super) replacement: Replacement,
    pub(super) cache: ReadCache,
    pub(super) in_operation: bool,
}

impl<N: Nand> Volume<N> {
    pub(super) fn new(nand: N, geometry: Geometry, units: UnitTable, map: VirtualMap) -> Self {
        Self {
            nand,
            geometry,
            units,
            map,
            transfer: geometry.boot_unit,
            rover: geometry.boot_unit,
            replacement: Replacement::Idle,
            cache: Default::default(),
            in_operation: false,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Logical sectors presented to the host
    pub fn sector_count(&self) -> u64 {
        self.geometry.sector_count()
    }

    pub fn unit_status(&self, unit: u32) -> UnitStatus {
        self.units.status(unit)
    }

    /// Erased plus deleted sectors of a physical unit
    pub fn unassigned(&self, unit: u32) -> u32 {
        self.units.unassigned(unit)
    }

    pub fn transfer_unit(&self) -> u32 {
        self.transfer
    }

    /// The unit currently being replaced, if any
    pub fn replaced_unit(&self) -> Option<u32> {
        self.replacement.unit()
    }

    /// The physical unit holding a virtual unit, if any
    pub fn virtual_unit(&self, virtual_unit: u32) -> Option<u32> {
        self.map.get(virtual_unit)
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    /// Mark the start of one host operation
    pub fn begin_operation(&mut self) {
        if self.in_operation {
            warn!("operation begun while another is in progress");
        }
        self.in_operation = true;
    }

    /// Mark the end of one host operation, completing any pending replacement
    pub fn end_operation(&mut self) -> Result<()> {
        self.in_operation = false;
        self.finish_replacement()
    }

    /// Complete any pending replacement, and hand the device back
    pub fn dismount(mut self) -> Result<N> {
        self.finish_replacement()?;
        debug!("volume dismounted");
        Ok(self.nand)
    }

    /// Forget the cached sector; needed whenever the card is changed behind the volume's back
    pub fn invalidate_cache(&mut self) {
        self.cache.sector = None;
    }

    /// Check that `count` sectors beginning at `sector` lie within the volume
    pub(super) fn check_range(&self, sector: u64, count: u64) -> Result<()> {
        let total = self.sector_count();
        match sector.checked_add(count) {
            Some(end) if sector < total && end <= total => Ok(()),
            _ => Err(FtlError::SectorOutOfRange {
                sector,
                count: total,
            }),
        }
    }

    pub(super) fn read_spare(&self, unit: u32, index: u32) -> Result<SpareArea> {
        let offset = self.geometry.sector_offset(unit, index);
        let spares = spare::read_spares(&self.nand, offset, 1)?;
        Ok(spares[0])
    }

    /// Partially program the spare area of one sector
    pub(super) fn program_spare(&mut self, unit: u32, index: u32, spare: &SpareArea) -> Result<()> {
        let offset = self.geometry.sector_offset(unit, index);
        self.nand
            .program(offset, &spare.to_array()?, Region::Spare)?;
        Ok(())
    }

    /// Program an erased sector with data and spare content.
    ///
    /// If the device reports a program failure, the sector is marked deleted and counts as
    /// consumed, and [FtlError::WriteFault] is returned.
    pub(super) fn program_page(
        &mut self,
        unit: u32,
        index: u32,
        data: &[u8],
        spare: &SpareArea,
    ) -> Result<()> {
        let offset = self.geometry.sector_offset(unit, index);
        let spare_bytes = spare.to_array()?;

        let result = self
            .nand
            .program(offset, data, Region::Data)
            .and_then(|()| self.nand.program(offset, &spare_bytes, Region::Spare));

        match result {
            Ok(()) => {
                self.units.write(unit, index);
                Ok(())
            }
            Err(e) if e.downcast_ref::<ProgramFault>().is_some() => {
                warn!(unit, index, "program failed, invalidating sector");
                self.units.take_erased(unit, index);
                if let Err(e) = self.program_spare(unit, index, &SpareArea::deleted()) {
                    warn!(unit, index, "could not mark failed sector deleted: {e}");
                }
                Err(FtlError::WriteFault { offset })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Program a sector of host data, computing its ECC and recording the owning virtual unit
    pub(super) fn program_sector(
        &mut self,
        unit: u32,
        index: u32,
        virtual_unit: u32,
        data: &[u8],
    ) -> Result<()> {
        let (first, second) = data.split_at(ECC_BLOCK);
        let spare =
            SpareArea::with_ecc_and_address(ecc::encode(first), ecc::encode(second), virtual_unit);
        self.program_page(unit, index, data, &spare)
    }

    /// Mark a live sector deleted where it stands; returns the unit's new unassigned count
    pub(super) fn delete_in_place(&mut self, unit: u32, index: u32) -> Result<u32> {
        self.program_spare(unit, index, &SpareArea::deleted())?;
        Ok(self.units.delete(unit, index))
    }

    /// Erase a unit, leaving it `Erased`.
    ///
    /// Returns `false` if the device failed to erase it, in which case the unit has been retired
    /// as `Bad`, both in the table and on the card.
    pub(super) fn erase_unit(&mut self, unit: u32) -> Result<bool> {
        match self.nand.erase(unit, 1) {
            Ok(()) => {
                self.units.mark_erased(unit);
                Ok(true)
            }
            Err(e) if e.downcast_ref::<EraseFault>().is_some() => {
                warn!(unit, "erase failed, retiring unit");
                self.retire_unit(unit);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take a unit out of service for good, both in the table and on the card
    pub(super) fn retire_unit(&mut self, unit: u32) {
        let offset = self.geometry.unit_offset(unit);
        if let Err(e) = spare::mark_unit_bad(&mut self.nand, offset) {
            warn!(unit, "could not mark unit bad: {e}");
        }
        self.units.mark_bad(unit);
    }
}

/// The operations a translation layer offers to the host's block layer
///
/// This is object safe, so hosts can hold several kinds of layer behind `Box<dyn ...>`.
pub trait TranslationLayer {
    /// Logical sectors presented to the host
    fn sector_count(&self) -> u64;

    /// Read a sector; `None` means it has never been written, or was deleted
    fn read_sector(&mut self, sector: u64) -> Result<Option<&[u8]>>;

    fn write_sector(&mut self, sector: u64, data: &[u8]) -> Result<()>;

    /// Delete a contiguous run of sectors
    fn delete_sectors(&mut self, sector: u64, count: u64) -> Result<()>;

    fn begin_operation(&mut self);

    fn end_operation(&mut self) -> Result<()>;

    /// Pre-erase units until at least `minimum_free_sectors` are ready to write; returns the
    /// number that are
    fn defragment(&mut self, minimum_free_sectors: u64) -> Result<u64>;

    fn dismount(self: Box<Self>) -> Result<()>;
}

impl<N: Nand> TranslationLayer for Volume<N> {
    fn sector_count(&self) -> u64 {
        Volume::sector_count(self)
    }

    fn read_sector(&mut self, sector: u64) -> Result<Option<&[u8]>> {
        Volume::read_sector(self, sector)
    }

    fn write_sector(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        Volume::write_sector(self, sector, data)
    }

    fn delete_sectors(&mut self, sector: u64, count: u64) -> Result<()> {
        Volume::delete_sectors(self, sector, count)
    }

    fn begin_operation(&mut self) {
        Volume::begin_operation(self)
    }

    fn end_operation(&mut self) -> Result<()> {
        Volume::end_operation(self)
    }

    fn defragment(&mut self, minimum_free_sectors: u64) -> Result<u64> {
        Volume::defragment(self, minimum_free_sectors)
    }

    fn dismount(self: Box<Self>) -> Result<()> {
        Volume::dismount(*self).map(drop)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::ftl::test_util::{formatted, pattern};
    use crate::nand::SimNand;

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;

        volume.begin_operation();
        volume.write_sector(100, &pattern(1))?;
        assert_eq!(volume.read_sector(100)?, Some(&pattern(1)[..]));
        volume.end_operation()?;

        volume.begin_operation();
        assert_eq!(volume.read_sector(100)?, Some(&pattern(1)[..]));
        assert_eq!(volume.read_sector(101)?, None);
        volume.end_operation()?;

        // A payload indistinguishable from erased flash survives a remount too
        volume.begin_operation();
        volume.write_sector(101, &[0xFF; SECTOR_SIZE])?;
        volume.end_operation()?;
        let mut volume = Volume::mount(volume.dismount()?)?;
        assert_eq!(volume.read_sector(100)?, Some(&pattern(1)[..]));
        assert_eq!(volume.read_sector(101)?, Some(&[0xFF; SECTOR_SIZE][..]));

        assert!(matches!(
            volume.write_sector(100, &[0; 100]),
            Err(FtlError::InvalidLength(100))
        ));
        assert!(matches!(
            volume.write_sector(volume.sector_count(), &pattern(1)),
            Err(FtlError::SectorOutOfRange { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_dismount_finishes_replacement() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;
        volume.write_sector(0, &pattern(1))?;
        volume.write_sector(1, &pattern(2))?;

        volume.begin_operation();
        volume.write_sector(0, &pattern(3))?;
        assert!(volume.replaced_unit().is_some());

        let mut volume = Volume::mount(volume.dismount()?)?;
        assert_eq!(volume.read_sector(0)?, Some(&pattern(3)[..]));
        assert_eq!(volume.read_sector(1)?, Some(&pattern(2)[..]));
        Ok(())
    }

    #[test]
    fn test_trait_object() -> anyhow::Result<()> {
        let mut nand = formatted()?;
        let mut layer: Box<dyn TranslationLayer + '_> = Box::new(Volume::mount(&mut nand)?);

        layer.begin_operation();
        layer.write_sector(3, &pattern(3))?;
        layer.end_operation()?;
        assert_eq!(layer.read_sector(3)?, Some(&pattern(3)[..]));
        assert!(layer.defragment(16)? >= 16);
        layer.dismount()?;

        let mut volume = Volume::mount(nand)?;
        assert_eq!(volume.read_sector(3)?, Some(&pattern(3)[..]));
        Ok(())
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(u64, u8),
        Delete(u64, u64),
        EndOperation,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            6 => (0u64..80, any::<u8>()).prop_map(|(sector, seed)| Op::Write(sector, seed)),
            1 => (0u64..80).prop_map(|sector| Op::Write(sector, ERASED_SEED)),
            2 => (0u64..80, 1u64..20).prop_map(|(sector, count)| Op::Delete(sector, count)),
            1 => Just(Op::EndOperation),
        ]
    }

    /// Seed standing for a payload of all 0xFF
    const ERASED_SEED: u8 = 0xFF;

    fn payload(seed: u8) -> Vec<u8> {
        match seed {
            ERASED_SEED => vec![0xFF; SECTOR_SIZE],
            seed => pattern(seed),
        }
    }

    fn check(volume: &mut Volume<SimNand>, model: &HashMap<u64, u8>, sector: u64) {
        let expected = model.get(&sector).map(|&seed| payload(seed));
        let actual = volume.read_sector(sector).unwrap().map(<[u8]>::to_vec);
        assert_eq!(actual, expected, "sector {sector}");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_matches_model(ops in prop::collection::vec(op(), 1..150)) {
            let mut volume = Volume::mount(formatted().unwrap()).unwrap();
            let mut model = HashMap::new();

            volume.begin_operation();
            for op in ops {
                match op {
                    Op::Write(sector, seed) => {
                        volume.write_sector(sector, &payload(seed)).unwrap();
                        model.insert(sector, seed);
                        check(&mut volume, &model, sector);
                    }
                    Op::Delete(sector, count) => {
                        volume.delete_sectors(sector, count).unwrap();
                        for sector in sector..sector + count {
                            model.remove(&sector);
                        }
                        check(&mut volume, &model, sector);
                    }
                    Op::EndOperation => {
                        volume.end_operation().unwrap();
                        volume.begin_operation();
                    }
                }
            }
            volume.end_operation().unwrap();

            let mut volume = Volume::mount(volume.dismount().unwrap()).unwrap();
            for sector in 0..100 {
                check(&mut volume, &model, sector);
            }
        }
    }
}
