//! Mounting: finding the boot record and rebuilding the unit table and virtual map from the card.

use tracing::{debug, info, warn};

use super::boot::{check_layout, BootRecord, Geometry};
use super::spare::{self, SpareArea};
use super::units::{UnitStatus, UnitTable, VirtualMap};
use super::volume::Volume;
use super::{FtlError, Result, SECTOR_SIZE};
use crate::nand::{Nand, PageUtil};

/// Locate the boot unit (the first unit not marked bad) and decode the record in its first or
/// second sector
pub(super) fn find_boot_record<N: Nand>(nand: &N) -> Result<(u32, BootRecord)> {
    let layout = nand.get_layout();

    for unit in 0..layout.blocks {
        let offset = u64::from(unit) * layout.block_size();
        if spare::unit_is_bad(nand, offset)? {
            continue;
        }

        for index in 0..2 {
            let sector = nand.map(offset + index * SECTOR_SIZE as u64, SECTOR_SIZE)?;
            if let Some(record) = BootRecord::decode(&sector) {
                return Ok((unit, record));
            }
        }

        return Err(FtlError::BadFormat(format!("no boot record in unit {unit}")));
    }

    Err(FtlError::BadFormat("every unit is marked bad".into()))
}

/// What the scan found in one sector of a unit carrying an address
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum Slot {
    Erased,
    Live,
    Dead,
}

/// A unit whose spare areas name a virtual unit
#[derive(Debug)]
pub(super) struct Claim {
    pub unit: u32,
    pub slots: Vec<Slot>,
}

impl Claim {
    fn has_live(&self) -> bool {
        self.slots.contains(&Slot::Live)
    }

    /// Could `transfer` hold rewrites of this unit's sectors? A sector only ever reaches the
    /// transfer unit once its slot here has been programmed.
    fn replaceable_by(&self, transfer: &Claim) -> bool {
        self.slots
            .iter()
            .zip(&transfer.slots)
            .all(|(&old, &new)| old != Slot::Erased || new == Slot::Erased)
    }

    /// Sectors still live here whose slot in `transfer` was used up by a failed program
    fn spoiled_in(&self, transfer: &Claim) -> usize {
        self.slots
            .iter()
            .zip(&transfer.slots)
            .filter(|&(&old, &new)| old == Slot::Live && new == Slot::Dead)
            .count()
    }
}

/// Two units claiming one virtual unit: a replacement that power loss left unfinished
#[derive(Debug)]
pub(super) struct Interrupted {
    pub virtual_unit: u32,
    pub replaced: Claim,
    pub transfer: Claim,
}

/// Record which sectors of a claiming unit are erased and which are in use
fn record_slots(units: &mut UnitTable, claim: &Claim) {
    units.mark_erased(claim.unit);
    for (index, slot) in (0..).zip(&claim.slots) {
        match slot {
            Slot::Erased => {}
            Slot::Live => units.write(claim.unit, index),
            Slot::Dead => {
                units.take_erased(claim.unit, index);
            }
        }
    }
}

/// Give a claiming unit its virtual unit
fn install(units: &mut UnitTable, map: &mut VirtualMap, claim: &Claim, virtual_unit: u32) {
    record_slots(units, claim);
    units.set_status(claim.unit, UnitStatus::Available);
    map.set(virtual_unit, claim.unit);
}

/// Classify every unit of the card, building the unit table and virtual map
fn scan_units<N: Nand>(
    nand: &N,
    geometry: &Geometry,
) -> Result<(UnitTable, VirtualMap, Option<Interrupted>)> {
    let per_unit = geometry.sectors_per_unit;
    let mut units = UnitTable::new(geometry.units, per_unit);
    let mut map = VirtualMap::new(geometry.virtual_units);
    let mut claims: Vec<Vec<Claim>> = (0..geometry.virtual_units).map(|_| Vec::new()).collect();

    let rpt = howudoin::new()
        .label("Scanning units")
        .set_len(u64::from(geometry.units));

    for unit in 0..geometry.units {
        rpt.inc();
        if unit == geometry.boot_unit {
            units.set_status(unit, UnitStatus::Available);
            continue;
        }

        let offset = geometry.unit_offset(unit);
        let spares = spare::read_spares(nand, offset, per_unit)?;
        if spares.iter().take(2).any(SpareArea::is_bad_block) {
            units.mark_bad(unit);
            continue;
        }

        let data = nand.map(offset, per_unit as usize * SECTOR_SIZE)?;
        let address = spares
            .iter()
            .find_map(|s| s.unit_address(geometry.virtual_units));

        let Some(virtual_unit) = address else {
            if data.is_erased() && spares.iter().all(|s| *s == SpareArea::ERASED) {
                units.mark_erased(unit);
            }
            continue;
        };

        let slots = spares
            .iter()
            .zip(data.chunks_exact(SECTOR_SIZE))
            .map(|(spare, sector)| {
                if !spare.is_live() {
                    Slot::Dead
                } else if spare.is_written() || !(sector.is_erased() && spare.ecc_erased()) {
                    Slot::Live
                } else {
                    Slot::Erased
                }
            })
            .collect();
        let claim = Claim { unit, slots };

        if claim.has_live() {
            claims[virtual_unit as usize].push(claim);
        } else {
            debug!(unit, virtual_unit, "no live sectors, freeing");
        }
    }

    rpt.close();

    let mut interrupted = None;
    for (virtual_unit, found) in (0..).zip(claims) {
        let mut found = found.into_iter();
        let Some(first) = found.next() else {
            continue;
        };
        let second = found.next();
        for extra in found {
            warn!(unit = extra.unit, virtual_unit, "third claim on virtual unit, freeing");
        }

        let Some(second) = second else {
            install(&mut units, &mut map, &first, virtual_unit);
            continue;
        };

        let forward = first.replaceable_by(&second);
        let backward = second.replaceable_by(&first);
        let (replaced, transfer) = match (forward, backward) {
            (true, true) if first.spoiled_in(&second) > second.spoiled_in(&first) => {
                (second, first)
            }
            (true, _) => (first, second),
            (false, true) => (second, first),
            (false, false) => {
                warn!(
                    unit = second.unit,
                    owner = first.unit,
                    virtual_unit,
                    "duplicate virtual unit, freeing"
                );
                install(&mut units, &mut map, &first, virtual_unit);
                continue;
            }
        };

        if interrupted.is_some() {
            warn!(
                unit = transfer.unit,
                owner = replaced.unit,
                virtual_unit,
                "second unfinished replacement, freeing"
            );
            install(&mut units, &mut map, &replaced, virtual_unit);
            continue;
        }

        // The transfer unit keeps the `Erased` status, as it would have before the power loss
        install(&mut units, &mut map, &replaced, virtual_unit);
        record_slots(&mut units, &transfer);

        interrupted = Some(Interrupted {
            virtual_unit,
            replaced,
            transfer,
        });
    }

    Ok((units, map, interrupted))
}

impl<N: Nand> Volume<N> {
    /// Mount the SSFDC volume on `nand`.
    ///
    /// Fails with [FtlError::BadFormat] if the card doesn't carry a usable boot record; in that
    /// case the device has been dropped, untouched.
    pub fn mount(nand: N) -> Result<Self> {
        let layout = nand.get_layout();
        check_layout(layout).map_err(FtlError::BadFormat)?;

        let (boot_unit, record) = find_boot_record(&nand)?;
        let geometry = record
            .geometry(layout, boot_unit)
            .map_err(FtlError::BadFormat)?;
        let (units, map, interrupted) = scan_units(&nand, &geometry)?;

        let mut volume = Self::new(nand, geometry, units, map);
        match interrupted {
            Some(interrupted) => volume.resume_replacement(&interrupted)?,
            None => volume.transfer = volume.first_transfer_unit()?,
        }
        volume.rover = volume.transfer;

        info!(
            units = geometry.units,
            virtual_units = geometry.virtual_units,
            assigned = volume.map.assigned(),
            bad = volume.units.count(UnitStatus::Bad),
            transfer = volume.transfer,
            "mounted volume"
        );
        Ok(volume)
    }

    /// The first unit that is, or can be made, erased
    fn first_transfer_unit(&mut self) -> Result<u32> {
        for unit in 0..self.geometry.units {
            if unit == self.geometry.boot_unit {
                continue;
            }

            let ready = match self.units.status(unit) {
                UnitStatus::Erased => true,
                UnitStatus::Free => self.erase_unit(unit)?,
                UnitStatus::Available | UnitStatus::Bad => false,
            };
            if ready {
                return Ok(unit);
            }
        }

        Err(FtlError::BadFormat("no unit left for transfers".into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ftl::ecc;
    use crate::ftl::test_util::{formatted, pattern, LAYOUT};
    use crate::nand::{NandLayout, Region, SimNand};

    #[test]
    fn test_mount_blank() {
        let result = Volume::mount(SimNand::new(LAYOUT));
        assert!(matches!(result, Err(FtlError::BadFormat(_))));
    }

    #[test]
    fn test_mount_bad_geometry() -> anyhow::Result<()> {
        let large_pages = NandLayout {
            bytes_per_page: 2048,
            spare_per_page: 64,
            ..LAYOUT
        };
        let result = Volume::mount(SimNand::new(large_pages));
        assert!(matches!(result, Err(FtlError::BadFormat(_))));

        // More virtual units than the card can hold
        let mut nand = SimNand::new(LAYOUT);
        let sector = BootRecord::new(LAYOUT, 63).to_sector()?;
        nand.program(0, &sector, Region::Data)?;
        let result = Volume::mount(nand);
        assert!(matches!(result, Err(FtlError::BadFormat(_))));
        Ok(())
    }

    #[test]
    fn test_mount_backup_record() -> anyhow::Result<()> {
        let mut nand = formatted()?;
        nand.corrupt(0, 0, Region::Data, 0xFF)?;

        let volume = Volume::mount(nand)?;
        assert_eq!(volume.geometry().boot_unit, 0);
        Ok(())
    }

    #[test]
    fn test_remount() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;

        volume.begin_operation();
        for sector in [0, 1, 2, 40, 41, 500] {
            volume.write_sector(sector, &pattern(sector as u8))?;
        }
        volume.delete_sectors(1, 1)?;
        volume.write_sector(40, &pattern(0xEE))?;
        volume.end_operation()?;

        let unit = volume.virtual_unit(0).unwrap();
        let counts: Vec<u32> = (0..LAYOUT.blocks).map(|u| volume.unassigned(u)).collect();
        let transfer = volume.transfer_unit();

        let mut volume = Volume::mount(volume.dismount()?)?;
        assert_eq!(volume.virtual_unit(0), Some(unit));
        assert_eq!(volume.transfer_unit(), transfer);
        for u in 0..LAYOUT.blocks {
            if volume.unit_status(u) == UnitStatus::Available && u != 0 {
                assert_eq!(volume.unassigned(u), counts[u as usize], "unit {u}");
            }
        }

        assert_eq!(volume.read_sector(0)?, Some(&pattern(0)[..]));
        assert_eq!(volume.read_sector(1)?, None);
        assert_eq!(volume.read_sector(40)?, Some(&pattern(0xEE)[..]));
        assert_eq!(volume.read_sector(500)?, Some(&pattern(500u64 as u8)[..]));

        // Sector 3 was never written, so it's still writable in place
        volume.write_sector(3, &pattern(3))?;
        assert_eq!(volume.replaced_unit(), None);
        Ok(())
    }

    #[test]
    fn test_mount_frees_dead_units() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;
        volume.write_sector(16, &pattern(1))?;
        volume.write_sector(17, &pattern(2))?;
        let unit = volume.virtual_unit(1).unwrap();
        volume.delete_sectors(16, 2)?;

        let volume = Volume::mount(volume.dismount()?)?;
        assert_eq!(volume.virtual_unit(1), None);
        assert_eq!(volume.unit_status(unit), UnitStatus::Free);
        Ok(())
    }

    #[test]
    fn test_duplicate_demoted() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;
        volume.write_sector(0, &pattern(1))?;
        let owner = volume.virtual_unit(0).unwrap();
        let mut nand = volume.dismount()?;

        // Forge a later unit claiming the same virtual unit, with a sector the owner never wrote,
        // so it can't be the transfer half of an unfinished replacement
        let impostor = 40;
        let offset = u64::from(impostor) * LAYOUT.block_size() + 5 * SECTOR_SIZE as u64;
        let data = pattern(2);
        let spare =
            SpareArea::with_ecc_and_address(ecc::encode(&data[..256]), ecc::encode(&data[256..]), 0);
        nand.program(offset, &data, Region::Data)?;
        nand.program(offset, &spare.to_array()?, Region::Spare)?;

        let mut volume = Volume::mount(nand)?;
        assert_eq!(volume.virtual_unit(0), Some(owner));
        assert_eq!(volume.unit_status(impostor), UnitStatus::Free);
        assert_eq!(volume.replaced_unit(), None);
        assert_eq!(volume.read_sector(0)?, Some(&pattern(1)[..]));
        assert_eq!(volume.read_sector(5)?, None);
        Ok(())
    }

    #[test]
    fn test_power_loss_during_replacement() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;
        volume.write_sector(0, &pattern(1))?;
        volume.write_sector(1, &pattern(2))?;

        volume.begin_operation();
        volume.write_sector(0, &pattern(3))?;
        let unit = volume.replaced_unit().unwrap();
        let transfer = volume.transfer_unit();

        // The card as it stands when power goes, before the operation ends
        let mut volume = Volume::mount(volume.nand().clone())?;
        assert_eq!(volume.replaced_unit(), Some(unit));
        assert_eq!(volume.transfer_unit(), transfer);
        assert_eq!(volume.virtual_unit(0), Some(unit));
        assert_eq!(volume.read_sector(0)?, Some(&pattern(3)[..]));
        assert_eq!(volume.read_sector(1)?, Some(&pattern(2)[..]));

        volume.end_operation()?;
        assert_eq!(volume.replaced_unit(), None);
        assert_eq!(volume.virtual_unit(0), Some(transfer));

        let mut volume = Volume::mount(volume.dismount()?)?;
        assert_eq!(volume.read_sector(0)?, Some(&pattern(3)[..]));
        assert_eq!(volume.read_sector(1)?, Some(&pattern(2)[..]));
        assert_eq!(volume.read_sector(2)?, None);
        Ok(())
    }

    #[test]
    fn test_power_loss_during_consolidation() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;
        volume.write_sector(0, &pattern(1))?;
        volume.write_sector(1, &pattern(2))?;

        volume.begin_operation();
        volume.write_sector(0, &pattern(3))?;
        let unit = volume.replaced_unit().unwrap();
        let transfer = volume.transfer_unit();
        let mut nand = volume.nand().clone();

        // Consolidation got as far as copying sector 1 into the transfer unit
        let from = volume.geometry.sector_offset(unit, 1);
        let to = volume.geometry.sector_offset(transfer, 1);
        let mut data = vec![0; SECTOR_SIZE];
        nand.read(from, &mut data, Region::Data)?;
        let old = volume.read_spare(unit, 1)?;
        let spare = SpareArea::with_ecc_and_address(old.ecc1, old.ecc2, 0);
        nand.program(to, &data, Region::Data)?;
        nand.program(to, &spare.to_array()?, Region::Spare)?;

        let mut volume = Volume::mount(nand)?;
        assert_eq!(volume.replaced_unit(), Some(unit));
        assert_eq!(volume.transfer_unit(), transfer);
        assert_eq!(volume.read_sector(0)?, Some(&pattern(3)[..]));
        assert_eq!(volume.read_sector(1)?, Some(&pattern(2)[..]));

        // Only one copy of sector 1 may stay live, or a later delete would resurrect the other
        volume.delete_sectors(1, 1)?;
        assert_eq!(volume.read_sector(1)?, None);

        volume.end_operation()?;
        let mut volume = Volume::mount(volume.dismount()?)?;
        assert_eq!(volume.read_sector(0)?, Some(&pattern(3)[..]));
        assert_eq!(volume.read_sector(1)?, None);
        Ok(())
    }
}
