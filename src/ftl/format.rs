//! Writing a fresh, empty volume onto a card.

use tracing::{info, warn};

use super::boot::{check_layout, BootRecord};
use super::ecc::{self, ECC_BLOCK};
use super::mount::find_boot_record;
use super::spare::{self, SpareArea, MAX_VIRTUAL_UNITS};
use super::{FtlError, Result, SECTOR_SIZE};
use crate::nand::{EraseFault, Nand, NandLayout, Region};

/// Knobs for [format]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FormatOptions {
    /// Share of the card's units (in percent, at least one unit) kept out of the volume, so that
    /// units going bad later don't exhaust it
    pub reserve_percent: u8,

    /// Erase and rewrite the card even when it already carries a matching format
    pub force: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            reserve_percent: 2,
            force: false,
        }
    }
}

/// What [format] found and did
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FormatReport {
    pub boot_unit: u32,
    pub bad_units: Vec<u32>,
    pub virtual_units: u32,

    /// Whether the card was erased and rewritten; `false` means an existing format was kept
    pub erased: bool,
}

/// Number of virtual units a card can offer
fn virtual_unit_count(units: u32, bad: u32, reserve_percent: u8) -> Result<u32> {
    let reserve = (u64::from(units) * u64::from(reserve_percent) / 100).max(1) as u32;

    // Besides the bad units and the reserve: the boot unit, and the transfer unit
    units
        .checked_sub(bad + 2 + reserve)
        .filter(|&count| count > 0)
        .map(|count| count.min(MAX_VIRTUAL_UNITS))
        .ok_or_else(|| {
            FtlError::BadFormat(format!(
                "{units} units, {bad} of them bad, leave no room for data"
            ))
        })
}

fn unit_offset(layout: NandLayout, unit: u32) -> u64 {
    u64::from(unit) * layout.block_size()
}

/// Report on the format already present, if it's valid and matches what would be written
fn existing_format<N: Nand>(
    nand: &N,
    options: &FormatOptions,
    bad_units: &[u32],
) -> Result<Option<FormatReport>> {
    let layout = nand.get_layout();
    let (boot_unit, record) = match find_boot_record(nand) {
        Ok(found) => found,
        Err(FtlError::BadFormat(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    if record.geometry(layout, boot_unit).is_err() {
        return Ok(None);
    }

    let wanted = virtual_unit_count(layout.blocks, bad_units.len() as u32, options.reserve_percent);
    if wanted.ok() != Some(u32::from(record.virtual_units)) {
        return Ok(None);
    }

    Ok(Some(FormatReport {
        boot_unit,
        bad_units: bad_units.to_vec(),
        virtual_units: u32::from(record.virtual_units),
        erased: false,
    }))
}

/// Format a card: erase every good unit and write a boot record describing an empty volume.
///
/// Unless `options.force` is set, a card that already carries a valid format with the same
/// geometry is left alone (and its data kept).
pub fn format<N: Nand>(nand: &mut N, options: &FormatOptions) -> Result<FormatReport> {
    let layout = nand.get_layout();
    check_layout(layout).map_err(FtlError::BadFormat)?;

    let mut bad_units = Vec::new();
    for unit in 0..layout.blocks {
        if spare::unit_is_bad(&*nand, unit_offset(layout, unit))? {
            bad_units.push(unit);
        }
    }

    if !options.force {
        if let Some(report) = existing_format(&*nand, options, &bad_units)? {
            info!(virtual_units = report.virtual_units, "keeping existing format");
            return Ok(report);
        }
    }

    let rpt = howudoin::new()
        .label("Erasing units")
        .set_len(u64::from(layout.blocks));

    for unit in 0..layout.blocks {
        rpt.inc();
        if bad_units.contains(&unit) {
            continue;
        }

        match nand.erase(unit, 1) {
            Ok(()) => {}
            Err(e) if e.downcast_ref::<EraseFault>().is_some() => {
                warn!(unit, "erase failed, marking unit bad");
                spare::mark_unit_bad(nand, unit_offset(layout, unit))?;
                bad_units.push(unit);
            }
            Err(e) => return Err(e.into()),
        }
    }

    rpt.close();
    bad_units.sort_unstable();

    let boot_unit = (0..layout.blocks)
        .find(|unit| !bad_units.contains(unit))
        .ok_or_else(|| FtlError::BadFormat("every unit is bad".into()))?;
    let virtual_units =
        virtual_unit_count(layout.blocks, bad_units.len() as u32, options.reserve_percent)?;

    // Both copies of the record carry zeroed address fields, like a SmartMedia CIS
    let sector = BootRecord::new(layout, virtual_units as u16).to_sector()?;
    let (first, second) = sector.split_at(ECC_BLOCK);
    let spare = SpareArea {
        address1: 0,
        address2: 0,
        ..SpareArea::with_ecc(ecc::encode(first), ecc::encode(second))
    }
    .to_array()?;

    for index in 0..2 {
        let offset = unit_offset(layout, boot_unit) + index * SECTOR_SIZE as u64;
        nand.program(offset, &sector, Region::Data)?;
        nand.program(offset, &spare, Region::Spare)?;
    }

    info!(
        boot_unit,
        virtual_units,
        bad = bad_units.len(),
        "formatted card"
    );

    Ok(FormatReport {
        boot_unit,
        bad_units,
        virtual_units,
        erased: true,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ftl::test_util::{formatted, pattern, LAYOUT};
    use crate::ftl::units::UnitStatus;
    use crate::ftl::Volume;
    use crate::nand::SimNand;

    #[test]
    fn test_format_fresh() -> anyhow::Result<()> {
        let mut nand = SimNand::new(LAYOUT);
        let report = format(&mut nand, &FormatOptions::default())?;
        assert_eq!(
            report,
            FormatReport {
                boot_unit: 0,
                bad_units: vec![],
                virtual_units: 61,
                erased: true,
            }
        );

        let volume = Volume::mount(nand)?;
        assert_eq!(volume.sector_count(), 61 * 16);
        assert_eq!(volume.transfer_unit(), 1);
        assert!((1..64).all(|u| volume.unit_status(u) == UnitStatus::Erased));
        Ok(())
    }

    #[test]
    fn test_format_bad_units() -> anyhow::Result<()> {
        let mut nand = SimNand::new(LAYOUT);
        spare::mark_unit_bad(&mut nand, 0)?;
        spare::mark_unit_bad(&mut nand, unit_offset(LAYOUT, 9))?;
        nand.inject_erase_fault(20);

        let options = FormatOptions {
            reserve_percent: 10,
            ..Default::default()
        };
        let report = format(&mut nand, &options)?;
        assert_eq!(report.boot_unit, 1);
        assert_eq!(report.bad_units, vec![0, 9, 20]);
        assert_eq!(report.virtual_units, 64 - 3 - 2 - 6);

        let volume = Volume::mount(nand)?;
        assert_eq!(volume.geometry().boot_unit, 1);
        assert_eq!(volume.transfer_unit(), 2);
        for unit in [0, 9, 20] {
            assert_eq!(volume.unit_status(unit), UnitStatus::Bad);
        }
        Ok(())
    }

    #[test]
    fn test_format_keeps_matching_format() -> anyhow::Result<()> {
        let mut volume = Volume::mount(formatted()?)?;
        volume.write_sector(7, &pattern(7))?;
        let mut nand = volume.dismount()?;

        nand.reset_stats();
        let report = format(&mut nand, &FormatOptions::default())?;
        assert!(!report.erased);
        assert_eq!(nand.stats().erases, 0);

        let mut volume = Volume::mount(nand)?;
        assert_eq!(volume.read_sector(7)?, Some(&pattern(7)[..]));
        let mut nand = volume.dismount()?;

        let force = FormatOptions {
            force: true,
            ..Default::default()
        };
        assert!(format(&mut nand, &force)?.erased);
        let mut volume = Volume::mount(nand)?;
        assert_eq!(volume.read_sector(7)?, None);
        Ok(())
    }

    #[test]
    fn test_format_too_small() {
        let mut nand = SimNand::new(NandLayout { blocks: 3, ..LAYOUT });
        let result = format(&mut nand, &FormatOptions::default());
        assert!(matches!(result, Err(FtlError::BadFormat(_))));
    }

    #[test]
    fn test_virtual_unit_cap() -> anyhow::Result<()> {
        assert_eq!(virtual_unit_count(4096, 0, 0)?, MAX_VIRTUAL_UNITS);
        assert_eq!(virtual_unit_count(100, 0, 0)?, 97);
        assert_eq!(virtual_unit_count(100, 3, 5)?, 90);
        Ok(())
    }
}
