//! In-memory tables rebuilt at mount: the per-physical-unit status table, and the map from
//! virtual units to the physical units holding them.

/// The states a physical unit may be in
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnitStatus {
    /// Holds nothing of value, but must be erased before use
    Free,

    /// Erased and ready to be written
    Erased,

    /// Assigned to a virtual unit (or reserved, like the boot unit)
    Available,

    /// Unusable
    Bad,
}

#[derive(Debug, Copy, Clone)]
struct Unit {
    status: UnitStatus,

    /// Sectors that are erased or deleted
    unassigned: u32,
}

/// The unit table: status and unassigned-sector count per physical unit, plus a bitmap of the
/// sectors known to still be erased.
#[derive(Debug, Clone)]
pub struct UnitTable {
    units: Vec<Unit>,
    erased: Vec<u64>,
    sectors_per_unit: u32,
}

impl UnitTable {
    /// A table of `count` units, all `Free`
    pub fn new(count: u32, sectors_per_unit: u32) -> Self {
        let unit = Unit {
            status: UnitStatus::Free,
            unassigned: sectors_per_unit,
        };
        let bits = count as usize * sectors_per_unit as usize;

        Self {
            units: vec![unit; count as usize],
            erased: vec![0; bits.div_ceil(64)],
            sectors_per_unit,
        }
    }

    pub fn len(&self) -> u32 {
        self.units.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn status(&self, unit: u32) -> UnitStatus {
        self.units[unit as usize].status
    }

    pub fn set_status(&mut self, unit: u32, status: UnitStatus) {
        self.units[unit as usize].status = status;
    }

    /// Sectors of `unit` that are erased or deleted
    pub fn unassigned(&self, unit: u32) -> u32 {
        self.units[unit as usize].unassigned
    }

    /// Does `unit` hold no live sector at all?
    pub fn is_vacant(&self, unit: u32) -> bool {
        self.unassigned(unit) >= self.sectors_per_unit
    }

    /// Number of units with the given status
    pub fn count(&self, status: UnitStatus) -> u32 {
        self.units.iter().filter(|u| u.status == status).count() as u32
    }

    fn bit(&self, unit: u32, index: u32) -> (usize, u64) {
        let bit = unit as usize * self.sectors_per_unit as usize + index as usize;
        (bit / 64, 1 << (bit % 64))
    }

    /// Is the sector known to still be erased?
    pub fn is_erased(&self, unit: u32, index: u32) -> bool {
        let (word, mask) = self.bit(unit, index);
        self.erased[word] & mask != 0
    }

    /// Record that the sector is no longer erased, without changing the unassigned count.
    ///
    /// Used when a sector goes straight from erased to deleted, as after a failed program.
    pub fn take_erased(&mut self, unit: u32, index: u32) -> bool {
        let (word, mask) = self.bit(unit, index);
        let was_erased = self.erased[word] & mask != 0;
        self.erased[word] &= !mask;
        was_erased
    }

    /// Record that an erased sector now holds live data
    pub fn write(&mut self, unit: u32, index: u32) {
        if self.take_erased(unit, index) {
            let unit = &mut self.units[unit as usize];
            unit.unassigned = unit.unassigned.saturating_sub(1);
        }
    }

    /// Record that a live sector was deleted; returns the new unassigned count
    pub fn delete(&mut self, unit: u32, index: u32) -> u32 {
        debug_assert!(!self.is_erased(unit, index));
        let unit = &mut self.units[unit as usize];
        unit.unassigned = (unit.unassigned + 1).min(self.sectors_per_unit);
        unit.unassigned
    }

    /// Record that `unit` was just erased
    pub fn mark_erased(&mut self, unit: u32) {
        self.fill_erased(unit, true);
        self.units[unit as usize] = Unit {
            status: UnitStatus::Erased,
            unassigned: self.sectors_per_unit,
        };
    }

    /// Record that `unit` holds nothing of value but hasn't been erased
    pub fn mark_free(&mut self, unit: u32) {
        self.fill_erased(unit, false);
        self.units[unit as usize] = Unit {
            status: UnitStatus::Free,
            unassigned: self.sectors_per_unit,
        };
    }

    pub fn mark_bad(&mut self, unit: u32) {
        self.fill_erased(unit, false);
        self.units[unit as usize] = Unit {
            status: UnitStatus::Bad,
            unassigned: 0,
        };
    }

    fn fill_erased(&mut self, unit: u32, erased: bool) {
        for index in 0..self.sectors_per_unit {
            let (word, mask) = self.bit(unit, index);
            if erased {
                self.erased[word] |= mask;
            } else {
                self.erased[word] &= !mask;
            }
        }
    }
}

/// The virtual map: which physical unit, if any, holds each virtual unit
#[derive(Debug, Clone)]
pub struct VirtualMap(Vec<Option<u32>>);

impl VirtualMap {
    pub fn new(virtual_units: u32) -> Self {
        Self(vec![None; virtual_units as usize])
    }

    pub fn get(&self, virtual_unit: u32) -> Option<u32> {
        self.0.get(virtual_unit as usize).copied().flatten()
    }

    pub fn set(&mut self, virtual_unit: u32, unit: u32) {
        self.0[virtual_unit as usize] = Some(unit);
    }

    pub fn clear(&mut self, virtual_unit: u32) {
        self.0[virtual_unit as usize] = None;
    }

    /// The virtual unit held by a physical unit
    pub fn owner(&self, unit: u32) -> Option<u32> {
        self.0
            .iter()
            .position(|&u| u == Some(unit))
            .map(|vu| vu as u32)
    }

    /// Number of virtual units that own a physical unit
    pub fn assigned(&self) -> u32 {
        self.0.iter().flatten().count() as u32
    }
}

#[test]
fn test_unit_accounting() {
    let mut table = UnitTable::new(4, 16);
    assert_eq!(table.count(UnitStatus::Free), 4);
    assert!(!table.is_erased(2, 0));

    table.mark_erased(2);
    assert_eq!(table.status(2), UnitStatus::Erased);
    assert!((0..16).all(|i| table.is_erased(2, i)));
    assert!(!table.is_erased(1, 15) && !table.is_erased(3, 0));

    table.set_status(2, UnitStatus::Available);
    table.write(2, 3);
    table.write(2, 4);
    assert_eq!(table.unassigned(2), 14);
    assert!(!table.is_erased(2, 3));

    // Rewriting the bookkeeping of a written sector doesn't double count
    table.write(2, 3);
    assert_eq!(table.unassigned(2), 14);

    // A failed program consumes the sector without assigning it
    assert!(table.take_erased(2, 5));
    assert_eq!(table.unassigned(2), 14);

    assert_eq!(table.delete(2, 3), 15);
    assert_eq!(table.delete(2, 4), 16);
    assert!(table.is_vacant(2));

    table.mark_bad(1);
    assert_eq!(table.count(UnitStatus::Bad), 1);
}

#[test]
fn test_virtual_map() {
    let mut map = VirtualMap::new(3);
    assert_eq!(map.get(0), None);
    assert_eq!(map.get(7), None);

    map.set(1, 9);
    assert_eq!(map.get(1), Some(9));
    assert_eq!(map.assigned(), 1);
    assert_eq!(map.owner(9), Some(1));
    assert_eq!(map.owner(2), None);

    map.clear(1);
    assert_eq!(map.get(1), None);
}
