use super::{format, FormatOptions, SECTOR_SIZE};
use crate::nand::{NandLayout, SimNand};

/// A small card: 64 units of 16 sectors
pub const LAYOUT: NandLayout = NandLayout {
    blocks: 64,
    pages_per_block: 16,
    bytes_per_page: SECTOR_SIZE,
    spare_per_page: 16,
};

/// A freshly formatted simulated card
pub fn formatted() -> anyhow::Result<SimNand> {
    let mut nand = SimNand::new(LAYOUT);
    format(&mut nand, &FormatOptions::default())?;
    Ok(nand)
}

/// Sector content that differs for every seed
pub fn pattern(seed: u8) -> Vec<u8> {
    (0..SECTOR_SIZE)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(i as u8 >> 3) ^ seed)
        .collect()
}
