//! A flash translation layer for SSFDC (SmartMedia) formatted NAND.
//!
//! The card is divided into erase units. Each unit that holds data carries the number of the
//! virtual unit it represents in the spare area of its sectors, so the mapping from the host's
//! logical sectors to physical sectors can be rebuilt by scanning the card at mount:
//!
//! ```text
//!  logical sector ──► virtual unit, index ──► physical unit (unit table) ──► physical sector
//!                                                  │
//!                                                  └─ under replacement? entry may point into
//!                                                     the transfer unit instead
//! ```
//!
//! NAND can't overwrite a sector in place, so rewriting a sector of a unit that already holds it
//! starts a *replacement*: the new data goes into the same index of the single spare "transfer"
//! unit. When the replacement ends, the remaining live sectors are copied across, the transfer
//! unit takes over the virtual unit, and the old unit is erased to become the next transfer unit.
//!
//! Host operations should be bracketed in [Volume::begin_operation] and
//! [Volume::end_operation], which is when pending replacements are completed.

mod alloc;
pub mod boot;
pub mod ecc;
mod error;
mod format;
mod mount;
mod replace;
pub mod spare;
#[cfg(test)]
mod test_util;
mod translate;
pub mod units;
mod volume;

pub use error::{FtlError, Result};
pub use format::{format, FormatOptions, FormatReport};
pub use volume::{TranslationLayer, Volume};

/// Bytes in one sector (and one NAND page)
pub const SECTOR_SIZE: usize = 512;
