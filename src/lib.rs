//! SSFDC (SmartMedia) flash translation layer: presents a NAND flash device as a linear array of
//! 512-byte sectors, with wear spreading and recovery of the sector map from the card itself.

pub mod ftl;
pub mod nand;
