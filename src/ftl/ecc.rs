//! The SmartMedia Hamming code protecting each 256-byte half of a sector.
//!
//! Every half gets three code bytes:
//!
//! ```text
//! byte 0:  P3  P3' P2  P2' P1  P1' P0  P0'    (line parity, byte address bits 0..3)
//! byte 1:  P7  P7' P6  P6' P5  P5' P4  P4'    (line parity, byte address bits 4..7)
//! byte 2:  CP5 CP4 CP3 CP2 CP1 CP0 1   1      (column parity, fixed marker bits)
//! ```
//!
//! `Pn` is the parity of every byte whose address has bit `n` set, `Pn'` of every byte whose
//! address has it clear. All parities are stored inverted, which makes the code of erased (all
//! 0xFF) data equal to erased code bytes.

/// Bytes covered by one code
pub const ECC_BLOCK: usize = 256;

/// Bytes in one code
pub const ECC_SIZE: usize = 3;

/// Derived parity for every byte value: bits 0..5 are the column parities CP0..CP5, bit 6 is the
/// parity of the whole byte.
const PARITY_TABLE: [u8; 256] = build_parity_table();

const fn parity(x: u8) -> u8 {
    (x.count_ones() & 1) as u8
}

const fn build_parity_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let b = i as u8;
        table[i] = parity(b & 0x55)
            | parity(b & 0xAA) << 1
            | parity(b & 0x33) << 2
            | parity(b & 0xCC) << 3
            | parity(b & 0x0F) << 4
            | parity(b & 0xF0) << 5
            | parity(b) << 6;
        i += 1;
    }
    table
}

/// Place the bits of `p` and `p_inv` side by side: bit `n` of `p` lands on bit `2n + 1`, bit `n`
/// of `p_inv` on bit `2n`.
fn interleave(p: u8, p_inv: u8) -> u16 {
    (0..8).fold(0u16, |word, n| {
        word | u16::from((p >> n) & 1) << (2 * n + 1) | u16::from((p_inv >> n) & 1) << (2 * n)
    })
}

/// Compute the code for a block of at most [ECC_BLOCK] bytes
pub fn encode(block: &[u8]) -> [u8; ECC_SIZE] {
    debug_assert!(block.len() <= ECC_BLOCK);

    let (mut columns, mut lines, mut lines_inv) = (0u8, 0u8, 0u8);
    for (address, &byte) in block.iter().enumerate() {
        let derived = PARITY_TABLE[byte as usize];
        columns ^= derived & 0x3F;
        if derived & 0x40 != 0 {
            lines ^= address as u8;
            lines_inv ^= !(address as u8);
        }
    }

    let [high, low] = interleave(lines, lines_inv).to_be_bytes();
    [!low, !high, (!columns << 2) | 0x03]
}

/// The outcome of checking a block against its stored code
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Correction {
    /// Data and code agree
    Clean,

    /// A single data bit was wrong and has been flipped back
    Data { byte: usize, bit: u8 },

    /// A single bit of the stored code was wrong; the data is intact
    Code,
}

/// The difference between data and code doesn't look like a single-bit error
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("uncorrectable ECC error")]
pub struct Uncorrectable;

/// Does every (P, P') pair selected by `mask` differ in exactly one bit?
fn pairs_split(diff: u8, mask: u8) -> bool {
    (diff ^ (diff >> 1)) & mask == mask
}

/// Check `block` against its stored code, repairing a single flipped bit in place
pub fn correct(block: &mut [u8], stored: [u8; ECC_SIZE]) -> Result<Correction, Uncorrectable> {
    let computed = encode(block);
    let diff: [u8; ECC_SIZE] = std::array::from_fn(|i| stored[i] ^ computed[i]);

    if diff == [0; ECC_SIZE] {
        return Ok(Correction::Clean);
    }

    if pairs_split(diff[0], 0x55) && pairs_split(diff[1], 0x55) && pairs_split(diff[2], 0x54) {
        // The P half of every line pair spells out the byte address
        let lines = u16::from_le_bytes([diff[0], diff[1]]);
        let byte = (0..8).fold(0usize, |byte, n| {
            byte | usize::from((lines >> (2 * n + 1)) & 1 != 0) << n
        });

        // CP1, CP3 and CP5 are set for odd bit numbers, bits 2/3/6/7, and bits 4..7 respectively
        let bit = (diff[2] >> 7 & 1) << 2 | (diff[2] >> 5 & 1) << 1 | (diff[2] >> 3 & 1);

        let target = block.get_mut(byte).ok_or(Uncorrectable)?;
        *target ^= 1 << bit;
        return Ok(Correction::Data { byte, bit });
    }

    if diff.iter().map(|d| d.count_ones()).sum::<u32>() == 1 {
        return Ok(Correction::Code);
    }

    Err(Uncorrectable)
}
