//! Abstractions and code to access NAND flash, including the per-page spare ("OOB") area

use std::borrow::Cow;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::ops::Range;
use std::str::FromStr;

use anyhow::ensure;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// Which part of a page an access refers to
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Region {
    /// The main data area of each page
    Data,

    /// The small out-of-band area that follows each page
    ///
    /// Offsets are still given in data-area terms (page-aligned); the bytes accessed are the
    /// concatenated spare areas of consecutive pages starting at that page.
    Spare,
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub spare_per_page: usize,
}

impl NandLayout {
    /// Bytes of data area in one erase block
    pub fn block_size(&self) -> u64 {
        u64::from(self.pages_per_block) * self.bytes_per_page as u64
    }

    /// Bytes of data area in the whole device
    pub fn size(&self) -> u64 {
        self.block_size() * u64::from(self.blocks)
    }

    /// Total number of pages in the device
    pub fn pages(&self) -> u64 {
        u64::from(self.blocks) * u64::from(self.pages_per_block)
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES", optionally followed by "xSPARE".
///
/// When the spare size is omitted, the usual 1/32 ratio of small-page NAND is assumed.
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = s.split('x').collect();
        let (blocks, pages_per_block, bytes_per_page, spare) = match fields[..] {
            [b, p, s] => (b, p, s, None),
            [b, p, s, o] => (b, p, s, Some(o)),
            _ => anyhow::bail!("expected #x#x# or #x#x#x#"),
        };
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;
        let spare_per_page = match spare {
            Some(spare) => spare.parse()?,
            None => bytes_per_page / 32,
        };

        ensure!(blocks > 0 && pages_per_block > 0, "empty layout");
        ensure!(bytes_per_page > 0, "page size must be nonzero");

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            spare_per_page,
        })
    }
}

/// The device reported that a page failed to program.
///
/// Implementors of [Nand] return this (inside the `anyhow::Error`) so that callers can tell a
/// physical program failure apart from every other kind of error.
#[derive(Debug, thiserror::Error)]
#[error("program failure at offset {0:#x}")]
pub struct ProgramFault(pub u64);

/// The device reported that a block failed to erase.
#[derive(Debug, thiserror::Error)]
#[error("erase failure on block {0}")]
pub struct EraseFault(pub u32);

/// Represents a NAND flash device
///
/// All offsets are byte offsets into the data area of the device; spare-area accesses name the
/// page by the offset of its data.
pub trait Nand {
    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;

    /// Read `content.len()` bytes from the given region, beginning at `offset`
    fn read(&self, offset: u64, content: &mut [u8], region: Region) -> anyhow::Result<()>;

    /// Program the given content, beginning at `offset`
    ///
    /// Programming can only clear bits. A failure of the program operation itself is reported as
    /// a [ProgramFault].
    fn program(&mut self, offset: u64, content: &[u8], region: Region) -> anyhow::Result<()>;

    /// Erase `count` blocks beginning at `first_block`, making all their pages writable again
    fn erase(&mut self, first_block: u32, count: u32) -> anyhow::Result<()>;

    /// Get a read-only view of the data area, without copying where the device allows it
    fn map(&self, offset: u64, len: usize) -> anyhow::Result<Cow<'_, [u8]>> {
        let mut buf = vec![0; len];
        self.read(offset, &mut buf, Region::Data)?;
        Ok(Cow::Owned(buf))
    }
}

impl<T: Nand + ?Sized> Nand for &mut T {
    fn get_layout(&self) -> NandLayout {
        (**self).get_layout()
    }

    fn read(&self, offset: u64, content: &mut [u8], region: Region) -> anyhow::Result<()> {
        (**self).read(offset, content, region)
    }

    fn program(&mut self, offset: u64, content: &[u8], region: Region) -> anyhow::Result<()> {
        (**self).program(offset, content, region)
    }

    fn erase(&mut self, first_block: u32, count: u32) -> anyhow::Result<()> {
        (**self).erase(first_block, count)
    }

    fn map(&self, offset: u64, len: usize) -> anyhow::Result<Cow<'_, [u8]>> {
        (**self).map(offset, len)
    }
}

/// Counts of the mutating operations performed on a [SimNand]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SimStats {
    /// Program calls against the data area
    pub data_programs: u64,

    /// Program calls against the spare area
    pub spare_programs: u64,

    /// Blocks erased
    pub erases: u64,
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    /// Data area of every page, back to back
    data: Box<[u8]>,

    /// Spare area of every page, back to back
    spare: Box<[u8]>,

    layout: NandLayout,
    stats: SimStats,

    /// Page offsets whose data programs fail
    program_faults: HashSet<u64>,

    /// Blocks whose erases fail
    erase_faults: HashSet<u32>,
}

impl SimNand {
    /// Create an erased SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let pages = layout.pages() as usize;
        let data = vec![0xFF; pages * layout.bytes_per_page].into_boxed_slice();
        let spare = vec![0xFF; pages * layout.spare_per_page].into_boxed_slice();

        Self {
            data,
            spare,
            layout,
            stats: Default::default(),
            program_faults: Default::default(),
            erase_faults: Default::default(),
        }
    }

    /// Initialize the NAND contents from a stream of pages, each followed by its spare area (the
    /// layout produced by [SimNand::save], and by `nanddump --oob`).
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let (page, spare) = (self.layout.bytes_per_page, self.layout.spare_per_page);
        for index in 0..self.layout.pages() as usize {
            read.read_exact(&mut self.data[index * page..][..page])?;
            read.read_exact(&mut self.spare[index * spare..][..spare])?;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let (page, spare) = (self.layout.bytes_per_page, self.layout.spare_per_page);
        for index in 0..self.layout.pages() as usize {
            write.write_all(&self.data[index * page..][..page])?;
            write.write_all(&self.spare[index * spare..][..spare])?;
        }

        Ok(())
    }

    /// Operation counters accumulated since creation or the last [SimNand::reset_stats]
    pub fn stats(&self) -> SimStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Default::default();
    }

    /// Make every subsequent data program of the page containing `offset` fail
    pub fn inject_program_fault(&mut self, offset: u64) {
        let page = self.layout.bytes_per_page as u64;
        self.program_faults.insert(offset - offset % page);
    }

    /// Make every subsequent erase of `block` fail
    pub fn inject_erase_fault(&mut self, block: u32) {
        self.erase_faults.insert(block);
    }

    /// XOR byte `index` of the access starting at `offset` with `mask`, bypassing NAND
    /// programming rules (simulates bit rot)
    pub fn corrupt(
        &mut self,
        offset: u64,
        index: usize,
        region: Region,
        mask: u8,
    ) -> anyhow::Result<()> {
        let range = self.span(offset, index + 1, region)?;
        match region {
            Region::Data => self.data[range.end - 1] ^= mask,
            Region::Spare => self.spare[range.end - 1] ^= mask,
        }
        Ok(())
    }

    /// Validate an access and compute its byte range within `data` or `spare`
    fn span(&self, offset: u64, len: usize, region: Region) -> anyhow::Result<Range<usize>> {
        let start = match region {
            Region::Data => offset as usize,
            Region::Spare => {
                let page = self.layout.bytes_per_page as u64;
                ensure!(offset % page == 0, "spare access at unaligned offset {offset:#x}");
                (offset / page) as usize * self.layout.spare_per_page
            }
        };
        let limit = match region {
            Region::Data => self.data.len(),
            Region::Spare => self.spare.len(),
        };

        let end = start + len;
        ensure!(end <= limit, "access {offset:#x}+{len} out of bounds");
        Ok(start..end)
    }
}

impl Nand for SimNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn read(&self, offset: u64, content: &mut [u8], region: Region) -> anyhow::Result<()> {
        let range = self.span(offset, content.len(), region)?;
        match region {
            Region::Data => content.copy_from_slice(&self.data[range]),
            Region::Spare => content.copy_from_slice(&self.spare[range]),
        }
        Ok(())
    }

    fn program(&mut self, offset: u64, content: &[u8], region: Region) -> anyhow::Result<()> {
        let range = self.span(offset, content.len(), region)?;

        match region {
            Region::Data => {
                let page = self.layout.bytes_per_page as u64;
                let first = offset - offset % page;
                let last = offset + content.len().max(1) as u64 - 1;
                if let Some(&faulty) = self
                    .program_faults
                    .iter()
                    .find(|&&p| p >= first && p <= last)
                {
                    return Err(ProgramFault(faulty).into());
                }

                // Data that can't be reached by clearing bits means the caller tried to overwrite
                // programmed data, which real NAND would silently corrupt.
                let target = &mut self.data[range];
                ensure!(
                    target.iter().zip(content).all(|(&old, &new)| old & new == new),
                    "program at {offset:#x} would set already-cleared bits"
                );
                target.copy_from_slice(content);
                self.stats.data_programs += 1;
            }
            Region::Spare => {
                // Partial programming: 0xFF bytes leave the existing content alone.
                for (old, &new) in self.spare[range].iter_mut().zip(content) {
                    *old &= new;
                }
                self.stats.spare_programs += 1;
            }
        }

        Ok(())
    }

    fn erase(&mut self, first_block: u32, count: u32) -> anyhow::Result<()> {
        ensure!(
            first_block.checked_add(count).map_or(false, |end| end <= self.layout.blocks),
            "blocks {first_block}+{count} out of range"
        );

        let pages = self.layout.pages_per_block as usize;
        for block in first_block..first_block + count {
            if self.erase_faults.contains(&block) {
                return Err(EraseFault(block).into());
            }

            let first_page = block as usize * pages;
            let data = first_page * self.layout.bytes_per_page;
            let spare = first_page * self.layout.spare_per_page;
            self.data[data..][..pages * self.layout.bytes_per_page].fill(0xFF);
            self.spare[spare..][..pages * self.layout.spare_per_page].fill(0xFF);
            self.stats.erases += 1;
        }

        Ok(())
    }

    fn map(&self, offset: u64, len: usize) -> anyhow::Result<Cow<'_, [u8]>> {
        let range = self.span(offset, len, Region::Data)?;
        Ok(Cow::Borrowed(&self.data[range]))
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    spare_per_page: 8,
};

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: NandLayout = "1024x32x512".parse()?;
    assert_eq!(layout.spare_per_page, 16);
    assert_eq!(layout.block_size(), 16384);

    let layout: NandLayout = "8x16x256x8".parse()?;
    assert_eq!(layout, TEST_LAYOUT);

    assert!("8x16".parse::<NandLayout>().is_err());
    assert!("0x16x512".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = TEST_LAYOUT.bytes_per_page as u64;

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let mut data_out = data_in.clone();

    nand.program(2 * page, &data_in, Region::Data)?;

    nand.read(page, &mut data_out, Region::Data)?;
    assert!(data_out.is_erased());

    nand.read(2 * page, &mut data_out, Region::Data)?;
    assert_eq!(data_out, data_in);
    assert_eq!(&*nand.map(2 * page, 4)?, &[0xA5; 4]);

    // Reprogramming identical data is harmless; anything needing a 0 -> 1 transition is not
    nand.program(2 * page, &data_in, Region::Data)?;
    assert!(nand.program(2 * page, &[0xFF; 4], Region::Data).is_err());

    assert_eq!(nand.stats().data_programs, 2);
    Ok(())
}

#[test]
fn test_sim_spare_partial_program() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = TEST_LAYOUT.bytes_per_page as u64;

    nand.program(page, &[0xFF, 0x12, 0xFF, 0xFF], Region::Spare)?;
    nand.program(page, &[0x00, 0xFF, 0xFF, 0xFF], Region::Spare)?;

    let mut spare = [0u8; 8];
    nand.read(page, &mut spare, Region::Spare)?;
    assert_eq!(spare, [0x00, 0x12, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

    assert!(nand.read(page + 1, &mut spare, Region::Spare).is_err());

    nand.corrupt(page, 2, Region::Spare, 0x0F)?;
    nand.read(page, &mut spare, Region::Spare)?;
    assert_eq!(spare[2], 0xF0);
    Ok(())
}

#[test]
fn test_sim_erase_and_faults() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let block = TEST_LAYOUT.block_size();

    nand.program(block, &[0x00; 16], Region::Data)?;
    nand.program(block, &[0x00; 8], Region::Spare)?;
    nand.erase(1, 1)?;
    assert!(nand.map(block, 16)?.is_erased());
    assert_eq!(nand.stats().erases, 1);

    nand.inject_program_fault(block + 3);
    let err = nand.program(block, &[0x00; 16], Region::Data).unwrap_err();
    assert!(err.downcast_ref::<ProgramFault>().is_some());

    nand.inject_erase_fault(2);
    let err = nand.erase(0, 3).unwrap_err();
    assert!(err.downcast_ref::<EraseFault>().is_some());
    assert!(nand.erase(7, 2).is_err());
    Ok(())
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.program(0, &[0x55; 300], Region::Data)?;
    nand.program(256, &[0x11; 8], Region::Spare)?;

    let mut image = Vec::new();
    nand.save(&mut image)?;
    assert_eq!(image.len() as u64, TEST_LAYOUT.pages() * (256 + 8));

    let mut copy = SimNand::new(TEST_LAYOUT);
    copy.load(&mut &image[..])?;

    let mut spare = [0u8; 8];
    copy.read(256, &mut spare, Region::Spare)?;
    assert_eq!(spare, [0x11; 8]);
    assert_eq!(&*copy.map(0, 300)?, &[0x55; 300][..]);
    Ok(())
}
