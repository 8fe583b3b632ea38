//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{EraseFault, Nand, NandLayout, ProgramFault, Region};

use anyhow::{bail, ensure, Context};
use nix::errno::Errno;

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line
                    .split(':')
                    .next()
                    .context("malformed /proc/mtd line")?;
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Ensure that an access lies within the device, returning the index of its first page
    fn check_access(&self, offset: u64, len: usize, region: Region) -> anyhow::Result<u64> {
        let page = self.layout.bytes_per_page as u64;
        let per_page = match region {
            Region::Data => page,
            Region::Spare => {
                ensure!(offset % page == 0, "spare access at unaligned offset {offset:#x}");
                self.layout.spare_per_page as u64
            }
        };

        let first = offset / page;
        let pages = (len as u64).div_ceil(per_page.max(1));
        ensure!(
            first + pages <= self.layout.pages(),
            "access {offset:#x}+{len} out of bounds"
        );
        Ok(first)
    }

    /// Run MEMREADOOB or MEMWRITEOOB over the spare areas of consecutive pages
    fn oob_transfer(&self, offset: u64, buf: *mut u8, len: usize, write: bool) -> anyhow::Result<()> {
        let page = self.layout.bytes_per_page as u64;
        let stride = self.layout.spare_per_page;
        let first = self.check_access(offset, len, Region::Spare)?;

        for (n, start) in (0..len).step_by(stride.max(1)).enumerate() {
            let mut oob = ioctl::mtd_oob_buf {
                start: u32::try_from((first + n as u64) * page)?,
                length: (len - start).min(stride) as u32,
                ptr: buf.wrapping_add(start),
            };

            let result = unsafe {
                if write {
                    ioctl::memwriteoob(self.file.as_raw_fd(), &mut oob)
                } else {
                    ioctl::memreadoob(self.file.as_raw_fd(), &mut oob)
                }
            };

            match result {
                Ok(_) => {}
                Err(Errno::EIO) if write => return Err(ProgramFault(u64::from(oob.start)).into()),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn is_bad(&self, block: u32) -> anyhow::Result<bool> {
        let block_base = u64::from(block) * self.layout.block_size();
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        Ok(bad != 0)
    }
}

impl Nand for MtdNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn read(&self, offset: u64, content: &mut [u8], region: Region) -> anyhow::Result<()> {
        match region {
            Region::Data => {
                self.check_access(offset, content.len(), region)?;
                Ok(self.file.read_exact_at(content, offset)?)
            }
            Region::Spare => self.oob_transfer(offset, content.as_mut_ptr(), content.len(), false),
        }
    }

    fn program(&mut self, offset: u64, content: &[u8], region: Region) -> anyhow::Result<()> {
        match region {
            Region::Data => {
                self.check_access(offset, content.len(), region)?;
                match self.file.write_all_at(content, offset) {
                    Ok(()) => Ok(()),
                    Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                        Err(ProgramFault(offset).into())
                    }
                    Err(e) if e.kind() == ErrorKind::WriteZero => Err(ProgramFault(offset).into()),
                    Err(e) => Err(e.into()),
                }
            }
            // The kernel only reads through the buffer for MEMWRITEOOB
            Region::Spare => {
                self.oob_transfer(offset, content.as_ptr().cast_mut(), content.len(), true)
            }
        }
    }

    fn erase(&mut self, first_block: u32, count: u32) -> anyhow::Result<()> {
        ensure!(
            first_block
                .checked_add(count)
                .map_or(false, |end| end <= self.layout.blocks),
            "blocks {first_block}+{count} out of range"
        );

        for block in first_block..first_block + count {
            if self.is_bad(block)? {
                return Err(EraseFault(block).into());
            }

            let erase_info = ioctl::erase_info_user {
                start: u32::try_from(u64::from(block) * self.layout.block_size())?,
                length: u32::try_from(self.layout.block_size())?,
            };
            match unsafe { ioctl::memerase(self.file.as_raw_fd(), &erase_info) } {
                Ok(_) => {}
                Err(Errno::EIO) => {
                    // Let the kernel's bad block table know too
                    let block_base = u64::from(erase_info.start);
                    unsafe { ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base)? };
                    return Err(EraseFault(block).into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<NandLayout> {
            ensure!(self.writesize > 0, "MTD device has no write size");
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let bytes_per_page = self.writesize as usize;
            let spare_per_page = self.oobsize as usize;

            Ok(NandLayout {
                blocks,
                pages_per_block,
                bytes_per_page,
                spare_per_page,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    #[repr(C)]
    pub struct mtd_oob_buf {
        pub start: u32,
        pub length: u32,
        pub ptr: *mut u8,
    }
    ioctl_readwrite!(memwriteoob, MTD_IOC_MAGIC, 3, mtd_oob_buf);
    ioctl_readwrite!(memreadoob, MTD_IOC_MAGIC, 4, mtd_oob_buf);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);
}
