//! A tool for formatting and inspecting SSFDC volumes, on a real MTD device or a card image.
//!
//! Image cards are only written back after the command, including the final dismount, went
//! through without error.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;

#[cfg(target_os = "linux")]
use ssfdc_ftl::nand::mtd::MtdNand;
use ssfdc_ftl::{
    ftl::{
        format, spare::SPARE_SIZE, units::UnitStatus, FormatOptions, TranslationLayer, Volume,
        SECTOR_SIZE,
    },
    nand::{Nand, NandLayout, SimNand},
};

/// Capacities of the 512-byte-page SmartMedia cards, as (megabytes, blocks, pages per block)
const SMARTMEDIA_SIZES: [(u64, u32, u32); 6] = [
    (4, 512, 16),
    (8, 1024, 16),
    (16, 1024, 32),
    (32, 2048, 32),
    (64, 4096, 32),
    (128, 8192, 32),
];

/// The shape of a card image: a SmartMedia capacity like "16M", or a raw NAND layout
#[derive(Debug, Copy, Clone)]
struct CardSize(NandLayout);

impl CardSize {
    fn smartmedia(blocks: u32, pages_per_block: u32) -> Self {
        CardSize(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page: SECTOR_SIZE,
            spare_per_page: SPARE_SIZE,
        })
    }

    /// Recognize a SmartMedia card from the length of its image
    fn from_image_len(len: u64) -> Option<Self> {
        SMARTMEDIA_SIZES
            .iter()
            .map(|&(_, blocks, pages)| Self::smartmedia(blocks, pages))
            .find(|size| size.0.pages() * (SECTOR_SIZE + SPARE_SIZE) as u64 == len)
    }
}

impl FromStr for CardSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let megabytes = s.trim_end_matches(['B', 'b']).trim_end_matches(['M', 'm']);
        if let Ok(megabytes) = megabytes.parse::<u64>() {
            return SMARTMEDIA_SIZES
                .iter()
                .find(|&&(size, _, _)| size == megabytes)
                .map(|&(_, blocks, pages)| Self::smartmedia(blocks, pages))
                .ok_or_else(|| anyhow!("no {megabytes}MB SmartMedia card with 512-byte pages"));
        }

        Ok(CardSize(s.parse()?))
    }
}

#[derive(Args, Debug)]
#[group(required = true)]
struct CardOptions {
    /// MTD partition name, or the path of a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "card")]
    mtd: Option<String>,

    /// Card image (pages interleaved with their spare areas); created blank if missing
    #[clap(long, group = "card")]
    image: Option<PathBuf>,

    /// Card size, like 16M, or a layout as BLOCKSxPAGESxBYTES[xSPARE]; guessed from the image
    /// length when left out
    #[clap(long, requires = "image")]
    size: Option<CardSize>,

    /// Leave the image file as it was, even if the command changed the card
    #[clap(long, requires = "image")]
    dry_run: bool,
}

impl CardOptions {
    fn open(&self) -> Result<Card> {
        #[cfg(target_os = "linux")]
        {
            if let Some(mtd) = &self.mtd {
                let nand = if mtd.contains('/') {
                    MtdNand::open(mtd)?
                } else {
                    MtdNand::open_named(mtd)?
                };
                return Ok(Card::Mtd(nand));
            }
        }

        let path = self.image.clone().context("no card given")?;
        let existing = match File::open(&path) {
            Ok(file) => Some(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
        };

        let size = match (self.size, &existing) {
            (Some(size), _) => size,
            (None, Some(file)) => CardSize::from_image_len(file.metadata()?.len())
                .context("image is not a known SmartMedia size; give --size")?,
            (None, None) => bail!("{} does not exist; give --size to create it", path.display()),
        };

        let mut sim = SimNand::new(size.0);
        if let Some(mut file) = existing {
            sim.load(&mut file)
                .with_context(|| format!("loading {}", path.display()))?;
        } else {
            info!(path = %path.display(), "starting from a blank card");
        }

        Ok(Card::Image {
            sim,
            path,
            keep: !self.dry_run,
        })
    }
}

/// The card a command runs against
#[derive(Debug)]
enum Card {
    Image {
        sim: SimNand,
        path: PathBuf,
        /// Whether to store the card back into `path` once the command is done
        keep: bool,
    },

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl Card {
    fn nand(&mut self) -> &mut dyn Nand {
        match self {
            Card::Image { sim, .. } => sim,

            #[cfg(target_os = "linux")]
            Card::Mtd(mtd) => mtd,
        }
    }

    /// Store an image card back to its file.
    ///
    /// Only called once the command and its dismount succeeded, so a failed run never
    /// replaces a good image. The new image is written next to the old one and renamed over it.
    fn commit(self) -> Result<()> {
        let Card::Image { sim, path, keep } = self else {
            return Ok(());
        };
        if !keep {
            return Ok(());
        }

        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let mut file = File::create(&partial)
            .with_context(|| format!("creating {}", partial.display()))?;
        sim.save(&mut file)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&partial, &path)
            .with_context(|| format!("replacing {}", path.display()))?;

        info!(path = %path.display(), "saved card image");
        Ok(())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Erase the card and write a fresh, empty volume
    Format {
        /// Percentage of units to hold back as spares
        #[clap(long, default_value_t = 2)]
        reserve_percent: u8,

        /// Reformat even if the card already carries a matching format
        #[clap(long)]
        force: bool,
    },

    /// Print the geometry and unit usage of the volume
    Info,

    /// Print the status of every physical unit
    Units,

    /// Copy logical sectors out of the volume; unassigned sectors read as zeros
    Read {
        /// The first sector to read
        sector: u64,

        /// The number of sectors to read
        #[clap(long, default_value_t = 1)]
        count: u64,

        /// The file to write the sectors to
        #[clap(long)]
        output: PathBuf,
    },

    /// Write a file into consecutive logical sectors, padding the last one with zeros
    Write {
        /// The first sector to write
        sector: u64,

        /// The file to read the data from
        input: PathBuf,
    },

    /// Delete a run of logical sectors
    Delete {
        /// The first sector to delete
        sector: u64,

        /// The number of sectors to delete
        #[clap(long, default_value_t = 1)]
        count: u64,
    },

    /// Pre-erase free units until at least the given number of sectors is ready to write
    Defrag {
        /// The number of sectors wanted
        minimum: u64,
    },
}

impl Command {
    fn run(self, mut nand: &mut dyn Nand) -> Result<()> {
        match self {
            Command::Format {
                reserve_percent,
                force,
            } => {
                let options = FormatOptions {
                    reserve_percent,
                    force,
                };
                let report = format(&mut nand, &options)?;

                println!("Boot unit: {}", report.boot_unit);
                println!("Bad units: {:?}", report.bad_units);
                println!("Virtual units: {}", report.virtual_units);
                if !report.erased {
                    println!("Existing format kept; use --force to erase");
                }
            }

            Command::Info => {
                let volume = Volume::mount(nand)?;
                let geometry = volume.geometry();

                println!("Units: {}", geometry.units);
                println!("Sectors per unit: {}", geometry.sectors_per_unit);
                println!("Boot unit: {}", geometry.boot_unit);
                println!("Transfer unit: {}", volume.transfer_unit());
                println!("Virtual units: {}", geometry.virtual_units);
                println!("Logical sectors: {}", volume.sector_count());

                let statuses = [
                    UnitStatus::Available,
                    UnitStatus::Erased,
                    UnitStatus::Free,
                    UnitStatus::Bad,
                ];
                for status in statuses {
                    let count = (0..geometry.units)
                        .filter(|&unit| volume.unit_status(unit) == status)
                        .count();
                    println!("{status:?} units: {count}");
                }
            }

            Command::Units => {
                let volume = Volume::mount(nand)?;
                let geometry = volume.geometry();

                let mut owners = vec![None; geometry.units as usize];
                for virtual_unit in 0..geometry.virtual_units {
                    if let Some(unit) = volume.virtual_unit(virtual_unit) {
                        owners[unit as usize] = Some(virtual_unit);
                    }
                }

                for (unit, owner) in (0..geometry.units).zip(owners) {
                    let status = volume.unit_status(unit);
                    let unassigned = volume.unassigned(unit);
                    match owner {
                        Some(virtual_unit) => println!(
                            "{unit:5} => {status:?}, virtual unit {virtual_unit}, {unassigned} unassigned"
                        ),
                        None if unit == volume.transfer_unit() => {
                            println!("{unit:5} => {status:?} (transfer)")
                        }
                        None if unit == geometry.boot_unit => println!("{unit:5} => boot"),
                        None => println!("{unit:5} => {status:?}"),
                    }
                }
            }

            Command::Read {
                sector,
                count,
                output,
            } => {
                let mut layer: Box<dyn TranslationLayer + '_> = Box::new(Volume::mount(nand)?);
                let mut output = File::create(output)?;

                let mut unassigned = 0;
                layer.begin_operation();
                for sector in sector..sector.saturating_add(count) {
                    match layer.read_sector(sector)? {
                        Some(data) => output.write_all(data)?,
                        None => {
                            unassigned += 1;
                            output.write_all(&[0; SECTOR_SIZE])?;
                        }
                    }
                }
                layer.end_operation()?;
                layer.dismount()?;

                info!(count, unassigned, "read sectors");
            }

            Command::Write { sector, input } => {
                let mut data = Vec::new();
                File::open(&input)
                    .and_then(|mut file| file.read_to_end(&mut data))
                    .with_context(|| format!("reading {}", input.display()))?;
                data.resize(data.len().next_multiple_of(SECTOR_SIZE), 0);

                let mut layer: Box<dyn TranslationLayer + '_> = Box::new(Volume::mount(nand)?);
                layer.begin_operation();
                for (sector, chunk) in (sector..).zip(data.chunks_exact(SECTOR_SIZE)) {
                    layer.write_sector(sector, chunk)?;
                }
                layer.end_operation()?;
                layer.dismount()?;

                info!(sectors = data.len() / SECTOR_SIZE, "wrote sectors");
            }

            Command::Delete { sector, count } => {
                let mut layer: Box<dyn TranslationLayer + '_> = Box::new(Volume::mount(nand)?);
                layer.begin_operation();
                layer.delete_sectors(sector, count)?;
                layer.end_operation()?;
                layer.dismount()?;
            }

            Command::Defrag { minimum } => {
                let mut layer: Box<dyn TranslationLayer + '_> = Box::new(Volume::mount(nand)?);
                let available = layer.defragment(minimum)?;
                layer.dismount()?;

                println!("Sectors ready to write: {available}");
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The card to use
    #[clap(flatten)]
    card: CardOptions,

    /// The command to run against the card
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut card = args.card.open()?;
    args.cmd.run(card.nand())?;
    card.commit()
}
