use thiserror::Error;

/// Everything that can go wrong in the translation layer
#[derive(Error, Debug)]
pub enum FtlError {
    /// The card carries no usable boot record, or its geometry can't be supported
    #[error("bad format: {0}")]
    BadFormat(String),

    #[error("sector {sector} is beyond the end of the volume ({count} sectors)")]
    SectorOutOfRange { sector: u64, count: u64 },

    #[error("sector buffers must be 512 bytes, got {0}")]
    InvalidLength(usize),

    /// The device failed to program a page; the data was not stored
    #[error("write fault at offset {offset:#x}")]
    WriteFault { offset: u64 },

    #[error("no free unit available")]
    NoFreeUnit,

    /// A unit under replacement carries no valid virtual unit address, so it can't be completed
    #[error("unit {unit} is being replaced but its virtual unit can't be determined")]
    InconsistentReplacement { unit: u32 },

    #[error("uncorrectable ECC error in sector {sector}")]
    Uncorrectable { sector: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FtlError>;
