use thiserror::Error;

pub const UINT32_SIZE: usize = 4;

/// REGSECT 0x00000000 - 0xFFFFFFF9 Regular sector number.
///
/// MAXREGSECT 0xFFFFFFFA Maximum regular sector number.
///
/// DIFSECT 0xFFFFFFFC Specifies a DIFAT sector in the FAT.
///
/// FATSECT 0xFFFFFFFD Specifies a FAT sector in the FAT.
///
/// ENDOFCHAIN 0xFFFFFFFE End of a linked chain of sectors.
///
/// FREESECT 0xFFFFFFFF Specifies an unallocated sector in the FAT, Mini FAT, or DIFAT.
pub const MAX_REG_SECT: u32 = 0xFFFFFFFA;
pub const DIF_SECT: u32 = 0xFFFFFFFC;
pub const FAT_SECT: u32 = 0xFFFFFFFD;
pub const END_OF_CHAIN: u32 = 0xFFFFFFFE;
pub const FREE_SECT: u32 = 0xFFFFFFFF;

/// NOSTREAM 0xFFFFFFFF Terminator for sibling and child stream IDs.
pub const NO_STREAM: u32 = 0xFFFFFFFF;

/// True for sector numbers below MAXREGSECT, i.e. everything that is not a
/// FREESECT/ENDOFCHAIN/FATSECT/DIFSECT sentinel.
pub fn is_regular_sect(v: u32) -> bool {
    v <= MAX_REG_SECT
}

pub(crate) fn describe_sect(v: u32) -> &'static str {
    match v {
        FREE_SECT => "free",
        END_OF_CHAIN => "end",
        FAT_SECT => "fat",
        DIF_SECT => "difat",
        _ => "",
    }
}

// Major Version (2 bytes): Version number for breaking changes. This field MUST be set to
// either 0x0003 (version 3) or 0x0004 (version 4).
#[derive(Debug, Eq, PartialEq, Copy, Clone, Default)]
pub enum MajorVersion {
    #[default]
    Version3,
    Version4,
}

impl MajorVersion {
    pub fn from_number(n: u16) -> Option<Self> {
        match n {
            0x0003 => Some(MajorVersion::Version3),
            0x0004 => Some(MajorVersion::Version4),
            _ => None,
        }
    }

    pub fn number(self) -> u16 {
        match self {
            MajorVersion::Version3 => 0x0003,
            MajorVersion::Version4 => 0x0004,
        }
    }

    // If Major Version is 3, the Sector Shift MUST be 0x0009, specifying a sector size
    // of 512 bytes. If Major Version is 4, the Sector Shift MUST be 0x000C, specifying
    // a sector size of 4096 bytes.
    pub fn sector_shift(self) -> u16 {
        match self {
            MajorVersion::Version3 => 0x0009,
            MajorVersion::Version4 => 0x000C,
        }
    }

    pub fn sector_size(self) -> usize {
        1 << self.sector_shift()
    }
}

#[derive(Debug, Error)]
pub enum OleError {
    #[error("wrong file format")]
    WrongFormat,
    #[error("unsupported compound file version: {0}")]
    UnsupportedVersion(u16),
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),
    #[error("stream not found: {0:?}")]
    StreamNotFound(String),
    #[error("directory or storage not found")]
    NotFoundDirectory,
    #[error("invalid directory name: {0:?}")]
    InvalidName(String),
    #[error("directory name too long: {0} UTF-16 code units")]
    NameTooLong(usize),
    #[error("a directory with this name already exists: {0:?}")]
    DuplicateName(String),
    #[error("index out of range: {0}")]
    IndexOutOfRange(u32),
    #[error("corrupt compound file: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("parse error")]
    Parse(#[from] binrw::Error),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type OleResult<T> = Result<T, OleError>;
