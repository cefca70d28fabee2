use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};

use crate::common::{
    MajorVersion, OleError, OleResult, END_OF_CHAIN, FREE_SECT, UINT32_SIZE,
};
use crate::directory::DIRECTORY_ENTRY_SIZE;

pub const HEADER_SIZE: usize = 512;

/// Header Signature (8 bytes): MUST be set to the value 0xD0, 0xCF, 0x11, 0xE0,
/// 0xA1, 0xB1, 0x1A, 0xE1.
pub const OLE_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Mini Stream Cutoff Size (4 bytes): MUST be set to 0x00001000. Any user-defined
/// data stream smaller than this is allocated from the mini FAT and mini stream.
pub const MINI_STREAM_CUTOFF: u32 = 0x0000_1000;

const MINOR_VERSION: u16 = 0x003E;
const BYTE_ORDER_LE: u16 = 0xFFFE;
const MINI_SECTOR_SHIFT: u16 = 0x0006;

/// The 512-byte structure at the start of every compound file.
///
/// https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cfb/05060311-bfce-4b12-874d-71fd4ce63aea
///
/// Fields are kept raw so a reader can distinguish a wrong signature from an
/// unsupported version from a malformed field; `validate` maps each failure to
/// its own error.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct Header {
    pub signature: [u8; 8],
    // Header CLSID (16 bytes): reserved and unused class ID, all zeroes.
    pub clsid: [u8; 16],
    pub minor_version: u16,
    pub major_version: u16,
    // Byte Order (2 bytes): MUST be 0xFFFE, little-endian for all integer fields.
    pub byte_order: u16,
    pub sector_shift: u16,
    // Mini Sector Shift (2 bytes): MUST be 0x0006; mini-stream sectors are 64 bytes.
    pub mini_sector_shift: u16,
    pub reserved: [u8; 6],
    // Number of Directory Sectors (4 bytes): MUST be zero for version 3 files.
    pub num_directory_sectors: u32,
    pub num_fat_sectors: u32,
    pub first_directory_sector_location: u32,
    pub transaction_signature_number: u32,
    pub mini_stream_cutoff_size: u32,
    pub first_mini_fat_sector_location: u32,
    pub num_mini_fat_sectors: u32,
    pub first_difat_sector_location: u32,
    pub num_difat_sectors: u32,
    // DIFAT (436 bytes): the first 109 FAT sector locations.
    pub difat: [u32; 109],
    #[brw(ignore)]
    pub(crate) dirty: bool,
}

impl Header {
    pub fn new(version: MajorVersion) -> Self {
        Header {
            signature: OLE_SIGNATURE,
            clsid: [0; 16],
            minor_version: MINOR_VERSION,
            major_version: version.number(),
            byte_order: BYTE_ORDER_LE,
            sector_shift: version.sector_shift(),
            mini_sector_shift: MINI_SECTOR_SHIFT,
            reserved: [0; 6],
            num_directory_sectors: 0,
            num_fat_sectors: 0,
            first_directory_sector_location: END_OF_CHAIN,
            transaction_signature_number: 0,
            mini_stream_cutoff_size: MINI_STREAM_CUTOFF,
            first_mini_fat_sector_location: END_OF_CHAIN,
            num_mini_fat_sectors: 0,
            first_difat_sector_location: END_OF_CHAIN,
            num_difat_sectors: 0,
            difat: [FREE_SECT; 109],
            dirty: true,
        }
    }

    pub fn read(buf: &[u8]) -> OleResult<Self> {
        let header = Header::read_le(&mut Cursor::new(buf))?;
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> OleResult<()> {
        if self.signature != OLE_SIGNATURE {
            return Err(OleError::WrongFormat);
        }
        let version = MajorVersion::from_number(self.major_version)
            .ok_or(OleError::UnsupportedVersion(self.major_version))?;
        if self.sector_shift != version.sector_shift() {
            return Err(OleError::MalformedHeader("sector shift does not match version"));
        }
        if self.mini_sector_shift != MINI_SECTOR_SHIFT {
            return Err(OleError::MalformedHeader("illegal mini-sector shift"));
        }
        if self.byte_order != BYTE_ORDER_LE {
            return Err(OleError::MalformedHeader("illegal byte order mark"));
        }
        if self.mini_stream_cutoff_size != MINI_STREAM_CUTOFF {
            return Err(OleError::MalformedHeader("illegal mini stream cutoff"));
        }
        if (self.num_difat_sectors as i32) < 0 {
            return Err(OleError::MalformedHeader("DIFAT sector count overflow"));
        }
        // Each DIFAT sector indexes sectorSize/4 - 1 FAT sectors; together with the
        // 109 header entries the claimed counts must stay consistent.
        let per_difat = (self.sector_size() / UINT32_SIZE - 1) as u64;
        if self.num_difat_sectors as u64 * per_difat + 109
            > self.num_fat_sectors as u64 + per_difat
        {
            return Err(OleError::MalformedHeader("DIFAT count exceeds FAT sectors"));
        }
        if (self.num_mini_fat_sectors as i32) < 0 {
            return Err(OleError::MalformedHeader("mini FAT sector count overflow"));
        }
        Ok(())
    }

    pub fn bytes(&self) -> OleResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(HEADER_SIZE));
        self.write_le(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    pub fn version(&self) -> MajorVersion {
        // Validated on read, fixed on creation.
        MajorVersion::from_number(self.major_version).unwrap_or_default()
    }

    pub fn sector_size(&self) -> usize {
        1 << self.sector_shift
    }

    pub fn mini_sector_size(&self) -> usize {
        1 << self.mini_sector_shift
    }

    /// 32-bit FAT entries per sector: 128 for version 3, 1024 for version 4.
    pub fn fat_entries_per_sector(&self) -> usize {
        self.sector_size() / UINT32_SIZE
    }

    /// Directory entries per sector: 4 for version 3, 32 for version 4.
    pub fn directory_entries_per_sector(&self) -> usize {
        self.sector_size() / DIRECTORY_ENTRY_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_header_round_trips() {
        let header = Header::new(MajorVersion::Version3);
        let buf = header.bytes().unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let reread = Header::read(&buf).unwrap();
        assert_eq!(reread.major_version, 3);
        assert_eq!(reread.sector_size(), 512);
        assert_eq!(reread.mini_sector_size(), 64);
        assert_eq!(reread.first_directory_sector_location, END_OF_CHAIN);
        assert!(reread.difat.iter().all(|&v| v == FREE_SECT));
    }

    #[test]
    fn version4_sector_size() {
        let header = Header::new(MajorVersion::Version4);
        assert_eq!(header.sector_size(), 4096);
        assert_eq!(header.fat_entries_per_sector(), 1024);
        assert_eq!(header.directory_entries_per_sector(), 32);
    }

    #[test]
    fn bad_signature_is_wrong_format() {
        let header = Header::new(MajorVersion::Version3);
        let mut buf = header.bytes().unwrap();
        buf[0] = 0x00;
        assert!(matches!(Header::read(&buf), Err(OleError::WrongFormat)));
    }

    #[test]
    fn bad_version_is_unsupported() {
        let header = Header::new(MajorVersion::Version3);
        let mut buf = header.bytes().unwrap();
        buf[26] = 0x05;
        assert!(matches!(
            Header::read(&buf),
            Err(OleError::UnsupportedVersion(5))
        ));
    }

    #[test]
    fn bad_cutoff_is_malformed() {
        let mut header = Header::new(MajorVersion::Version3);
        header.mini_stream_cutoff_size = 0x2000;
        let buf = header.bytes().unwrap();
        assert!(matches!(
            Header::read(&buf),
            Err(OleError::MalformedHeader(_))
        ));
    }
}
