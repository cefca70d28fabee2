use std::fmt::{self, Debug, Formatter};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::common::{describe_sect, OleError, OleResult, FREE_SECT, UINT32_SIZE};
use crate::header::HEADER_SIZE;

/// What a sector is currently used for. Table sectors hold FAT/DIFAT/mini-FAT
/// words or directory entries; `MiniHost` sectors back the mini stream; `Data`
/// sectors carry regular stream payload (or are free).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorKind {
    Data,
    MiniHost,
    FatTable,
    MiniFatTable,
    DirectoryTable,
    DifatTable,
}

/// One fixed-size sector. The payload is pulled from the backing file on first
/// use; sectors created in memory carry their payload from the start.
pub struct Sector {
    pub(crate) id: u32,
    size: usize,
    pub(crate) data: Option<Vec<u8>>,
    pub(crate) next: u32,
    pub(crate) kind: SectorKind,
    pub(crate) dirty: bool,
}

impl Sector {
    pub fn new(size: usize) -> Self {
        Sector {
            id: u32::MAX,
            size,
            data: None,
            next: FREE_SECT,
            kind: SectorKind::Data,
            dirty: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn next(&self) -> u32 {
        self.next
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte offset of this sector in the backing file.
    fn file_offset(&self) -> u64 {
        HEADER_SIZE as u64 + self.id as u64 * self.size as u64
    }

    /// Pulls the sector payload from the backing file if it is not cached yet.
    /// A short read fails and leaves the cache empty.
    pub(crate) fn read_from(&mut self, mut file: &File) -> OleResult<()> {
        if self.data.is_some() {
            return Ok(());
        }
        let mut buf = vec![0u8; self.size];
        file.seek(SeekFrom::Start(self.file_offset()))?;
        file.read_exact(&mut buf)?;
        self.data = Some(buf);
        Ok(())
    }

    fn payload_mut(&mut self) -> OleResult<&mut Vec<u8>> {
        let id = self.id;
        self.data
            .as_mut()
            .ok_or_else(|| OleError::Internal(format!("write to sector {id} with no payload")))
    }

    /// Writes a little-endian u32 at `offset` and marks the sector dirty.
    pub(crate) fn write_u32(&mut self, offset: usize, value: u32) -> OleResult<()> {
        let size = self.size;
        let data = self.payload_mut()?;
        if offset + UINT32_SIZE > size {
            return Err(OleError::Internal(format!(
                "u32 write at offset {offset} past sector size {size}"
            )));
        }
        data[offset..offset + UINT32_SIZE].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
        Ok(())
    }

    /// Copies as much of `bytes` as fits from `offset` on, marking the sector
    /// dirty. Never extends the sector.
    pub(crate) fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> OleResult<()> {
        let size = self.size;
        if offset >= size {
            return Err(OleError::Internal(format!(
                "byte write at offset {offset} past sector size {size}"
            )));
        }
        let data = self.payload_mut()?;
        let n = bytes.len().min(size - offset);
        data[offset..offset + n].copy_from_slice(&bytes[..n]);
        self.dirty = true;
        Ok(())
    }
}

impl Debug for Sector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let comment = describe_sect(self.next);
        if comment.is_empty() {
            write!(
                f,
                "Sector {{ id: {}, next: {}, kind: {:?} }}",
                self.id, self.next, self.kind
            )
        } else {
            write!(
                f,
                "Sector {{ id: {}, next: {}, kind: {:?} }}",
                self.id, comment, self.kind
            )
        }
    }
}

/// Indexed store of every sector in the file, in id order.
pub struct SectorCollection {
    data: Vec<Sector>,
    sector_size: usize,
}

impl SectorCollection {
    /// `count` pre-sized slots for an opened file, zero for a new one.
    pub fn new(sector_size: usize, count: usize) -> Self {
        let mut data = Vec::with_capacity(count);
        for id in 0..count {
            let mut s = Sector::new(sector_size);
            s.id = id as u32;
            data.push(s);
        }
        SectorCollection { data, sector_size }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn add(&mut self, mut sector: Sector) -> u32 {
        let id = self.data.len() as u32;
        sector.id = id;
        self.data.push(sector);
        id
    }

    pub fn get(&self, id: u32) -> OleResult<&Sector> {
        self.data
            .get(id as usize)
            .ok_or(OleError::IndexOutOfRange(id))
    }

    pub fn get_mut(&mut self, id: u32) -> OleResult<&mut Sector> {
        self.data
            .get_mut(id as usize)
            .ok_or(OleError::IndexOutOfRange(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sector> {
        self.data.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Sector> {
        self.data.iter_mut()
    }
}
