use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;

use crate::common::{OleError, OleResult, END_OF_CHAIN, NO_STREAM};

/// Directory entries are 128 bytes; a version 3 sector holds 4 of them, a
/// version 4 sector 32.
///
/// https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cfb/a94d7445-c4be-49cd-b6b9-2f4abc663817
pub const DIRECTORY_ENTRY_SIZE: usize = 128;

/// Storage and stream names are limited to 31 UTF-16 code units plus the
/// terminating null.
pub const MAX_NAME_CODE_UNITS: usize = 31;

/// Seconds between the FILETIME epoch (1601-01-01) and the Unix epoch.
const FILETIME_UNIX_DIFF_SECS: i64 = 11_644_473_600;

// Object Type (1 byte): This field MUST be 0x00, 0x01, 0x02, or 0x05, depending on
// the actual type of object. All other values are not valid.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectType {
    #[default]
    #[brw(magic(0x00u8))]
    Unallocated,
    #[brw(magic(0x01u8))]
    Storage,
    #[brw(magic(0x02u8))]
    Stream,
    #[brw(magic(0x05u8))]
    Root,
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Unallocated => write!(f, "unallocated"),
            ObjectType::Storage => write!(f, "storage"),
            ObjectType::Stream => write!(f, "stream"),
            ObjectType::Root => write!(f, "root storage"),
        }
    }
}

// Color Flag (1 byte): This field MUST be 0x00 (red) or 0x01 (black).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    #[brw(magic(0x00u8))]
    Red,
    #[brw(magic(0x01u8))]
    Black,
}

/// One 128-byte directory entry: a storage, a stream, the root, or a free
/// slot. Sibling and child fields are entry ids into the directory arena,
/// NOSTREAM-terminated; left/right encode the red-black sibling tree.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    // Directory Entry Name (64 bytes): UTF-16 string, null terminated. The
    // characters '/', '\', ':' and '!' are illegal.
    pub name: [u16; 32],
    // Directory Entry Name Length (2 bytes): length in bytes including the
    // terminating null character.
    pub name_len: u16,
    pub object_type: ObjectType,
    pub color: Color,
    pub left_sibling_id: u32,
    pub right_sibling_id: u32,
    pub child_id: u32,
    pub clsid: [u8; 16],
    pub state_bits: u32,
    // Creation Time / Modified Time (8 bytes each): Windows FILETIME in UTC.
    pub creation_time: u64,
    pub modified_time: u64,
    // Starting Sector Location (4 bytes): first sector of the stream; for the
    // root storage, first sector of the mini stream.
    pub start_sector_location: u32,
    // Stream Size (8 bytes): user data length; for the root storage, the size
    // of the mini stream.
    pub size: u64,
    #[brw(ignore)]
    pub(crate) id: u32,
}

impl DirectoryEntry {
    pub fn new() -> Self {
        let mut de = DirectoryEntry {
            name: [0; 32],
            name_len: 0,
            object_type: ObjectType::Unallocated,
            color: Color::Red,
            left_sibling_id: NO_STREAM,
            right_sibling_id: NO_STREAM,
            child_id: NO_STREAM,
            clsid: [0; 16],
            state_bits: 0,
            creation_time: 0,
            modified_time: 0,
            start_sector_location: END_OF_CHAIN,
            size: 0,
            id: 0,
        };
        de.clear();
        de
    }

    /// Resets every persisted field to the unallocated state; the arena id is
    /// kept.
    pub fn clear(&mut self) {
        self.name = [0; 32];
        self.name_len = 0;
        self.object_type = ObjectType::Unallocated;
        self.color = Color::Red;
        self.left_sibling_id = NO_STREAM;
        self.right_sibling_id = NO_STREAM;
        self.child_id = NO_STREAM;
        self.clsid = [0; 16];
        self.state_bits = 0;
        self.creation_time = 0;
        self.modified_time = 0;
        self.start_sector_location = END_OF_CHAIN;
        self.size = 0;
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_name(&mut self, name: &str) -> OleResult<()> {
        let units = check_name(name)?;
        self.name = [0; 32];
        self.name[..units.len()].copy_from_slice(&units);
        self.name_len = ((units.len() + 1) * 2) as u16;
        Ok(())
    }

    pub fn name(&self) -> String {
        if self.name_len < 2 {
            return String::new();
        }
        let n = (self.name_len as usize / 2 - 1).min(MAX_NAME_CODE_UNITS);
        String::from_utf16_lossy(&self.name[..n])
    }

    pub(crate) fn touch(&mut self) {
        let now = filetime_now();
        self.creation_time = now;
        self.modified_time = now;
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.creation_time)
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.modified_time)
    }

    /// Stamps a fresh version-4, Microsoft-variant GUID into the CLSID field.
    pub(crate) fn new_guid(&mut self) {
        rand::rng().fill_bytes(&mut self.clsid);
        self.clsid[6] = (self.clsid[6] & 0x0F) | 0x40;
        self.clsid[8] = (self.clsid[8] & 0x1F) | 0xC0;
    }

    pub fn read(buf: &[u8]) -> OleResult<Self> {
        DirectoryEntry::read_le(&mut Cursor::new(buf))
            .map_err(|e| OleError::Corrupt(format!("bad directory entry: {e}")))
    }

    pub fn bytes(&self) -> OleResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(DIRECTORY_ENTRY_SIZE));
        self.write_le(&mut cursor)?;
        Ok(cursor.into_inner())
    }
}

impl Default for DirectoryEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DirectoryEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Directory {{ id: {}, name: {:?}, type: {}, left: {}, right: {}, child: {}, start: {}, size: {} }}",
            self.id,
            self.name(),
            self.object_type,
            self.left_sibling_id,
            self.right_sibling_id,
            self.child_id,
            self.start_sector_location,
            self.size
        )
    }
}

/// Validates a directory name and returns its UTF-16 code units.
pub(crate) fn check_name(name: &str) -> OleResult<Vec<u16>> {
    if name.contains(['\\', '/', ':', '!']) {
        return Err(OleError::InvalidName(name.to_string()));
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > MAX_NAME_CODE_UNITS {
        return Err(OleError::NameTooLong(units.len()));
    }
    Ok(units)
}

pub(crate) fn filetime_now() -> u64 {
    let now = Utc::now();
    (now.timestamp() + FILETIME_UNIX_DIFF_SECS) as u64 * 10_000_000
        + now.timestamp_subsec_nanos() as u64 / 100
}

pub(crate) fn filetime_to_datetime(t: u64) -> Option<DateTime<Utc>> {
    if t == 0 {
        return None;
    }
    let secs = (t / 10_000_000) as i64 - FILETIME_UNIX_DIFF_SECS;
    let nanos = (t % 10_000_000) as u32 * 100;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Append-only arena of directory entries. An entry's id is its position;
/// freed entries keep their slot and wait on the free set, lowest id first.
pub struct DirectoryCollection {
    data: Vec<DirectoryEntry>,
    free: BTreeSet<u32>,
}

impl DirectoryCollection {
    pub fn new(capacity: usize) -> Self {
        DirectoryCollection {
            data: Vec::with_capacity(capacity),
            free: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn add(&mut self, mut de: DirectoryEntry) -> u32 {
        let id = self.data.len() as u32;
        de.id = id;
        self.data.push(de);
        id
    }

    pub fn get(&self, id: u32) -> OleResult<&DirectoryEntry> {
        self.data
            .get(id as usize)
            .ok_or(OleError::IndexOutOfRange(id))
    }

    pub fn get_mut(&mut self, id: u32) -> OleResult<&mut DirectoryEntry> {
        self.data
            .get_mut(id as usize)
            .ok_or(OleError::IndexOutOfRange(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.data.iter()
    }

    /// Takes the lowest-id free entry, if any.
    pub fn pop_free(&mut self) -> Option<u32> {
        let id = *self.free.iter().next()?;
        self.free.remove(&id);
        Some(id)
    }

    /// Clears an entry and returns it to the free set. Double-freeing is a
    /// defect.
    pub fn push_free(&mut self, id: u32) -> OleResult<()> {
        if id as usize >= self.data.len() {
            return Err(OleError::IndexOutOfRange(id));
        }
        if !self.free.insert(id) {
            return Err(OleError::Internal(format!(
                "directory entry {id} already in free set"
            )));
        }
        self.data[id as usize].clear();
        Ok(())
    }
}
