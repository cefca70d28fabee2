use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, trace};

use crate::common::{
    is_regular_sect, MajorVersion, OleError, OleResult, END_OF_CHAIN, FREE_SECT, NO_STREAM,
    UINT32_SIZE,
};
use crate::directory::{
    check_name, Color, DirectoryCollection, DirectoryEntry, ObjectType, DIRECTORY_ENTRY_SIZE,
};
use crate::header::{Header, HEADER_SIZE};
use crate::memory::{Memory, MemoryRole};
use crate::mini_sector::{MiniSectorCollection, MINI_SECTOR_SIZE};
use crate::sector::{Sector, SectorCollection, SectorKind};
use crate::storage::Storage;

/// A compound file: the header, the sector and mini-sector stores, the
/// allocation memory and the directory arena, plus the backing file when one
/// was opened.
///
/// https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cfb/53989ce4-7b05-4f8d-829b-d08d6148375b
pub struct Ole {
    file: Option<File>,
    header: Header,
    memory: Memory,
    mini: MiniSectorCollection,
    sectors: SectorCollection,
    directory: DirectoryCollection,
    sector_size: usize,
    // sectors present in the backing file at open time; anything past this
    // exists only in memory and cannot be lazily read back
    disk_sector_count: usize,
}

impl Ole {
    /// Creates an empty compound file of the given version, with its root
    /// storage in place.
    pub fn new(version: MajorVersion) -> OleResult<Self> {
        let header = Header::new(version);
        let sector_size = header.sector_size();
        let mut ole = Ole {
            file: None,
            header,
            memory: Memory::new(sector_size),
            mini: MiniSectorCollection::new(),
            sectors: SectorCollection::new(sector_size, 0),
            directory: DirectoryCollection::new(1),
            sector_size,
            disk_sector_count: 0,
        };
        let root = ole.new_directory_entry("Root Entry", ObjectType::Root)?;
        ole.update_directory(root)?;
        Ok(ole)
    }

    /// Opens an existing compound file for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> OleResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(OleError::WrongFormat);
        }
        let mut buf = vec![0u8; HEADER_SIZE];
        {
            let mut f = &file;
            f.seek(SeekFrom::Start(0))?;
            f.read_exact(&mut buf)?;
        }
        let header = Header::read(&buf)?;
        let sector_size = header.sector_size();
        let count = ((file_len - HEADER_SIZE as u64) / sector_size as u64) as usize;
        let mut ole = Ole {
            file: Some(file),
            header,
            memory: Memory::new(sector_size),
            mini: MiniSectorCollection::new(),
            sectors: SectorCollection::new(sector_size, count),
            directory: DirectoryCollection::new(16),
            sector_size,
            disk_sector_count: count,
        };
        ole.load()?;
        Ok(ole)
    }

    pub fn version(&self) -> MajorVersion {
        self.header.version()
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn mini_sector_size(&self) -> usize {
        MINI_SECTOR_SIZE
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn sectors(&self) -> &SectorCollection {
        &self.sectors
    }

    pub fn mini_sectors(&self) -> &MiniSectorCollection {
        &self.mini
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn directory(&self) -> &DirectoryCollection {
        &self.directory
    }

    pub(crate) fn directory_mut(&mut self) -> &mut DirectoryCollection {
        &mut self.directory
    }

    /// The root storage of this compound file.
    pub fn root_storage(&mut self) -> Storage<'_> {
        Storage::attach(self, 0)
    }

    /// Drops the compound file, closing the backing file if any.
    pub fn close(self) {}

    // ---------- load ----------

    fn load(&mut self) -> OleResult<()> {
        self.read_fat()?;
        self.read_directory()?;
        self.read_mini_fat()?;
        if self.directory.get(0)?.object_type != ObjectType::Root {
            return Err(OleError::Corrupt(
                "first directory entry is not the root storage".into(),
            ));
        }
        debug!(
            "loaded compound file: {} sectors, {} directory entries, {} mini-sectors",
            self.sectors.len(),
            self.directory.len(),
            self.mini.len()
        );
        Ok(())
    }

    /// Pulls every FAT table sector named by the header DIFAT and the DIFAT
    /// sector chain, then replays the FAT over the store so each sector knows
    /// its next pointer. Free sectors join the free bucket as they are seen.
    fn read_fat(&mut self) -> OleResult<()> {
        let inline = (self.header.num_fat_sectors as usize).min(self.header.difat.len());
        for i in 0..inline {
            let id = self.header.difat[i];
            self.ensure_sector_data(id)?;
            self.memory.add(&mut self.sectors, id, MemoryRole::FatTable)?;
        }

        if self.header.num_difat_sectors > 0 {
            let slots = self.sector_size / UINT32_SIZE - 1;
            let mut next = self.header.first_difat_sector_location;
            for _ in 0..self.header.num_difat_sectors {
                if !is_regular_sect(next) {
                    break;
                }
                let did = next;
                self.ensure_sector_data(did)?;
                self.memory.add(&mut self.sectors, did, MemoryRole::Difat)?;
                let words: Vec<u32> = {
                    let data = self.sectors.get(did)?.data.as_ref().ok_or_else(|| {
                        OleError::Internal(format!("DIFAT sector {did} has no payload"))
                    })?;
                    data.chunks_exact(UINT32_SIZE)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect()
                };
                for &sec in words.iter().take(slots) {
                    if !is_regular_sect(sec) || sec as usize >= self.sectors.len() {
                        break;
                    }
                    self.ensure_sector_data(sec)?;
                    self.memory.add(&mut self.sectors, sec, MemoryRole::FatTable)?;
                }
                next = words[slots];
            }
        }

        let words = self.memory.collect_u32(&self.sectors, MemoryRole::FatTable)?;
        let count = self.sectors.len();
        for (idx, &word) in words.iter().take(count).enumerate() {
            let id = idx as u32;
            self.sectors.get_mut(id)?.next = word;
            if word == FREE_SECT {
                self.memory.push(&mut self.sectors, id)?;
            }
        }
        Ok(())
    }

    /// Walks the directory chain, parsing 128-byte records into the arena.
    /// Visiting the same sector twice means the chain is cyclic.
    fn read_directory(&mut self) -> OleResult<()> {
        let per = self.header.directory_entries_per_sector();
        let mut visited = HashSet::new();
        let mut off = self.header.first_directory_sector_location;
        while is_regular_sect(off) {
            if !visited.insert(off) {
                return Err(OleError::Corrupt(format!(
                    "directory sector cycle at {off}"
                )));
            }
            self.ensure_sector_data(off)?;
            self.memory
                .add(&mut self.sectors, off, MemoryRole::DirectoryTable)?;
            for j in 0..per {
                let entry = {
                    let data = self.sectors.get(off)?.data.as_ref().ok_or_else(|| {
                        OleError::Internal(format!("directory sector {off} has no payload"))
                    })?;
                    DirectoryEntry::read(
                        &data[j * DIRECTORY_ENTRY_SIZE..(j + 1) * DIRECTORY_ENTRY_SIZE],
                    )?
                };
                let unallocated = entry.object_type == ObjectType::Unallocated;
                let id = self.directory.add(entry);
                if unallocated {
                    self.directory.push_free(id)?;
                }
            }
            let next = self.sectors.get(off)?.next;
            if !is_regular_sect(next) && next != END_OF_CHAIN {
                return Err(OleError::Corrupt(format!(
                    "directory chain broken at {next:#x}"
                )));
            }
            off = next;
        }
        Ok(())
    }

    /// Reads the mini-FAT table chain, then derives every mini-sector from
    /// the root entry's mini stream chain and replays the mini FAT over them.
    fn read_mini_fat(&mut self) -> OleResult<()> {
        let mut sec = self.header.first_mini_fat_sector_location;
        for _ in 0..self.header.num_mini_fat_sectors {
            if !is_regular_sect(sec) {
                break;
            }
            self.ensure_sector_data(sec)?;
            self.memory
                .add(&mut self.sectors, sec, MemoryRole::MiniFatTable)?;
            sec = self.sectors.get(sec)?.next;
        }

        if self.directory.is_empty() {
            return Ok(());
        }
        let mut host = self.directory.get(0)?.start_sector_location;
        let per = self.sector_size / MINI_SECTOR_SIZE;
        let mut hops = 0;
        while is_regular_sect(host) {
            if let Some(role) = self.memory.find(host) {
                return Err(OleError::Corrupt(format!(
                    "mini stream host sector {host} already filed under {role}"
                )));
            }
            self.sectors.get_mut(host)?.kind = SectorKind::MiniHost;
            for i in 0..per {
                self.mini.add(host, i * MINI_SECTOR_SIZE);
            }
            host = self.sectors.get(host)?.next;
            hops += 1;
            if hops > self.sectors.len() {
                return Err(OleError::Corrupt("mini stream chain cycle".into()));
            }
        }

        let words = self.memory.collect_u32(&self.sectors, MemoryRole::MiniFatTable)?;
        let count = self.mini.len();
        for (idx, &word) in words.iter().take(count).enumerate() {
            let id = idx as u32;
            self.mini.get_mut(id)?.next = word;
            if word == FREE_SECT {
                self.mini.push_free(id)?;
            }
        }
        Ok(())
    }

    // ---------- allocation ----------

    /// Makes a sector's payload available, pulling it from the backing file
    /// if needed.
    pub(crate) fn ensure_sector_data(&mut self, id: u32) -> OleResult<()> {
        if self.sectors.get(id)?.data.is_some() {
            return Ok(());
        }
        match &self.file {
            Some(file) => self.sectors.get_mut(id)?.read_from(file),
            None => Err(OleError::Internal(format!(
                "sector {id} has no payload and no backing file"
            ))),
        }
    }

    /// Grows the file by one sector of the requested role, growing whatever
    /// table chains the request needs first. Returns the new sector's id.
    pub(crate) fn add_sector(&mut self, kind: SectorKind) -> OleResult<u32> {
        match kind {
            SectorKind::Data => {
                if let Some(id) = self.memory.pop() {
                    let sector_size = self.sector_size;
                    let s = self.sectors.get_mut(id)?;
                    s.data = Some(vec![0u8; sector_size]);
                    s.kind = SectorKind::Data;
                    s.next = END_OF_CHAIN;
                    s.dirty = true;
                    self.memory.change_fat(&mut self.sectors, id)?;
                    return Ok(id);
                }
                if self.sectors.len() >= self.memory.count_u32(MemoryRole::FatTable) {
                    self.add_sector(SectorKind::FatTable)?;
                }
                let mut s = Sector::new(self.sector_size);
                s.data = Some(vec![0u8; self.sector_size]);
                s.next = END_OF_CHAIN;
                s.dirty = true;
                let id = self.sectors.add(s);
                self.memory.change_fat(&mut self.sectors, id)?;
                trace!("allocated sector {id}");
                Ok(id)
            }
            SectorKind::FatTable => {
                // Every slot of a fresh FAT table starts as FREESECT (all
                // 0xFF bytes); the table then marks its own slot FATSECT.
                let mut s = Sector::new(self.sector_size);
                s.data = Some(vec![0xFF; self.sector_size]);
                s.dirty = true;
                let id = self.sectors.add(s);
                self.memory.add(&mut self.sectors, id, MemoryRole::FatTable)?;
                self.memory.change_fat(&mut self.sectors, id)?;

                let count = self.memory.len(MemoryRole::FatTable);
                self.header.num_fat_sectors = count as u32;
                self.header.dirty = true;
                if count <= self.header.difat.len() && self.header.num_difat_sectors == 0 {
                    self.header.difat[count - 1] = id;
                } else {
                    self.register_fat_in_difat(id, count)?;
                }
                debug!("added FAT table sector {id} (total {count})");
                Ok(id)
            }
            SectorKind::DirectoryTable => {
                let old = self.memory.last(MemoryRole::DirectoryTable);
                let id = self.add_sector(SectorKind::Data)?;
                self.memory
                    .add(&mut self.sectors, id, MemoryRole::DirectoryTable)?;
                self.sectors.get_mut(id)?.next = END_OF_CHAIN;
                self.memory.change_fat(&mut self.sectors, id)?;
                if let Some(o) = old {
                    self.sectors.get_mut(o)?.next = id;
                    self.memory.change_fat(&mut self.sectors, o)?;
                }
                // A directory sector arrives full of cleared entries, all on
                // the free set and written out so the on-disk image is
                // consistent before any of them is used.
                let per = self.sector_size / DIRECTORY_ENTRY_SIZE;
                for i in 0..per {
                    let eid = self.directory.add(DirectoryEntry::new());
                    self.directory.push_free(eid)?;
                    let bytes = self.directory.get(eid)?.bytes()?;
                    self.sectors
                        .get_mut(id)?
                        .write_bytes(i * DIRECTORY_ENTRY_SIZE, &bytes)?;
                }
                if !is_regular_sect(self.header.first_directory_sector_location) {
                    self.header.first_directory_sector_location =
                        self.memory.get(MemoryRole::DirectoryTable, 0)?;
                    self.header.dirty = true;
                }
                if self.header.version() == MajorVersion::Version4 {
                    self.header.num_directory_sectors =
                        self.memory.len(MemoryRole::DirectoryTable) as u32;
                    self.header.dirty = true;
                }
                Ok(id)
            }
            SectorKind::MiniFatTable => {
                let id = self.add_sector(SectorKind::Data)?;
                match self.memory.last(MemoryRole::MiniFatTable) {
                    None => {
                        self.header.first_mini_fat_sector_location = id;
                        self.header.dirty = true;
                    }
                    Some(o) => {
                        self.sectors.get_mut(o)?.next = id;
                        self.memory.change_fat(&mut self.sectors, o)?;
                    }
                }
                self.memory
                    .add(&mut self.sectors, id, MemoryRole::MiniFatTable)?;
                self.sectors.get_mut(id)?.next = END_OF_CHAIN;
                self.header.num_mini_fat_sectors =
                    self.memory.len(MemoryRole::MiniFatTable) as u32;
                self.header.dirty = true;
                self.memory.change_fat(&mut self.sectors, id)?;
                for i in 0..self.sector_size / UINT32_SIZE {
                    self.sectors
                        .get_mut(id)?
                        .write_u32(i * UINT32_SIZE, FREE_SECT)?;
                }
                debug!("added mini-FAT table sector {id}");
                Ok(id)
            }
            SectorKind::MiniHost => {
                if self.memory.count_u32(MemoryRole::MiniFatTable) <= self.mini.len() {
                    self.add_sector(SectorKind::MiniFatTable)?;
                }
                let old_host = self.mini.last_host();
                let id = self.add_sector(SectorKind::Data)?;
                {
                    let s = self.sectors.get_mut(id)?;
                    s.kind = SectorKind::MiniHost;
                    s.next = END_OF_CHAIN;
                }
                self.memory.change_fat(&mut self.sectors, id)?;
                match old_host {
                    None => {
                        self.directory.get_mut(0)?.start_sector_location = id;
                    }
                    Some(h) => {
                        self.sectors.get_mut(h)?.next = id;
                        self.memory.change_fat(&mut self.sectors, h)?;
                    }
                }
                // The mini stream grew by a whole host sector; the root entry
                // carries its byte length.
                let sector_size = self.sector_size as u64;
                self.directory.get_mut(0)?.size += sector_size;
                self.update_directory(0)?;

                let per = self.sector_size / MINI_SECTOR_SIZE;
                for i in 0..per {
                    let mid = self.mini.add(id, i * MINI_SECTOR_SIZE);
                    self.mini.push_free(mid)?;
                    let mini = self.mini.get(mid)?;
                    self.memory.change_mini_fat(&mut self.sectors, mini)?;
                }
                debug!("added mini stream host sector {id}");
                Ok(id)
            }
            SectorKind::DifatTable => Err(OleError::Internal(
                "DIFAT sectors are allocated by the FAT table path".into(),
            )),
        }
    }

    /// Records FAT table number `count` (1-based) in the DIFAT sector chain,
    /// allocating a new DIFAT sector when the existing ones are saturated.
    fn register_fat_in_difat(&mut self, fat_id: u32, count: usize) -> OleResult<()> {
        let slots = self.sector_size / UINT32_SIZE - 1;
        let extra = count - self.header.difat.len() - 1;
        let index = extra / slots;
        let offset = extra % slots;
        if index >= self.memory.len(MemoryRole::Difat) {
            let old = self.memory.last(MemoryRole::Difat);
            let mut d = Sector::new(self.sector_size);
            d.data = Some(vec![0u8; self.sector_size]);
            d.dirty = true;
            let did = self.sectors.add(d);
            {
                let s = self.sectors.get_mut(did)?;
                s.write_u32(0, fat_id)?;
                for i in 1..slots {
                    s.write_u32(i * UINT32_SIZE, FREE_SECT)?;
                }
                // last slot chains to the next DIFAT sector
                s.write_u32(slots * UINT32_SIZE, END_OF_CHAIN)?;
            }
            match old {
                Some(o) => {
                    let last_slot = self.sector_size - UINT32_SIZE;
                    self.sectors.get_mut(o)?.write_u32(last_slot, did)?;
                }
                None => {
                    self.header.first_difat_sector_location = did;
                }
            }
            self.memory.add(&mut self.sectors, did, MemoryRole::Difat)?;
            self.header.num_difat_sectors = self.memory.len(MemoryRole::Difat) as u32;
            self.header.dirty = true;
            self.memory.change_fat(&mut self.sectors, did)?;
            debug!("added DIFAT sector {did}");
        } else {
            let d = self.memory.get(MemoryRole::Difat, index)?;
            self.sectors
                .get_mut(d)?
                .write_u32(offset * UINT32_SIZE, fat_id)?;
        }
        Ok(())
    }

    /// Takes a free mini-sector, growing the mini stream by one host sector
    /// when none is available.
    pub(crate) fn add_mini_sector(&mut self) -> OleResult<u32> {
        if let Some(id) = self.mini.pop_free() {
            return Ok(id);
        }
        self.add_sector(SectorKind::MiniHost)?;
        self.mini.pop_free().ok_or_else(|| {
            OleError::Internal("mini host sector produced no free mini-sectors".into())
        })
    }

    /// Returns a FAT chain to the free list, publishing FREESECT for each
    /// sector. Stops at ENDOFCHAIN or once the chain's sector count for
    /// `size` bytes has been released.
    pub(crate) fn free_fat(&mut self, start: u32, size: u64) -> OleResult<()> {
        if !is_regular_sect(start) || size == 0 {
            return Err(OleError::Internal(format!(
                "cannot free FAT chain at {start:#x} of {size} bytes"
            )));
        }
        let mut remaining = size.div_ceil(self.sector_size as u64);
        let mut sec = start;
        while remaining > 0 && is_regular_sect(sec) {
            let next = self.sectors.get(sec)?.next;
            self.memory.push(&mut self.sectors, sec)?;
            self.memory.change_fat(&mut self.sectors, sec)?;
            remaining -= 1;
            sec = next;
        }
        Ok(())
    }

    /// Mini-FAT counterpart of `free_fat`.
    pub(crate) fn free_mini_fat(&mut self, start: u32, size: u64) -> OleResult<()> {
        if !is_regular_sect(start) || size == 0 {
            return Err(OleError::Internal(format!(
                "cannot free mini-FAT chain at {start:#x} of {size} bytes"
            )));
        }
        let mut remaining = size.div_ceil(MINI_SECTOR_SIZE as u64);
        let mut sec = start;
        while remaining > 0 && is_regular_sect(sec) {
            let next = self.mini.get(sec)?.next();
            self.mini.push_free(sec)?;
            let mini = self.mini.get(sec)?;
            self.memory.change_mini_fat(&mut self.sectors, mini)?;
            remaining -= 1;
            sec = next;
        }
        Ok(())
    }

    // ---------- directory ----------

    /// Allocates a directory entry (reusing a freed slot when one exists) and
    /// fills in name, type, CLSID and timestamps.
    pub(crate) fn new_directory_entry(
        &mut self,
        name: &str,
        object_type: ObjectType,
    ) -> OleResult<u32> {
        check_name(name)?;
        let id = match self.directory.pop_free() {
            Some(id) => id,
            None => {
                self.add_sector(SectorKind::DirectoryTable)?;
                self.directory.pop_free().ok_or_else(|| {
                    OleError::Internal("directory growth produced no free entry".into())
                })?
            }
        };
        let de = self.directory.get_mut(id)?;
        de.set_name(name)?;
        de.object_type = object_type;
        de.new_guid();
        de.color = Color::Black;
        de.touch();
        Ok(id)
    }

    /// Rewrites one directory entry into its slot of the directory table
    /// chain.
    pub(crate) fn update_directory(&mut self, id: u32) -> OleResult<()> {
        let per = self.sector_size / DIRECTORY_ENTRY_SIZE;
        let index = id as usize / per;
        let offset = id as usize % per;
        if index >= self.memory.len(MemoryRole::DirectoryTable) {
            return Err(OleError::Internal(format!(
                "no directory sector allocated for entry {id}"
            )));
        }
        let table = self.memory.get(MemoryRole::DirectoryTable, index)?;
        let bytes = self.directory.get(id)?.bytes()?;
        self.sectors
            .get_mut(table)?
            .write_bytes(offset * DIRECTORY_ENTRY_SIZE, &bytes)
    }

    /// Frees an entry and everything it owns: a stream's chain, or a deleted
    /// storage's whole subtree of children. Each released entry is zeroed on
    /// disk and returned to the free set.
    pub(crate) fn release_entry(&mut self, id: u32) -> OleResult<()> {
        let cutoff = self.header.mini_stream_cutoff_size as u64;
        let total = self.directory.len();
        let mut pending = vec![id];
        let mut victims: Vec<u32> = Vec::new();
        while let Some(e) = pending.pop() {
            if victims.len() > total {
                return Err(OleError::Corrupt("directory sibling graph cycle".into()));
            }
            victims.push(e);
            let (object_type, child) = {
                let de = self.directory.get(e)?;
                (de.object_type, de.child_id)
            };
            if object_type == ObjectType::Storage && child != NO_STREAM {
                let mut stack = vec![child];
                while let Some(c) = stack.pop() {
                    if pending.len() + victims.len() > total {
                        return Err(OleError::Corrupt("directory sibling graph cycle".into()));
                    }
                    pending.push(c);
                    let de = self.directory.get(c)?;
                    if de.left_sibling_id != NO_STREAM {
                        stack.push(de.left_sibling_id);
                    }
                    if de.right_sibling_id != NO_STREAM {
                        stack.push(de.right_sibling_id);
                    }
                }
            }
        }
        for v in victims {
            let (object_type, start, size) = {
                let de = self.directory.get(v)?;
                (de.object_type, de.start_sector_location, de.size)
            };
            if object_type == ObjectType::Stream && size > 0 && is_regular_sect(start) {
                if size < cutoff {
                    self.free_mini_fat(start, size)?;
                } else {
                    self.free_fat(start, size)?;
                }
            }
            self.directory.push_free(v)?;
            self.update_directory(v)?;
        }
        Ok(())
    }

    // ---------- stream data ----------

    /// Rewrites a stream's contents, reusing its chain where possible and
    /// switching between the mini and regular allocators around the 4096-byte
    /// cutoff.
    pub(crate) fn write_stream_data(&mut self, id: u32, data: &[u8]) -> OleResult<()> {
        let cutoff = self.header.mini_stream_cutoff_size as u64;
        let (mut old_size, start0) = {
            let de = self.directory.get(id)?;
            (de.size, de.start_sector_location)
        };
        let mut start = start0;
        let new_size = data.len() as u64;
        let mut update_de = false;

        if old_size >= cutoff && new_size < cutoff {
            self.free_fat(start, old_size)?;
            old_size = 0;
            start = END_OF_CHAIN;
            update_de = true;
        } else if old_size > 0 && old_size < cutoff && (new_size >= cutoff || new_size == 0) {
            self.free_mini_fat(start, old_size)?;
            old_size = 0;
            start = END_OF_CHAIN;
            update_de = true;
        }

        if new_size == 0 {
            let de = self.directory.get_mut(id)?;
            de.size = 0;
            de.start_sector_location = END_OF_CHAIN;
            return self.update_directory(id);
        }

        if new_size >= cutoff {
            let sector_size = self.sector_size as u64;
            let mut offset: u64 = 0;
            let mut sec = start;
            let mut prev: Option<u32> = None;
            let mut last: u32 = 0;
            while offset < new_size {
                let cur = if old_size > offset && is_regular_sect(sec) {
                    if self.sectors.get(sec)?.data.is_none() {
                        let size = self.sector_size;
                        self.sectors.get_mut(sec)?.data = Some(vec![0u8; size]);
                    }
                    sec
                } else {
                    let fresh = self.add_sector(SectorKind::Data)?;
                    match prev {
                        Some(p) => {
                            self.sectors.get_mut(p)?.next = fresh;
                            self.memory.change_fat(&mut self.sectors, p)?;
                        }
                        None => {
                            self.directory.get_mut(id)?.start_sector_location = fresh;
                            update_de = true;
                        }
                    }
                    fresh
                };
                let chunk_end = (offset + sector_size).min(new_size) as usize;
                self.sectors
                    .get_mut(cur)?
                    .write_bytes(0, &data[offset as usize..chunk_end])?;
                offset += sector_size;
                sec = self.sectors.get(cur)?.next;
                prev = Some(cur);
                last = cur;
            }
            let old_next = self.sectors.get(last)?.next;
            self.sectors.get_mut(last)?.next = END_OF_CHAIN;
            self.memory.change_fat(&mut self.sectors, last)?;
            if is_regular_sect(old_next) && offset < old_size {
                self.free_fat(old_next, old_size - offset)?;
            }
        } else {
            let mini_size = MINI_SECTOR_SIZE as u64;
            let mut offset: u64 = 0;
            let mut sec = start;
            let mut prev: Option<u32> = None;
            let mut last: u32 = 0;
            while offset < new_size {
                let cur = if old_size > offset && is_regular_sect(sec) {
                    sec
                } else {
                    let fresh = self.add_mini_sector()?;
                    self.mini.get_mut(fresh)?.next = END_OF_CHAIN;
                    match prev {
                        Some(p) => {
                            self.mini.get_mut(p)?.next = fresh;
                            let mini = self.mini.get(p)?;
                            self.memory.change_mini_fat(&mut self.sectors, mini)?;
                        }
                        None => {
                            self.directory.get_mut(id)?.start_sector_location = fresh;
                            update_de = true;
                        }
                    }
                    fresh
                };
                let (host, host_offset) = {
                    let m = self.mini.get(cur)?;
                    (m.host, m.offset)
                };
                self.ensure_sector_data(host)?;
                let chunk_end = (offset + mini_size).min(new_size) as usize;
                self.sectors
                    .get_mut(host)?
                    .write_bytes(host_offset, &data[offset as usize..chunk_end])?;
                offset += mini_size;
                sec = self.mini.get(cur)?.next();
                prev = Some(cur);
                last = cur;
            }
            let old_next = self.mini.get(last)?.next();
            self.mini.get_mut(last)?.next = END_OF_CHAIN;
            let mini = self.mini.get(last)?;
            self.memory.change_mini_fat(&mut self.sectors, mini)?;
            if is_regular_sect(old_next) && offset < old_size {
                self.free_mini_fat(old_next, old_size - offset)?;
            }
        }

        {
            let de = self.directory.get_mut(id)?;
            if de.size != new_size {
                de.size = new_size;
                update_de = true;
            }
        }
        if update_de {
            self.update_directory(id)?;
        }
        Ok(())
    }

    /// Materializes a stream's whole contents.
    pub(crate) fn read_stream_data(&mut self, id: u32) -> OleResult<Vec<u8>> {
        let (size, start) = {
            let de = self.directory.get(id)?;
            (de.size, de.start_sector_location)
        };
        let cutoff = self.header.mini_stream_cutoff_size as u64;
        if size == 0 {
            return Ok(Vec::new());
        }
        if !is_regular_sect(start) {
            return Err(OleError::Corrupt(format!(
                "stream start sector {start:#x} is invalid"
            )));
        }
        let len = size as usize;
        let mut out = vec![0u8; len];
        if size < cutoff {
            let mut sec = start;
            let mut offset = 0usize;
            while offset < len {
                if !is_regular_sect(sec) {
                    return Err(OleError::Corrupt(
                        "mini-FAT chain ends before stream size".into(),
                    ));
                }
                let (host, host_offset, next) = {
                    let m = self.mini.get(sec)?;
                    (m.host, m.offset, m.next)
                };
                self.ensure_sector_data(host)?;
                let n = MINI_SECTOR_SIZE.min(len - offset);
                let payload = self.sectors.get(host)?.data.as_ref().ok_or_else(|| {
                    OleError::Internal(format!("host sector {host} has no payload"))
                })?;
                out[offset..offset + n].copy_from_slice(&payload[host_offset..host_offset + n]);
                offset += MINI_SECTOR_SIZE;
                sec = next;
            }
        } else {
            let mut sec = start;
            let mut offset = 0usize;
            while offset < len {
                if !is_regular_sect(sec) {
                    return Err(OleError::Corrupt(
                        "FAT chain ends before stream size".into(),
                    ));
                }
                self.ensure_sector_data(sec)?;
                let s = self.sectors.get(sec)?;
                let payload = s.data.as_ref().ok_or_else(|| {
                    OleError::Internal(format!("sector {sec} has no payload"))
                })?;
                let n = self.sector_size.min(len - offset);
                out[offset..offset + n].copy_from_slice(&payload[..n]);
                offset += self.sector_size;
                sec = s.next();
            }
        }
        Ok(out)
    }

    // ---------- persistence ----------

    /// Writes the dirty header and every dirty sector back to the backing
    /// file, in place. Never truncates.
    pub fn commit(&mut self) -> OleResult<()> {
        let file = self.file.as_ref().ok_or_else(|| {
            OleError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no backing file to commit to",
            ))
        })?;
        if self.header.dirty {
            let bytes = self.header.bytes()?;
            write_at(file, 0, &bytes)?;
            self.header.dirty = false;
        }
        let sector_size = self.sector_size;
        let zeros = vec![0u8; sector_size];
        let mut written = 0usize;
        for s in self.sectors.iter_mut() {
            if !s.dirty {
                continue;
            }
            let offset = HEADER_SIZE as u64 + s.id() as u64 * sector_size as u64;
            let payload = s.data.as_deref().unwrap_or(&zeros);
            write_at(file, offset, payload)?;
            s.dirty = false;
            written += 1;
        }
        // everything is on disk now, including sectors appended since open
        self.disk_sector_count = self.sectors.len();
        debug!("committed {written} dirty sectors");
        Ok(())
    }

    /// Writes the whole file image to `path`: header, then every sector in
    /// id order. Dirty flags are not consulted or cleared.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> OleResult<()> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.sectors.len() * self.sector_size);
        out.extend_from_slice(&self.header.bytes()?);
        for id in 0..self.sectors.len() as u32 {
            if self.sectors.get(id)?.data.is_none()
                && self.file.is_some()
                && (id as usize) < self.disk_sector_count
            {
                self.ensure_sector_data(id)?;
            }
            match self.sectors.get(id)?.data.as_ref() {
                Some(payload) => out.extend_from_slice(payload),
                // a freed sector with no cached payload has no bytes worth
                // keeping
                None => out.resize(out.len() + self.sector_size, 0),
            }
        }
        fs::write(path, out)?;
        Ok(())
    }
}

fn write_at(mut file: &File, offset: u64, buf: &[u8]) -> OleResult<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)?;
    Ok(())
}
