use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use log::trace;

use crate::common::{OleError, OleResult, DIF_SECT, FAT_SECT, FREE_SECT, UINT32_SIZE};
use crate::mini_sector::MiniSector;
use crate::sector::{SectorCollection, SectorKind};

/// Allocation role of a sector. A sector belongs to at most one bucket at a
/// time; the FAT-table bucket is what gives the O(1) sector-id to FAT-slot
/// mapping used by `change_fat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRole {
    FatTable,
    MiniFatTable,
    DirectoryTable,
    Difat,
    Free,
}

const ROLE_COUNT: usize = 5;

impl MemoryRole {
    fn index(self) -> usize {
        match self {
            MemoryRole::FatTable => 0,
            MemoryRole::MiniFatTable => 1,
            MemoryRole::DirectoryTable => 2,
            MemoryRole::Difat => 3,
            MemoryRole::Free => 4,
        }
    }
}

impl Display for MemoryRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MemoryRole::FatTable => write!(f, "table FAT"),
            MemoryRole::MiniFatTable => write!(f, "table mini FAT"),
            MemoryRole::DirectoryTable => write!(f, "directory"),
            MemoryRole::Difat => write!(f, "DIFAT"),
            MemoryRole::Free => write!(f, "free"),
        }
    }
}

/// Classifies sectors into role buckets and maintains the free list. Table
/// writes go through the sector store passed to each call; the buckets only
/// hold sector ids.
pub struct Memory {
    buckets: [Vec<u32>; ROLE_COUNT],
    owner: HashMap<u32, MemoryRole>,
    sector_size: usize,
}

impl Memory {
    pub fn new(sector_size: usize) -> Self {
        Memory {
            buckets: Default::default(),
            owner: HashMap::new(),
            sector_size,
        }
    }

    /// Files a sector under `role`, tagging its kind and, for self-marking
    /// roles, its next pointer. Double insertion is a defect.
    pub fn add(
        &mut self,
        sectors: &mut SectorCollection,
        id: u32,
        role: MemoryRole,
    ) -> OleResult<()> {
        if let Some(current) = self.owner.get(&id) {
            return Err(OleError::Internal(format!(
                "sector {id} already filed under {current}"
            )));
        }
        let sector = sectors.get_mut(id)?;
        if role != MemoryRole::Free && sector.data.is_none() {
            return Err(OleError::Internal(format!(
                "sector {id} filed under {role} before its payload was read"
            )));
        }
        match role {
            MemoryRole::FatTable => {
                sector.kind = SectorKind::FatTable;
                sector.next = FAT_SECT;
            }
            MemoryRole::MiniFatTable => sector.kind = SectorKind::MiniFatTable,
            MemoryRole::DirectoryTable => sector.kind = SectorKind::DirectoryTable,
            MemoryRole::Difat => {
                sector.kind = SectorKind::DifatTable;
                sector.next = DIF_SECT;
            }
            MemoryRole::Free => {
                sector.kind = SectorKind::Data;
                sector.next = FREE_SECT;
            }
        }
        self.buckets[role.index()].push(id);
        self.owner.insert(id, role);
        Ok(())
    }

    pub fn get(&self, role: MemoryRole, index: usize) -> OleResult<u32> {
        self.buckets[role.index()]
            .get(index)
            .copied()
            .ok_or_else(|| {
                OleError::Internal(format!("no sector at index {index} of {role} memory"))
            })
    }

    pub fn last(&self, role: MemoryRole) -> Option<u32> {
        self.buckets[role.index()].last().copied()
    }

    pub fn find(&self, id: u32) -> Option<MemoryRole> {
        self.owner.get(&id).copied()
    }

    pub fn len(&self, role: MemoryRole) -> usize {
        self.buckets[role.index()].len()
    }

    pub fn is_empty(&self, role: MemoryRole) -> bool {
        self.buckets[role.index()].is_empty()
    }

    /// Total 32-bit slots across the table sectors of `role`.
    pub fn count_u32(&self, role: MemoryRole) -> usize {
        self.len(role) * self.sector_size / UINT32_SIZE
    }

    /// Every 32-bit word of the concatenated table sectors of `role`, in
    /// bucket order. Used at load to reconstruct next pointers.
    pub fn collect_u32(
        &self,
        sectors: &SectorCollection,
        role: MemoryRole,
    ) -> OleResult<Vec<u32>> {
        let mut words = Vec::with_capacity(self.count_u32(role));
        for &id in &self.buckets[role.index()] {
            let sector = sectors.get(id)?;
            let data = sector.data.as_ref().ok_or_else(|| {
                OleError::Internal(format!("{role} sector {id} has no payload"))
            })?;
            for chunk in data.chunks_exact(UINT32_SIZE) {
                words.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
        }
        Ok(words)
    }

    /// Writes `next` of sector `id` into its FAT slot: table sector
    /// `id / (sectorSize/4)`, word offset `id % (sectorSize/4)`. The table
    /// sector must already exist.
    pub fn change_fat(&self, sectors: &mut SectorCollection, id: u32) -> OleResult<()> {
        let value = sectors.get(id)?.next();
        if (value as i32) < -4 {
            return Err(OleError::Internal(format!(
                "refusing to publish reserved FAT value {value:#x} for sector {id}"
            )));
        }
        let per_sector = self.sector_size / UINT32_SIZE;
        let index = id as usize / per_sector;
        let offset = id as usize % per_sector;
        let table = self.get(MemoryRole::FatTable, index).map_err(|_| {
            OleError::Internal(format!("no FAT table sector covers sector {id}"))
        })?;
        sectors
            .get_mut(table)?
            .write_u32(offset * UINT32_SIZE, value)
    }

    /// Mini-FAT variant of `change_fat`, same arithmetic over the mini-FAT
    /// table bucket.
    pub fn change_mini_fat(
        &self,
        sectors: &mut SectorCollection,
        mini: &MiniSector,
    ) -> OleResult<()> {
        let id = mini.id();
        let value = mini.next();
        if (value as i32) < -4 {
            return Err(OleError::Internal(format!(
                "refusing to publish reserved mini-FAT value {value:#x} for mini-sector {id}"
            )));
        }
        let per_sector = self.sector_size / UINT32_SIZE;
        let index = id as usize / per_sector;
        let offset = id as usize % per_sector;
        let table = self.get(MemoryRole::MiniFatTable, index).map_err(|_| {
            OleError::Internal(format!("no mini-FAT table sector covers mini-sector {id}"))
        })?;
        sectors
            .get_mut(table)?
            .write_u32(offset * UINT32_SIZE, value)
    }

    /// Takes the oldest freed sector, if any.
    pub fn pop(&mut self) -> Option<u32> {
        let free = &mut self.buckets[MemoryRole::Free.index()];
        if free.is_empty() {
            return None;
        }
        let id = free.remove(0);
        self.owner.remove(&id);
        trace!("reusing free sector {id}");
        Some(id)
    }

    /// Frees a sector: next becomes FREESECT, the cached payload is dropped,
    /// and the sector joins the free bucket. Double-freeing is a defect.
    pub fn push(&mut self, sectors: &mut SectorCollection, id: u32) -> OleResult<()> {
        self.add(sectors, id, MemoryRole::Free)?;
        sectors.get_mut(id)?.data = None;
        trace!("sector {id} freed");
        Ok(())
    }
}
