use std::collections::BTreeSet;
use std::fmt::{self, Debug, Formatter};

use crate::common::{describe_sect, OleError, OleResult, FREE_SECT};

/// Mini-stream sectors are 64 bytes.
///
/// https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cfb/c5d235f7-b73c-4ec5-bf8d-5c08306cd023
pub const MINI_SECTOR_SIZE: usize = 64;

/// One 64-byte allocation unit inside the mini stream. Its bytes live in a
/// host sector of the root storage chain, at `offset` within that sector.
#[derive(Clone)]
pub struct MiniSector {
    pub(crate) id: u32,
    pub(crate) host: u32,
    pub(crate) offset: usize,
    pub(crate) next: u32,
}

impl MiniSector {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn next(&self) -> u32 {
        self.next
    }
}

impl Debug for MiniSector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let comment = describe_sect(self.next);
        write!(
            f,
            "MiniSector {{ id: {}, host: {}, offset: {}, next: {} {} }}",
            self.id, self.host, self.offset, self.next, comment
        )
    }
}

/// Store of every mini-sector, plus the set of free ones. Mini-sectors are
/// created a whole host sector at a time and never destroyed.
pub struct MiniSectorCollection {
    data: Vec<MiniSector>,
    free: BTreeSet<u32>,
}

impl MiniSectorCollection {
    pub fn new() -> Self {
        MiniSectorCollection {
            data: Vec::new(),
            free: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn add(&mut self, host: u32, offset: usize) -> u32 {
        let id = self.data.len() as u32;
        self.data.push(MiniSector {
            id,
            host,
            offset,
            next: FREE_SECT,
        });
        id
    }

    pub fn get(&self, id: u32) -> OleResult<&MiniSector> {
        self.data
            .get(id as usize)
            .ok_or(OleError::IndexOutOfRange(id))
    }

    pub fn get_mut(&mut self, id: u32) -> OleResult<&mut MiniSector> {
        self.data
            .get_mut(id as usize)
            .ok_or(OleError::IndexOutOfRange(id))
    }

    /// Host sector of the most recently created mini-sector, if any.
    pub(crate) fn last_host(&self) -> Option<u32> {
        self.data.last().map(|m| m.host)
    }

    /// Takes the lowest-id free mini-sector.
    pub fn pop_free(&mut self) -> Option<u32> {
        let id = *self.free.iter().next()?;
        self.free.remove(&id);
        Some(id)
    }

    /// Returns a mini-sector to the free set. Double-freeing is a defect.
    pub fn push_free(&mut self, id: u32) -> OleResult<()> {
        if id as usize >= self.data.len() {
            return Err(OleError::IndexOutOfRange(id));
        }
        if !self.free.insert(id) {
            return Err(OleError::Internal(format!(
                "mini-sector {id} already in free set"
            )));
        }
        self.data[id as usize].next = FREE_SECT;
        Ok(())
    }
}

impl Default for MiniSectorCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_set_reuses_lowest_id_first() {
        let mut minis = MiniSectorCollection::new();
        for i in 0..8 {
            let id = minis.add(3, i * MINI_SECTOR_SIZE);
            minis.push_free(id).unwrap();
        }
        assert_eq!(minis.pop_free(), Some(0));
        assert_eq!(minis.pop_free(), Some(1));
        minis.push_free(0).unwrap();
        assert_eq!(minis.pop_free(), Some(0));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut minis = MiniSectorCollection::new();
        let id = minis.add(0, 0);
        minis.push_free(id).unwrap();
        assert!(minis.push_free(id).is_err());
    }
}
