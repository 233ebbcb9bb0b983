// Per-process page table, simulated in software. Maps page-aligned user
// virtual addresses to frames and keeps the WRITABLE / ACCESSED / DIRTY
// bits an MMU would maintain: the user access paths set ACCESSED and
// DIRTY, the eviction scan reads and clears them.

use crate::param::PGSIZE;
use crate::sync::Mutex;
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY = 1 << 2;
    }
}

#[derive(Clone, Copy)]
pub struct Pte {
    pub pfn: usize,
    pub flags: PteFlags,
}

pub fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

pub struct PageTable {
    map: Mutex<HashMap<usize, Pte>>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new(), "page table"),
        }
    }

    // Installs a mapping. Fails if the page is already mapped.
    pub fn map(&self, vpage: usize, pfn: usize, writable: bool) -> bool {
        debug_assert_eq!(vpage % PGSIZE, 0);
        let mut map = self.map.lock();
        if map.contains_key(&vpage) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        map.insert(vpage, Pte { pfn, flags });
        true
    }

    // Removes the mapping so the owner's next access faults. Returns
    // the frame it pointed at.
    pub fn clear(&self, vpage: usize) -> Option<usize> {
        self.map.lock().remove(&vpage).map(|pte| pte.pfn)
    }

    pub fn get(&self, vpage: usize) -> Option<Pte> {
        self.map.lock().get(&vpage).copied()
    }

    pub fn is_accessed(&self, vpage: usize) -> bool {
        self.map
            .lock()
            .get(&vpage)
            .map_or(false, |pte| pte.flags.contains(PteFlags::ACCESSED))
    }

    pub fn set_accessed(&self, vpage: usize, value: bool) {
        if let Some(pte) = self.map.lock().get_mut(&vpage) {
            pte.flags.set(PteFlags::ACCESSED, value);
        }
    }

    pub fn is_dirty(&self, vpage: usize) -> bool {
        self.map
            .lock()
            .get(&vpage)
            .map_or(false, |pte| pte.flags.contains(PteFlags::DIRTY))
    }

    // The access paths call this the way hardware would on a load or a
    // store through the mapping.
    pub fn touch(&self, vpage: usize, write: bool) {
        if let Some(pte) = self.map.lock().get_mut(&vpage) {
            pte.flags |= PteFlags::ACCESSED;
            if write {
                pte.flags |= PteFlags::DIRTY;
            }
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.map.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_clear_and_bits() {
        let pt = PageTable::new();
        assert!(pt.map(0x8000, 3, true));
        assert!(!pt.map(0x8000, 4, true), "double map must fail");

        assert!(!pt.is_accessed(0x8000));
        pt.touch(0x8000, false);
        assert!(pt.is_accessed(0x8000));
        assert!(!pt.is_dirty(0x8000));
        pt.touch(0x8000, true);
        assert!(pt.is_dirty(0x8000));

        pt.set_accessed(0x8000, false);
        assert!(!pt.is_accessed(0x8000));

        assert_eq!(pt.clear(0x8000), Some(3));
        assert_eq!(pt.clear(0x8000), None);
    }

    #[test]
    fn round_down_is_page_aligned() {
        assert_eq!(pg_round_down(0x1fff), 0x1000);
        assert_eq!(pg_round_down(0x2000), 0x2000);
    }
}
