// Swap device: a fixed arena of page-sized slots (8 sectors each) on a
// dedicated block device, tracked by a bitmap. One mutex serializes the
// bitmap and the slot I/O; the workload is modest enough that holding
// it across a transfer is fine. Running out of swap is fatal.

use crate::block::BlockDevice;
use crate::kalloc::Page;
use crate::param::{PG_SECTORS, SECTOR_SIZE};
use crate::sync::Mutex;
use log::warn;
use std::sync::Arc;

pub struct SwapTable {
    dev: Arc<dyn BlockDevice>,
    map: Mutex<Vec<u8>>,
}

impl SwapTable {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let slots = dev.size() as usize / PG_SECTORS;
        Self {
            dev,
            map: Mutex::new(vec![0; (slots + 7) / 8], "swap"),
        }
    }

    pub fn slots(&self) -> usize {
        self.dev.size() as usize / PG_SECTORS
    }

    pub fn used_slots(&self) -> usize {
        self.map.lock().iter().map(|b| b.count_ones() as usize).sum()
    }

    fn scan_and_set(map: &mut [u8], slots: usize) -> Option<usize> {
        for slot in 0..slots {
            let (i, m) = (slot / 8, 1 << (slot % 8));
            if map[i] & m == 0 {
                map[i] |= m;
                return Some(slot);
            }
        }
        None
    }

    // Writes a frame out and returns the slot holding it.
    pub fn dump(&self, page: &Page) -> usize {
        let mut map = self.map.lock();
        let slot = match Self::scan_and_set(&mut map, self.slots()) {
            Some(slot) => slot,
            None => {
                warn!("swap: all {} slots in use", self.slots());
                panic!("swap device is full");
            }
        };
        let base = (slot * PG_SECTORS) as u32;
        for i in 0..PG_SECTORS {
            let from = i * SECTOR_SIZE;
            let mut sec = [0u8; SECTOR_SIZE];
            sec.copy_from_slice(&page[from..from + SECTOR_SIZE]);
            self.dev.write(base + i as u32, &sec);
        }
        slot
    }

    // Reads a slot back into a frame and frees it.
    pub fn load(&self, slot: usize, page: &mut Page) {
        let mut map = self.map.lock();
        let (i, m) = (slot / 8, 1 << (slot % 8));
        assert!(map[i] & m != 0, "loading free swap slot {}", slot);
        let base = (slot * PG_SECTORS) as u32;
        for s in 0..PG_SECTORS {
            let mut sec = [0u8; SECTOR_SIZE];
            self.dev.read(base + s as u32, &mut sec);
            page[s * SECTOR_SIZE..(s + 1) * SECTOR_SIZE].copy_from_slice(&sec);
        }
        map[i] &= !m;
    }

    // Drops a slot without reading it, for process teardown.
    pub fn free_slot(&self, slot: usize) {
        let mut map = self.map.lock();
        let (i, m) = (slot / 8, 1 << (slot % 8));
        assert!(map[i] & m != 0, "freeing free swap slot {}", slot);
        map[i] &= !m;
    }

    // Copies a slot's contents into a fresh slot (fork of a swapped-out
    // page).
    pub fn duplicate(&self, slot: usize) -> usize {
        let mut map = self.map.lock();
        let (i, m) = (slot / 8, 1 << (slot % 8));
        assert!(map[i] & m != 0, "duplicating free swap slot {}", slot);
        let copy = match Self::scan_and_set(&mut map, self.slots()) {
            Some(s) => s,
            None => panic!("swap device is full"),
        };
        let src = (slot * PG_SECTORS) as u32;
        let dst = (copy * PG_SECTORS) as u32;
        for s in 0..PG_SECTORS {
            let mut sec = [0u8; SECTOR_SIZE];
            self.dev.read(src + s as u32, &mut sec);
            self.dev.write(dst + s as u32, &sec);
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;
    use crate::kalloc::UserPool;

    #[test]
    fn dump_then_load_round_trips_and_frees() {
        let swap = SwapTable::new(MemDisk::new(64));
        let pool = UserPool::new(1);
        let pfn = pool.alloc().unwrap();

        {
            let mut page = pool.page(pfn).lock();
            for (i, b) in page.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
        }
        let slot = {
            let page = pool.page(pfn).lock();
            swap.dump(&page)
        };
        assert_eq!(swap.used_slots(), 1);

        {
            let mut page = pool.page(pfn).lock();
            page.fill(0);
            swap.load(slot, &mut page);
            for (i, b) in page.iter().enumerate() {
                assert_eq!(*b, (i % 251) as u8);
            }
        }
        // Idempotence: the slot is free again afterwards.
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn duplicate_copies_slot_contents() {
        let swap = SwapTable::new(MemDisk::new(64));
        let pool = UserPool::new(1);
        let pfn = pool.alloc().unwrap();
        {
            let mut page = pool.page(pfn).lock();
            page.fill(0x3c);
        }
        let slot = {
            let page = pool.page(pfn).lock();
            swap.dump(&page)
        };
        let copy = swap.duplicate(slot);
        assert_ne!(slot, copy);
        {
            let mut page = pool.page(pfn).lock();
            page.fill(0);
            swap.load(copy, &mut page);
            assert!(page.iter().all(|&b| b == 0x3c));
        }
        swap.free_slot(slot);
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    #[should_panic(expected = "swap device is full")]
    fn exhaustion_panics() {
        // One page worth of sectors: a single slot.
        let swap = SwapTable::new(MemDisk::new(PG_SECTORS as u32));
        let pool = UserPool::new(1);
        let pfn = pool.alloc().unwrap();
        let page = pool.page(pfn).lock();
        swap.dump(&page);
        swap.dump(&page);
    }
}
