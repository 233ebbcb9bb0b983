// Free-space bitmap, one bit per sector of the filesystem device. The
// map itself persists as a distinguished file whose inode lives at
// FREE_MAP_SECTOR; allocation and release mutate the in-memory copy and
// the file is rewritten on flush (best-effort, like the rest of the
// on-disk state).

use crate::error::{KernelError, Result};
use crate::inode::Inode;
use crate::sync::Mutex;

pub struct FreeMap {
    bits: Mutex<Vec<u8>>,
}

impl FreeMap {
    // A map for a device of `sectors` sectors, everything free. Bits
    // past the end of the device are held permanently allocated.
    pub fn new(sectors: u32) -> Self {
        let len = (sectors as usize + 7) / 8;
        let mut bits = vec![0u8; len];
        for s in sectors as usize..len * 8 {
            bits[s / 8] |= 1 << (s % 8);
        }
        Self {
            bits: Mutex::new(bits, "free map"),
        }
    }

    // Marks `sector` allocated during format (the well-known inode
    // sectors are never handed out).
    pub fn mark(&self, sector: u32) {
        let mut bits = self.bits.lock();
        bits[sector as usize / 8] |= 1 << (sector as usize % 8);
    }

    pub fn allocate_one(&self) -> Result<u32> {
        let mut bits = self.bits.lock();
        for (i, byte) in bits.iter_mut().enumerate() {
            if *byte != 0xff {
                let bit = (!*byte).trailing_zeros() as usize;
                *byte |= 1 << bit;
                return Ok((i * 8 + bit) as u32);
            }
        }
        Err(KernelError::DiskFull)
    }

    pub fn release(&self, sector: u32) {
        let mut bits = self.bits.lock();
        let (i, m) = (sector as usize / 8, 1 << (sector as usize % 8));
        assert!(bits[i] & m != 0, "releasing free sector {}", sector);
        bits[i] &= !m;
    }

    pub fn is_allocated(&self, sector: u32) -> bool {
        let bits = self.bits.lock();
        bits[sector as usize / 8] & (1 << (sector as usize % 8)) != 0
    }

    pub fn free_count(&self) -> usize {
        let bits = self.bits.lock();
        bits.iter().map(|b| b.count_zeros() as usize).sum()
    }

    // Loads the persisted map from its backing file.
    pub fn load(&self, file: &Inode) {
        let mut bits = self.bits.lock();
        let mut buf = vec![0u8; bits.len()];
        let n = file.read_at(&mut buf, 0);
        bits[..n].copy_from_slice(&buf[..n]);
    }

    // Writes the map into its backing file. The write itself may
    // allocate data sectors for the file and flip bits, so loop until
    // the stored image matches the live map.
    pub fn store(&self, file: &Inode) {
        loop {
            let snapshot = self.bits.lock().clone();
            file.write_at(&snapshot, 0);
            if *self.bits.lock() == snapshot {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_marks_and_release_clears() {
        let map = FreeMap::new(64);
        map.mark(0);
        map.mark(1);
        let s = map.allocate_one().unwrap();
        assert_eq!(s, 2);
        assert!(map.is_allocated(s));
        map.release(s);
        assert!(!map.is_allocated(s));
    }

    #[test]
    fn exhaustion_reports_disk_full() {
        let map = FreeMap::new(16);
        for _ in 0..16 {
            map.allocate_one().unwrap();
        }
        assert_eq!(map.allocate_one(), Err(KernelError::DiskFull));
    }

    #[test]
    fn tail_bits_never_allocated() {
        // 10 sectors round up to 2 bitmap bytes; the 6 tail bits must
        // stay out of reach.
        let map = FreeMap::new(10);
        for _ in 0..10 {
            assert!(map.allocate_one().unwrap() < 10);
        }
        assert_eq!(map.allocate_one(), Err(KernelError::DiskFull));
    }
}
