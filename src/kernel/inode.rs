// Indexed inodes.
//
// An inode occupies exactly one sector: 123 direct sector pointers, one
// single-indirect pointer (a sector of 128 pointers) and one
// double-indirect pointer (a sector of 128 single-indirects), giving a
// maximum file of (123 + 128 + 128*128) sectors. A zero pointer is a
// hole: reads of unwritten ranges yield zero bytes without touching the
// free map, writes allocate on demand.
//
// The kernel keeps a table of open inodes keyed by sector so that
// opening the same inode twice returns the same in-memory object. The
// Arc count of a table entry tracks the openers; when the last handle
// drops and the inode was removed, its sectors are freed by descending
// the indirect trees.
//
// All sector access goes through the block cache. Inode metadata
// (length, pointers) lives in the cached inode sector itself and is
// read under a SHARED lock and updated under an EXCLUSIVE one.

use crate::cache::{CacheGuard, LockMode};
use crate::error::{KernelError, Result};
use crate::filesys::FsInner;
use crate::param::{
    DIRECT_CNT, INODE_MAGIC, INODE_PTRS, MAX_FILE_BYTES, PTRS_PER_SECTOR, SECTOR_SIZE,
};
use crate::sync::{Condvar, Mutex, MutexGuard};
use core::mem;
use static_assertions::const_assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IType {
    File = 0,
    Dir = 1,
}

// On-disk inode. Must be exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
pub struct DiskInode {
    // 123 direct pointers, then the single- and the double-indirect.
    pub sectors: [u32; INODE_PTRS],
    pub itype: u32,
    pub length: u32,
    pub magic: u32,
}

const_assert_eq!(mem::size_of::<DiskInode>(), SECTOR_SIZE);

// In-memory state shared by every opener of one inode.
pub struct OpenInode {
    sector: u32,
    removed: AtomicBool,
    // Serializes multi-step operations on this inode, e.g. directory
    // entry add/remove.
    lock: Mutex<()>,
    write: Mutex<WriteState>,
    no_writers: Condvar,
}

struct WriteState {
    writers: u32,
    deny_cnt: u32,
}

impl OpenInode {
    fn new(sector: u32) -> Arc<Self> {
        Arc::new(Self {
            sector,
            removed: AtomicBool::new(false),
            lock: Mutex::new((), "inode"),
            write: Mutex::new(
                WriteState {
                    writers: 0,
                    deny_cnt: 0,
                },
                "deny write",
            ),
            no_writers: Condvar::new(),
        })
    }
}

// Open-inode table: repeated opens of one sector share one OpenInode.
pub struct InodeTable {
    map: Mutex<HashMap<u32, Arc<OpenInode>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new(), "open inodes"),
        }
    }

    fn get(&self, sector: u32) -> Arc<OpenInode> {
        let mut map = self.map.lock();
        Arc::clone(map.entry(sector).or_insert_with(|| OpenInode::new(sector)))
    }

    // Drops one reference. On the last one the entry is recycled, and a
    // removed inode gives its sectors back to the free map.
    fn put(&self, fs: &FsInner, ip: Arc<OpenInode>) {
        let mut map = self.map.lock();
        // The dropped handle plus the table itself.
        if Arc::strong_count(&ip) == 2 {
            map.remove(&ip.sector);
            drop(map);
            if ip.removed.load(Ordering::Acquire) {
                erase(fs, ip.sector);
            }
        }
    }
}

// A handle on an open inode. Clone reopens; Drop closes.
pub struct Inode {
    fs: Arc<FsInner>,
    ip: Option<Arc<OpenInode>>,
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        Self {
            fs: Arc::clone(&self.fs),
            ip: self.ip.clone(),
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let ip = self.ip.take().unwrap();
        self.fs.itable.put(&self.fs, ip);
    }
}

impl Inode {
    // Writes a fresh inode of `itype` to `sector` and opens it. The
    // length is recorded up front; the data sectors stay holes until
    // written, so a large empty file costs one sector.
    pub(crate) fn create_at(
        fs: &Arc<FsInner>,
        sector: u32,
        itype: IType,
        length: u32,
    ) -> Inode {
        let mut guard = fs.cache.lock(sector, LockMode::Exclusive);
        {
            let mut data = guard.setzero();
            let di = LayoutVerified::<&mut [u8], DiskInode>::new(&mut data[..])
                .unwrap()
                .into_mut();
            di.itype = itype as u32;
            di.length = length;
            di.magic = INODE_MAGIC;
        }
        drop(guard);
        Self::open(fs, sector)
    }

    // Allocates a sector for a new inode and initializes it.
    pub fn create(fs: &Arc<FsInner>, itype: IType, length: u32) -> Result<Inode> {
        let sector = fs.freemap.allocate_one()?;
        Ok(Self::create_at(fs, sector, itype, length))
    }

    pub fn open(fs: &Arc<FsInner>, sector: u32) -> Inode {
        Inode {
            fs: Arc::clone(fs),
            ip: Some(fs.itable.get(sector)),
        }
    }

    pub fn reopen(&self) -> Inode {
        self.clone()
    }

    fn ip(&self) -> &Arc<OpenInode> {
        self.ip.as_ref().unwrap()
    }

    pub(crate) fn fs(&self) -> &Arc<FsInner> {
        &self.fs
    }

    pub fn inumber(&self) -> u32 {
        self.ip().sector
    }

    // Openers beyond the handle the caller already holds.
    pub fn open_count(&self) -> usize {
        // One for the table, one for this handle.
        Arc::strong_count(self.ip()) - 2
    }

    pub fn same_inode(&self, other: &Inode) -> bool {
        Arc::ptr_eq(self.ip(), other.ip())
    }

    // The per-inode operation lock (directory add/remove ordering).
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.ip().lock.lock()
    }

    pub fn itype(&self) -> IType {
        let guard = self.fs.cache.lock(self.ip().sector, LockMode::Shared);
        let data = guard.read();
        let di = LayoutVerified::<&[u8], DiskInode>::new(&data[..])
            .unwrap()
            .into_ref();
        debug_assert_eq!(di.magic, INODE_MAGIC);
        if di.itype == IType::Dir as u32 {
            IType::Dir
        } else {
            IType::File
        }
    }

    pub fn is_dir(&self) -> bool {
        self.itype() == IType::Dir
    }

    pub fn length(&self) -> u32 {
        let guard = self.fs.cache.lock(self.ip().sector, LockMode::Shared);
        let data = guard.read();
        LayoutVerified::<&[u8], DiskInode>::new(&data[..])
            .unwrap()
            .into_ref()
            .length
    }

    // Marks the inode for deletion once the last opener closes it.
    pub fn remove(&self) {
        self.ip().removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.ip().removed.load(Ordering::Acquire)
    }

    // Finds the cached data sector holding byte `offset`, walking the
    // direct/indirect pointer path. With `allocate`, missing hops are
    // filled in from the free map (double-checked under the parent's
    // exclusive lock) and the final sector comes back EXCLUSIVE for
    // writing; otherwise holes yield Ok(None) and the final sector comes
    // back SHARED.
    fn get_data_block(&self, offset: usize, allocate: bool) -> Result<Option<CacheGuard<'_>>> {
        if offset >= MAX_FILE_BYTES {
            return Err(KernelError::FileTooLarge);
        }
        let (path, depth) = to_path(offset / SECTOR_SIZE);
        let mut current = self.ip().sector;
        let mut level = 0;

        loop {
            let (next, follower) = {
                let guard = self.fs.cache.lock(current, LockMode::Shared);
                let data = guard.read();
                let ptrs = LayoutVerified::<&[u8], [u32]>::new_slice(&data[..]).unwrap();
                let next = ptrs[path[level]];
                // Hint at the sequentially following data sector when
                // the same pointer block already names it. The direct
                // range stops short of the inode's non-pointer fields.
                let follower = if level == depth - 1 && (depth > 1 || path[0] + 1 < DIRECT_CNT)
                {
                    ptrs.get(path[level] + 1).copied().filter(|&p| p != 0)
                } else {
                    None
                };
                (next, follower)
            };

            if next != 0 {
                if level == depth - 1 {
                    let mode = if allocate {
                        LockMode::Exclusive
                    } else {
                        LockMode::Shared
                    };
                    if !allocate {
                        if let Some(ahead) = follower {
                            self.fs.cache.readahead(ahead);
                        }
                    }
                    return Ok(Some(self.fs.cache.lock(next, mode)));
                }
                current = next;
                level += 1;
                continue;
            }

            if !allocate {
                return Ok(None);
            }

            // Re-check under the exclusive lock: another writer may have
            // filled this hop since the shared probe.
            let mut parent = self.fs.cache.lock(current, LockMode::Exclusive);
            let existing = {
                let data = parent.read();
                LayoutVerified::<&[u8], [u32]>::new_slice(&data[..]).unwrap()[path[level]]
            };
            if existing != 0 {
                continue;
            }

            let fresh = self.fs.freemap.allocate_one()?;
            {
                let mut data = parent.data_mut();
                let mut ptrs =
                    LayoutVerified::<&mut [u8], [u32]>::new_slice(&mut data[..]).unwrap();
                ptrs[path[level]] = fresh;
            }
            parent.mark_dirty();

            let mut child = self.fs.cache.lock(fresh, LockMode::Exclusive);
            child.setzero();
            drop(parent);

            if level == depth - 1 {
                return Ok(Some(child));
            }
            drop(child);
            current = fresh;
            level += 1;
        }
    }

    // Reads up to buf.len() bytes starting at `offset`. Short reads at
    // end of file; holes read as zeros.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        let mut bytes_read = 0;
        let mut offset = offset as usize;
        let mut size = buf.len();

        while size > 0 {
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = (self.length() as usize).saturating_sub(offset);
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = size.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            match self.get_data_block(offset, false) {
                Ok(Some(guard)) => {
                    let data = guard.read();
                    buf[bytes_read..bytes_read + chunk]
                        .copy_from_slice(&data[sector_ofs..sector_ofs + chunk]);
                }
                Ok(None) => buf[bytes_read..bytes_read + chunk].fill(0),
                Err(_) => break,
            }

            size -= chunk;
            offset += chunk;
            bytes_read += chunk;
        }
        bytes_read
    }

    // Writes buf at `offset`, extending the file as needed. Returns the
    // number of bytes written: short on disk-full, 0 while writes are
    // denied. The length update is ordered after the data writes, so a
    // concurrent reader never sees a length it cannot read up to.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        {
            let mut w = self.ip().write.lock();
            if w.deny_cnt > 0 {
                return 0;
            }
            w.writers += 1;
        }

        let mut written = 0;
        let mut offset = offset as usize;
        let mut size = buf.len();

        while size > 0 {
            let sector_ofs = offset % SECTOR_SIZE;
            let file_left = MAX_FILE_BYTES.saturating_sub(offset);
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = size.min(file_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            match self.get_data_block(offset, true) {
                Ok(Some(mut guard)) => {
                    {
                        let mut data = guard.data_mut();
                        data[sector_ofs..sector_ofs + chunk]
                            .copy_from_slice(&buf[written..written + chunk]);
                    }
                    guard.mark_dirty();
                }
                _ => break,
            }

            size -= chunk;
            offset += chunk;
            written += chunk;
        }

        self.update_length(offset as u32);

        let mut w = self.ip().write.lock();
        w.writers -= 1;
        if w.writers == 0 {
            self.ip().no_writers.notify_all();
        }
        written
    }

    fn update_length(&self, end: u32) {
        if end <= self.length() {
            return;
        }
        let mut guard = self.fs.cache.lock(self.ip().sector, LockMode::Exclusive);
        let grown = {
            let mut data = guard.data_mut();
            let di = LayoutVerified::<&mut [u8], DiskInode>::new(&mut data[..])
                .unwrap()
                .into_mut();
            if end > di.length {
                di.length = end;
                true
            } else {
                false
            }
        };
        if grown {
            guard.mark_dirty();
        }
    }

    // Blocks until no write is in flight, then freezes the inode
    // against writes. Used to pin executables while they run.
    pub fn deny_write(&self) {
        let mut w = self.ip().write.lock();
        while w.writers > 0 {
            w = self.ip().no_writers.wait(w);
        }
        w.deny_cnt += 1;
    }

    pub fn allow_write(&self) {
        let mut w = self.ip().write.lock();
        assert!(w.deny_cnt > 0, "allow_write without deny_write");
        w.deny_cnt -= 1;
    }
}

// Pointer path from a sector ordinal: direct, single- or
// double-indirect.
fn to_path(sector_ord: usize) -> ([usize; 3], usize) {
    if sector_ord < DIRECT_CNT {
        return ([sector_ord, 0, 0], 1);
    }
    let rest = sector_ord - DIRECT_CNT;
    if rest < PTRS_PER_SECTOR {
        return ([DIRECT_CNT, rest, 0], 2);
    }
    let rest = rest - PTRS_PER_SECTOR;
    debug_assert!(rest < PTRS_PER_SECTOR * PTRS_PER_SECTOR);
    (
        [DIRECT_CNT + 1, rest / PTRS_PER_SECTOR, rest % PTRS_PER_SECTOR],
        3,
    )
}

// Frees every sector of a removed inode, depth-first through the
// indirect trees, and drops stale cache entries along the way.
fn erase(fs: &FsInner, sector: u32) {
    let children: Vec<(u32, usize)> = {
        let guard = fs.cache.lock(sector, LockMode::Exclusive);
        let data = guard.read();
        let ptrs = LayoutVerified::<&[u8], [u32]>::new_slice(&data[..]).unwrap();
        (0..INODE_PTRS)
            .filter_map(|i| {
                let p = ptrs[i];
                if p == 0 {
                    return None;
                }
                let depth = if i < DIRECT_CNT {
                    0
                } else if i == DIRECT_CNT {
                    1
                } else {
                    2
                };
                Some((p, depth))
            })
            .collect()
    };
    for (child, depth) in children {
        erase_tree(fs, child, depth);
    }
    fs.cache.discard(sector);
    fs.freemap.release(sector);
}

fn erase_tree(fs: &FsInner, sector: u32, depth: usize) {
    if depth > 0 {
        let children: Vec<u32> = {
            let guard = fs.cache.lock(sector, LockMode::Exclusive);
            let data = guard.read();
            let ptrs = LayoutVerified::<&[u8], [u32]>::new_slice(&data[..]).unwrap();
            ptrs.iter().copied().filter(|&p| p != 0).collect()
        };
        for child in children {
            erase_tree(fs, child, depth - 1);
        }
    }
    fs.cache.discard(sector);
    fs.freemap.release(sector);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;
    use crate::filesys::Filesys;

    fn fresh() -> Filesys {
        Filesys::mount(MemDisk::new(8192), true, None)
    }

    fn new_file(fs: &Filesys, name: &str) -> Inode {
        fs.create(None, name, 0).unwrap();
        fs.open(None, name).unwrap()
    }

    #[test]
    fn sector_ordinals_resolve_to_pointer_paths() {
        assert_eq!(to_path(0), ([0, 0, 0], 1));
        assert_eq!(to_path(122), ([122, 0, 0], 1));
        assert_eq!(to_path(123), ([123, 0, 0], 2));
        assert_eq!(to_path(123 + 127), ([123, 127, 0], 2));
        assert_eq!(to_path(123 + 128), ([124, 0, 0], 3));
        assert_eq!(to_path(123 + 128 + 129), ([124, 1, 1], 3));
        let last = DIRECT_CNT + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR - 1;
        assert_eq!(to_path(last), ([124, 127, 127], 3));
    }

    #[test]
    fn writes_spanning_the_indirect_boundaries_round_trip() {
        let fs = fresh();
        let ino = new_file(&fs, "/spans");

        // A chunk straddling the direct/single-indirect seam and one
        // straddling the single/double seam.
        let seams = [
            DIRECT_CNT * SECTOR_SIZE,
            (DIRECT_CNT + PTRS_PER_SECTOR) * SECTOR_SIZE,
        ];
        for (i, seam) in seams.iter().enumerate() {
            let data: Vec<u8> = (0..3 * SECTOR_SIZE)
                .map(|n| ((n + i * 7) % 253) as u8)
                .collect();
            let off = (*seam - SECTOR_SIZE - 100) as u32;
            assert_eq!(ino.write_at(&data, off), data.len());

            let mut out = vec![0u8; data.len()];
            assert_eq!(ino.read_at(&mut out, off), data.len());
            assert_eq!(out, data, "seam {} corrupted", seam);
        }
    }

    #[test]
    fn partial_sector_overwrite_preserves_neighbors() {
        let fs = fresh();
        let ino = new_file(&fs, "/partial");

        let base = vec![0x11u8; SECTOR_SIZE];
        assert_eq!(ino.write_at(&base, 0), SECTOR_SIZE);
        assert_eq!(ino.write_at(b"mid", 200), 3);

        let mut out = vec![0u8; SECTOR_SIZE];
        assert_eq!(ino.read_at(&mut out, 0), SECTOR_SIZE);
        assert_eq!(&out[..200], &base[..200]);
        assert_eq!(&out[200..203], b"mid");
        assert_eq!(&out[203..], &base[203..]);
    }

    #[test]
    fn length_grows_only_past_the_old_end() {
        let fs = fresh();
        let ino = new_file(&fs, "/len");
        assert_eq!(ino.write_at(&[1u8; 1000], 0), 1000);
        assert_eq!(ino.length(), 1000);
        // Rewriting inside the file leaves the length alone.
        assert_eq!(ino.write_at(&[2u8; 10], 100), 10);
        assert_eq!(ino.length(), 1000);
        assert_eq!(ino.write_at(&[3u8; 10], 995), 10);
        assert_eq!(ino.length(), 1005);
    }

    #[test]
    fn writes_stop_at_the_maximum_file_size() {
        let fs = fresh();
        let ino = new_file(&fs, "/max");
        let tail = (MAX_FILE_BYTES - 4) as u32;
        // Four in-range bytes, then the file cannot grow any further.
        assert_eq!(ino.write_at(&[7u8; 16], tail), 4);
        assert_eq!(ino.length() as usize, MAX_FILE_BYTES);
        assert_eq!(ino.write_at(&[7u8; 16], MAX_FILE_BYTES as u32), 0);
    }

    #[test]
    fn type_and_magic_survive_reopen() {
        let fs = fresh();
        let ino = new_file(&fs, "/typed");
        assert_eq!(ino.itype(), IType::File);
        let again = fs.open(None, "/typed").unwrap();
        assert!(ino.same_inode(&again));
        assert_eq!(again.itype(), IType::File);
    }
}
