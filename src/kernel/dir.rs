// Directories.
//
// A directory is an inode of type Dir whose contents are an array of
// fixed-size entries. Each entry names an inode; `..` is stored as a
// real entry pointing at the parent (the root's `..` points at the root
// itself), while `.` is resolved without being stored. Operations hold
// the directory's inode lock for their full duration, so a lookup never
// observes a half-written entry.

use crate::error::{KernelError, Result};
use crate::filesys::FsInner;
use crate::inode::Inode;
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};
use core::mem;
use static_assertions::const_assert_eq;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

// On-disk directory entry: an in-use flag, a nul-terminated name of up
// to NAME_MAX bytes, and the inode sector it names.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
pub struct DiskDirEntry {
    in_use: u8,
    name: [u8; NAME_MAX + 1],
    inumber: u32,
}

pub const ENTRY_SIZE: usize = mem::size_of::<DiskDirEntry>();
const_assert_eq!(ENTRY_SIZE, 20);

impl DiskDirEntry {
    fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

pub struct Dir {
    inode: Inode,
}

impl Dir {
    pub fn open(inode: Inode) -> Result<Dir> {
        if !inode.is_dir() {
            return Err(KernelError::NotADirectory);
        }
        Ok(Dir { inode })
    }

    pub fn open_root(fs: &Arc<FsInner>) -> Dir {
        Dir {
            inode: Inode::open(fs, ROOT_DIR_SECTOR),
        }
    }

    pub fn reopen(&self) -> Dir {
        Dir {
            inode: self.inode.reopen(),
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn into_inode(self) -> Inode {
        self.inode
    }

    fn read_entry(&self, idx: usize) -> Option<DiskDirEntry> {
        let mut e = DiskDirEntry::new_zeroed();
        let off = (idx * ENTRY_SIZE) as u32;
        if self.inode.read_at(e.as_bytes_mut(), off) != ENTRY_SIZE {
            None
        } else {
            Some(e)
        }
    }

    fn write_entry(&self, idx: usize, e: &DiskDirEntry) -> Result<()> {
        let off = (idx * ENTRY_SIZE) as u32;
        if self.inode.write_at(e.as_bytes(), off) != ENTRY_SIZE {
            return Err(KernelError::DiskFull);
        }
        Ok(())
    }

    // Caller holds the inode lock.
    fn find(&self, name: &str) -> Option<(usize, DiskDirEntry)> {
        let mut idx = 0;
        while let Some(e) = self.read_entry(idx) {
            if e.in_use != 0 && e.name_str() == name {
                return Some((idx, e));
            }
            idx += 1;
        }
        None
    }

    // Resolves `name` in this directory. `.` is the directory itself;
    // `..` is a stored entry like any other.
    pub fn lookup(&self, name: &str) -> Result<Inode> {
        if name == "." {
            return Ok(self.inode.reopen());
        }
        let _guard = self.inode.lock();
        if self.inode.is_removed() {
            return Err(KernelError::NotFound);
        }
        match self.find(name) {
            Some((_, e)) => Ok(Inode::open(self.inode.fs(), e.inumber)),
            None => Err(KernelError::NotFound),
        }
    }

    // Adds an entry, reusing a free slot or extending the directory.
    pub fn add(&self, name: &str, inumber: u32) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
            return Err(KernelError::InvalidPath);
        }
        let _guard = self.inode.lock();
        if self.inode.is_removed() {
            return Err(KernelError::NotFound);
        }
        if self.find(name).is_some() {
            return Err(KernelError::AlreadyExists);
        }

        let mut idx = 0;
        while let Some(e) = self.read_entry(idx) {
            if e.in_use == 0 {
                break;
            }
            idx += 1;
        }

        let mut e = DiskDirEntry::new_zeroed();
        e.in_use = 1;
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        e.inumber = inumber;
        self.write_entry(idx, &e)
    }

    // Removes the entry for `name` and marks its inode for deletion.
    // A directory goes only if it is empty and nobody else has it open
    // (as a cwd, a descriptor, or a resolution in flight).
    pub fn remove(&self, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(KernelError::InvalidArgument);
        }
        let _guard = self.inode.lock();
        let (idx, e) = self.find(name).ok_or(KernelError::NotFound)?;
        let target = Inode::open(self.inode.fs(), e.inumber);

        if target.is_dir() {
            if target.inumber() == ROOT_DIR_SECTOR {
                return Err(KernelError::InUse);
            }
            let _target_guard = target.lock();
            if target.open_count() > 0 {
                return Err(KernelError::InUse);
            }
            let sub = Dir {
                inode: target.reopen(),
            };
            if !sub.is_empty_locked() {
                return Err(KernelError::DirectoryNotEmpty);
            }
            target.remove();
        } else {
            target.remove();
        }

        let mut cleared = DiskDirEntry::new_zeroed();
        cleared.inumber = e.inumber;
        self.write_entry(idx, &cleared)
    }

    // Empty apart from the `..` link. Caller holds the target's lock.
    fn is_empty_locked(&self) -> bool {
        let mut idx = 0;
        while let Some(e) = self.read_entry(idx) {
            if e.in_use != 0 && e.name_str() != ".." {
                return false;
            }
            idx += 1;
        }
        true
    }

    // Yields the next live entry name at or after *pos, advancing it.
    // `..` and free slots are skipped.
    pub fn readdir(&self, pos: &mut u32) -> Option<String> {
        let _guard = self.inode.lock();
        loop {
            let e = self.read_entry(*pos as usize)?;
            *pos += 1;
            if e.in_use != 0 && e.name_str() != ".." {
                return Some(e.name_str().to_string());
            }
        }
    }

    // Entry count for diagnostics and tests.
    pub fn len(&self) -> usize {
        let _guard = self.inode.lock();
        let mut n = 0;
        let mut idx = 0;
        while let Some(e) = self.read_entry(idx) {
            if e.in_use != 0 {
                n += 1;
            }
            idx += 1;
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        let _guard = self.inode.lock();
        self.is_empty_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_twenty_bytes() {
        assert_eq!(ENTRY_SIZE, 20);
    }

    #[test]
    fn entry_name_round_trips() {
        let mut e = DiskDirEntry::new_zeroed();
        let name = "grader-output";
        e.in_use = 1;
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        e.inumber = 77;
        assert_eq!(e.name_str(), name);

        let bytes = e.as_bytes().to_vec();
        let back = DiskDirEntry::read_from(&bytes[..]).unwrap();
        assert_eq!(back.name_str(), name);
        assert_eq!(back.inumber, 77);
        assert_eq!(back.in_use, 1);
    }
}
