// File objects: an inode reference plus a byte position. Cloning a File
// shares the position (descriptor duplication); reopen() yields an
// independent position over the same inode, which mmap relies on.

use crate::inode::{IType, Inode};
use crate::stat::Stat;
use crate::sync::Mutex;
use std::sync::Arc;

#[derive(Clone)]
pub struct File {
    inner: Arc<FileInner>,
}

struct FileInner {
    inode: Inode,
    pos: Mutex<u32>,
}

impl File {
    pub fn open(inode: Inode) -> File {
        File {
            inner: Arc::new(FileInner {
                inode,
                pos: Mutex::new(0, "file pos"),
            }),
        }
    }

    pub fn reopen(&self) -> File {
        File::open(self.inner.inode.reopen())
    }

    pub fn inode(&self) -> &Inode {
        &self.inner.inode
    }

    pub fn is_regular(&self) -> bool {
        self.inner.inode.itype() == IType::File
    }

    pub fn length(&self) -> u32 {
        self.inner.inode.length()
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.inner.pos.lock();
        let n = self.inner.inode.read_at(buf, *pos);
        *pos += n as u32;
        n
    }

    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.inner.pos.lock();
        let n = self.inner.inode.write_at(buf, *pos);
        *pos += n as u32;
        n
    }

    pub fn read_at(&self, buf: &mut [u8], off: u32) -> usize {
        self.inner.inode.read_at(buf, off)
    }

    pub fn write_at(&self, buf: &[u8], off: u32) -> usize {
        self.inner.inode.write_at(buf, off)
    }

    pub fn seek(&self, pos: u32) {
        *self.inner.pos.lock() = pos;
    }

    pub fn tell(&self) -> u32 {
        *self.inner.pos.lock()
    }

    pub fn stat(&self) -> Stat {
        let inode = &self.inner.inode;
        Stat {
            inumber: inode.inumber(),
            itype: inode.itype(),
            length: inode.length(),
        }
    }

    pub fn deny_write(&self) {
        self.inner.inode.deny_write();
    }

    pub fn allow_write(&self) {
        self.inner.inode.allow_write();
    }
}
