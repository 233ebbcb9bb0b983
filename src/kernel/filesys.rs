// Filesystem facade: mounts a block device behind the cache, owns the
// free map and the open-inode table, and resolves paths for the
// name-level operations (create, open, remove, mkdir, chdir).
//
// Disk layout: sector 0 holds the inode of the free-map file, sector 1
// the inode of the root directory; everything else is handed out by the
// free map. Crash consistency is best-effort: the free map and dirty
// cache payloads are written back on flush and unmount.

use crate::block::BlockDevice;
use crate::cache::BlockCache;
use crate::dir::Dir;
use crate::error::{KernelError, Result};
use crate::freemap::FreeMap;
use crate::inode::{IType, Inode, InodeTable};
use crate::param::{FREE_MAP_SECTOR, NAME_MAX, ROOT_DIR_SECTOR};
use log::info;
use std::sync::Arc;
use std::time::Duration;

pub struct FsInner {
    pub(crate) cache: BlockCache,
    pub(crate) freemap: FreeMap,
    pub(crate) itable: InodeTable,
}

impl Drop for FsInner {
    fn drop(&mut self) {
        self.cache.shutdown();
    }
}

#[derive(Clone)]
pub struct Filesys {
    pub(crate) inner: Arc<FsInner>,
}

impl Filesys {
    // Mounts the device. With `format`, lays down a fresh filesystem
    // first. `flush_period` enables the periodic write-back daemon.
    pub fn mount(
        dev: Arc<dyn BlockDevice>,
        format: bool,
        flush_period: Option<Duration>,
    ) -> Filesys {
        let sectors = dev.size();
        let cache = BlockCache::new(dev);
        if let Some(period) = flush_period {
            cache.start_flusher(period);
        }
        let fs = Filesys {
            inner: Arc::new(FsInner {
                cache,
                freemap: FreeMap::new(sectors),
                itable: InodeTable::new(),
            }),
        };
        if format {
            fs.format();
        } else {
            fs.inner
                .freemap
                .load(&Inode::open(&fs.inner, FREE_MAP_SECTOR));
        }
        fs
    }

    fn format(&self) {
        info!("formatting file system");
        self.inner.freemap.mark(FREE_MAP_SECTOR);
        self.inner.freemap.mark(ROOT_DIR_SECTOR);

        let map_file = Inode::create_at(&self.inner, FREE_MAP_SECTOR, IType::File, 0);
        let root = Inode::create_at(&self.inner, ROOT_DIR_SECTOR, IType::Dir, 0);
        let root = Dir::open(root).expect("root directory creation failed");
        root.add("..", ROOT_DIR_SECTOR)
            .expect("root directory creation failed");

        self.inner.freemap.store(&map_file);
    }

    pub fn root(&self) -> Dir {
        Dir::open_root(&self.inner)
    }

    // Writes the free map and all dirty cached sectors back.
    pub fn flush(&self) {
        self.inner
            .freemap
            .store(&Inode::open(&self.inner, FREE_MAP_SECTOR));
        self.inner.cache.flush_all();
    }

    pub fn readahead(&self, sector: u32) {
        self.inner.cache.readahead(sector);
    }

    pub fn free_sectors(&self) -> usize {
        self.inner.freemap.free_count()
    }

    // Splits a path into its non-empty components (consecutive slashes
    // collapse).
    fn components(path: &str) -> impl Iterator<Item = &str> {
        path.split('/').filter(|c| !c.is_empty())
    }

    // Walks `path` down to its final component, returning the directory
    // holding it and the component itself. Absolute paths start at the
    // root, relative ones at `cwd` (or the root when there is none).
    fn resolve_parent(&self, cwd: Option<&Dir>, path: &str) -> Result<(Dir, String)> {
        let mut dir = if path.starts_with('/') {
            self.root()
        } else {
            match cwd {
                Some(d) => d.reopen(),
                None => self.root(),
            }
        };

        let mut parts = Self::components(path);
        let mut name = parts.next().ok_or(KernelError::InvalidPath)?;
        if name.len() > NAME_MAX {
            return Err(KernelError::InvalidPath);
        }
        for next in parts {
            if next.len() > NAME_MAX {
                return Err(KernelError::InvalidPath);
            }
            dir = Dir::open(dir.lookup(name)?)?;
            name = next;
        }
        Ok((dir, name.to_string()))
    }

    // Resolves `path` to an inode.
    pub fn open(&self, cwd: Option<&Dir>, path: &str) -> Result<Inode> {
        if Self::components(path).next().is_none() {
            // Only the root is nameable by a bare "/".
            return if path.starts_with('/') {
                Ok(Inode::open(&self.inner, ROOT_DIR_SECTOR))
            } else {
                Err(KernelError::InvalidPath)
            };
        }
        let (dir, base) = self.resolve_parent(cwd, path)?;
        dir.lookup(&base)
    }

    // Creates a regular file of `length` bytes (all holes until
    // written).
    pub fn create(&self, cwd: Option<&Dir>, path: &str, length: u32) -> Result<()> {
        let (dir, base) = self.resolve_parent(cwd, path)?;
        let inode = Inode::create(&self.inner, IType::File, length)?;
        if let Err(e) = dir.add(&base, inode.inumber()) {
            inode.remove();
            return Err(e);
        }
        Ok(())
    }

    pub fn mkdir(&self, cwd: Option<&Dir>, path: &str) -> Result<()> {
        let (dir, base) = self.resolve_parent(cwd, path)?;
        let inode = Inode::create(&self.inner, IType::Dir, 0)?;
        let sub = Dir::open(inode.reopen())?;
        let linked = sub
            .add("..", dir.inode().inumber())
            .and_then(|_| dir.add(&base, inode.inumber()));
        if let Err(e) = linked {
            inode.remove();
            return Err(e);
        }
        Ok(())
    }

    // Removes a file or an empty, unused directory.
    pub fn remove(&self, cwd: Option<&Dir>, path: &str) -> Result<()> {
        let (dir, base) = self.resolve_parent(cwd, path)?;
        dir.remove(&base)
    }

    // Resolves `path` to a directory for use as a working directory.
    pub fn chdir(&self, cwd: Option<&Dir>, path: &str) -> Result<Dir> {
        Dir::open(self.open(cwd, path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;

    fn fresh() -> Filesys {
        Filesys::mount(MemDisk::new(2048), true, None)
    }

    #[test]
    fn format_persists_across_remount() {
        let dev = MemDisk::new(2048);
        {
            let fs = Filesys::mount(
                Arc::clone(&dev) as Arc<dyn BlockDevice>,
                true,
                None,
            );
            fs.create(None, "/hello", 0).unwrap();
            let f = fs.open(None, "/hello").unwrap();
            assert_eq!(f.write_at(b"persist me", 0), 10);
            fs.flush();
        }
        let fs = Filesys::mount(dev, false, None);
        let f = fs.open(None, "/hello").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(f.read_at(&mut buf, 0), 10);
        assert_eq!(&buf, b"persist me");
    }

    #[test]
    fn create_rejects_duplicates_and_long_names() {
        let fs = fresh();
        fs.create(None, "/a", 0).unwrap();
        assert_eq!(fs.create(None, "/a", 0), Err(KernelError::AlreadyExists));
        assert_eq!(
            fs.create(None, "/name-way-too-long", 0),
            Err(KernelError::InvalidPath)
        );
        assert_eq!(fs.create(None, "//", 0), Err(KernelError::InvalidPath));
    }

    #[test]
    fn nested_directories_resolve() {
        let fs = fresh();
        fs.mkdir(None, "/a").unwrap();
        fs.mkdir(None, "/a/b").unwrap();
        fs.create(None, "/a/b/f", 0).unwrap();

        // Collapsed slashes and dot components.
        let f = fs.open(None, "//a///b/./f").unwrap();
        assert!(!f.is_dir());

        // Dot-dot climbs back up.
        let a = fs.open(None, "/a/b/..").unwrap();
        assert!(a.is_dir());
        let via_a = fs.open(None, "/a").unwrap();
        assert!(a.same_inode(&via_a));
    }

    #[test]
    fn relative_paths_use_cwd() {
        let fs = fresh();
        fs.mkdir(None, "/home").unwrap();
        fs.create(None, "/home/f", 0).unwrap();
        let cwd = fs.chdir(None, "/home").unwrap();
        let f = fs.open(Some(&cwd), "f").unwrap();
        let abs = fs.open(None, "/home/f").unwrap();
        assert!(f.same_inode(&abs));
        let up = fs.open(Some(&cwd), "../home/f").unwrap();
        assert!(up.same_inode(&abs));
    }

    #[test]
    fn rmdir_rules() {
        let fs = fresh();
        fs.mkdir(None, "/d").unwrap();
        fs.create(None, "/d/f", 0).unwrap();
        assert_eq!(
            fs.remove(None, "/d"),
            Err(KernelError::DirectoryNotEmpty)
        );
        fs.remove(None, "/d/f").unwrap();

        // In use as a cwd: refused.
        let cwd = fs.chdir(None, "/d").unwrap();
        assert_eq!(fs.remove(None, "/d"), Err(KernelError::InUse));
        drop(cwd);
        fs.remove(None, "/d").unwrap();
        assert!(matches!(fs.open(None, "/d"), Err(KernelError::NotFound)));
    }

    #[test]
    fn readdir_lists_entries_without_dotdot() {
        let fs = fresh();
        fs.mkdir(None, "/d").unwrap();
        fs.create(None, "/d/one", 0).unwrap();
        fs.create(None, "/d/two", 0).unwrap();
        let dir = fs.chdir(None, "/d").unwrap();
        let mut pos = 0;
        let mut names = Vec::new();
        while let Some(name) = dir.readdir(&mut pos) {
            names.push(name);
        }
        names.sort();
        assert_eq!(names, ["one", "two"]);
    }

    #[test]
    fn removal_returns_sectors_to_free_map() {
        let fs = fresh();
        let baseline = fs.free_sectors();
        fs.create(None, "/big", 0).unwrap();
        {
            let f = fs.open(None, "/big").unwrap();
            let buf = vec![7u8; 256 * 1024];
            assert_eq!(f.write_at(&buf, 0), buf.len());
            assert!(fs.free_sectors() < baseline);
            fs.remove(None, "/big").unwrap();
        }
        // Last handle dropped: data, indirect and inode sectors are all
        // back.
        assert_eq!(fs.free_sectors(), baseline);
    }

    #[test]
    fn open_inode_table_deduplicates() {
        let fs = fresh();
        fs.create(None, "/same", 0).unwrap();
        let a = fs.open(None, "/same").unwrap();
        let b = fs.open(None, "/same").unwrap();
        assert!(a.same_inode(&b));
    }
}
