// Block devices. The core sees disks as arrays of 512-byte sectors
// behind this trait; the real driver lives outside. Reads and writes may
// block the calling thread. Two devices are wired into a kernel: the
// filesystem device and the swap device.

use crate::param::SECTOR_SIZE;
use crate::sync::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

pub trait BlockDevice: Send + Sync {
    // Device capacity in sectors.
    fn size(&self) -> u32;
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
}

// RAM-backed disk.
pub struct MemDisk {
    sectors: u32,
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(sectors: u32) -> Arc<Self> {
        Arc::new(Self {
            sectors,
            data: Mutex::new(vec![0; sectors as usize * SECTOR_SIZE], "memdisk"),
        })
    }
}

impl BlockDevice for MemDisk {
    fn size(&self) -> u32 {
        self.sectors
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "memdisk read: sector {} out of range", sector);
        let off = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.data.lock()[off..off + SECTOR_SIZE]);
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "memdisk write: sector {} out of range", sector);
        let off = sector as usize * SECTOR_SIZE;
        self.data.lock()[off..off + SECTOR_SIZE].copy_from_slice(buf);
    }
}

// Disk image in a host file, used by the mkfs tool. I/O errors on the
// image are fatal to the simulated machine.
pub struct FileDisk {
    sectors: u32,
    file: Mutex<File>,
}

impl FileDisk {
    pub fn create<P: AsRef<Path>>(path: P, sectors: u32) -> io::Result<Arc<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(sectors as u64 * SECTOR_SIZE as u64)?;
        Ok(Arc::new(Self {
            sectors,
            file: Mutex::new(file, "filedisk"),
        }))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Arc::new(Self {
            sectors: (len / SECTOR_SIZE as u64) as u32,
            file: Mutex::new(file, "filedisk"),
        }))
    }
}

impl BlockDevice for FileDisk {
    fn size(&self) -> u32 {
        self.sectors
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "filedisk read: sector {} out of range", sector);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("filedisk seek");
        file.read_exact(buf).expect("filedisk read");
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "filedisk write: sector {} out of range", sector);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("filedisk seek");
        file.write_all(buf).expect("filedisk write");
    }
}
