// The user-visible syscall surface over files, directories and memory
// mappings. Paths arrive as kernel strings; data buffers arrive as user
// addresses and follow the pinning contract: every page of the buffer
// is faulted in and pinned before the filesystem lock is taken, so no
// page can be evicted while the kernel holds a pointer into it, and no
// fault can occur under the filesystem lock.
//
// Return conventions mirror the userland ABI: -1 for a bad descriptor,
// byte counts (possibly short) for transfers, and death with exit code
// -1 for a bad buffer.

use crate::kernel::Kernel;
use crate::proc::{unpin_all, Process};
use crate::stat::Stat;
use std::sync::Arc;

impl Kernel {
    pub fn sys_create(&self, p: &Arc<Process>, path: &str, size: u32) -> bool {
        let _fs = self.fs_lock();
        let cwd = p.cwd();
        self.fs.create(cwd.as_ref(), path, size).is_ok()
    }

    pub fn sys_remove(&self, p: &Arc<Process>, path: &str) -> bool {
        let _fs = self.fs_lock();
        let cwd = p.cwd();
        self.fs.remove(cwd.as_ref(), path).is_ok()
    }

    pub fn sys_open(&self, p: &Arc<Process>, path: &str) -> i32 {
        let _fs = self.fs_lock();
        let cwd = p.cwd();
        let inode = match self.fs.open(cwd.as_ref(), path) {
            Ok(inode) => inode,
            Err(_) => return -1,
        };
        match p.install_fd(crate::file::File::open(inode)) {
            Some(fd) => fd as i32,
            None => -1,
        }
    }

    pub fn sys_close(&self, p: &Arc<Process>, fd: usize) {
        let _fs = self.fs_lock();
        p.close_fd(fd);
    }

    pub fn sys_filesize(&self, p: &Arc<Process>, fd: usize) -> i32 {
        let _fs = self.fs_lock();
        match p.fd(fd) {
            Some(file) => file.length() as i32,
            None => -1,
        }
    }

    pub fn sys_seek(&self, p: &Arc<Process>, fd: usize, pos: u32) {
        if let Some(file) = p.fd(fd) {
            file.seek(pos);
        }
    }

    pub fn sys_tell(&self, p: &Arc<Process>, fd: usize) -> i32 {
        match p.fd(fd) {
            Some(file) => file.tell() as i32,
            None => -1,
        }
    }

    // Reads from `fd` into the user buffer at `addr`. fd 0 is console
    // input (empty here), fd 1 is not readable and kills the caller.
    pub fn sys_read(
        &self,
        p: &Arc<Process>,
        fd: usize,
        addr: usize,
        len: usize,
        esp: Option<usize>,
    ) -> i32 {
        if fd == 1 {
            p.exit(-1);
            return -1;
        }
        if fd == 0 {
            return 0;
        }
        let file = match p.fd(fd) {
            Some(file) => file,
            None => return -1,
        };
        if file.inode().is_dir() {
            return -1;
        }

        let pinned = match p.pin_buffer(addr, len, true, esp) {
            Ok(pinned) => pinned,
            Err(_) => return -1,
        };

        let mut buf = vec![0u8; len];
        let n = {
            let _fs = self.fs_lock();
            let n = file.read(&mut buf);
            if p.copy_out(addr, &buf[..n]).is_err() {
                unpin_all(&pinned);
                return -1;
            }
            n
        };
        unpin_all(&pinned);
        n as i32
    }

    // Writes the user buffer at `addr` to `fd`. fd 1 is the console.
    // Returns 0 without side effect while the file denies writes.
    pub fn sys_write(
        &self,
        p: &Arc<Process>,
        fd: usize,
        addr: usize,
        len: usize,
        esp: Option<usize>,
    ) -> i32 {
        let pinned = match p.pin_buffer(addr, len, false, esp) {
            Ok(pinned) => pinned,
            Err(_) => return -1,
        };
        let mut buf = vec![0u8; len];
        if p.copy_in(&mut buf, addr).is_err() {
            unpin_all(&pinned);
            return -1;
        }

        let written = if fd == 1 {
            self.console_write(&buf);
            len as i32
        } else {
            let _fs = self.fs_lock();
            match p.fd(fd) {
                Some(file) if !file.inode().is_dir() => file.write(&buf) as i32,
                _ => -1,
            }
        };
        unpin_all(&pinned);
        written
    }

    pub fn sys_mmap(&self, p: &Arc<Process>, fd: usize, addr: usize) -> i32 {
        let file = match p.fd(fd) {
            Some(file) => file,
            None => return -1,
        };
        match p.mmap(&file, addr) {
            Ok(mapid) => mapid,
            Err(_) => -1,
        }
    }

    pub fn sys_munmap(&self, p: &Arc<Process>, mapid: i32) {
        let _ = p.munmap(mapid);
    }

    pub fn sys_chdir(&self, p: &Arc<Process>, path: &str) -> bool {
        let _fs = self.fs_lock();
        let cwd = p.cwd();
        match self.fs.chdir(cwd.as_ref(), path) {
            Ok(dir) => {
                p.set_cwd(dir);
                true
            }
            Err(_) => false,
        }
    }

    pub fn sys_mkdir(&self, p: &Arc<Process>, path: &str) -> bool {
        let _fs = self.fs_lock();
        let cwd = p.cwd();
        self.fs.mkdir(cwd.as_ref(), path).is_ok()
    }

    // Yields the next entry name of an open directory, or None at the
    // end. The descriptor's position doubles as the walk cursor.
    pub fn sys_readdir(&self, p: &Arc<Process>, fd: usize) -> Option<String> {
        let _fs = self.fs_lock();
        let file = p.fd(fd)?;
        let dir = crate::dir::Dir::open(file.inode().reopen()).ok()?;
        let mut pos = file.tell();
        let name = dir.readdir(&mut pos);
        file.seek(pos);
        name
    }

    pub fn sys_stat(&self, p: &Arc<Process>, fd: usize) -> Option<Stat> {
        let _fs = self.fs_lock();
        Some(p.fd(fd)?.stat())
    }

    pub fn sys_isdir(&self, p: &Arc<Process>, fd: usize) -> bool {
        p.fd(fd).map_or(false, |file| file.inode().is_dir())
    }

    pub fn sys_inumber(&self, p: &Arc<Process>, fd: usize) -> i32 {
        match p.fd(fd) {
            Some(file) => file.inode().inumber() as i32,
            None => -1,
        }
    }

    pub fn sys_exit(&self, p: &Arc<Process>, code: i32) {
        p.exit(code);
    }
}
