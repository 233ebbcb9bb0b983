// Per-process state and the process side of the VM: the supplemental
// page table, the page-fault policy, simulated user loads and stores,
// mmap bookkeeping, fork and exit teardown.
//
// A process's SPT, page table, mmap list, fd table and cwd are touched
// only by the thread running that process; cross-thread traffic on them
// is limited to the frame table's eviction scan, which goes through the
// entry state locks.

use crate::dir::Dir;
use crate::error::{KernelError, Result};
use crate::file::File;
use crate::kernel::Kernel;
use crate::page::{Backing, Spt, SptEntry};
use crate::pagetable::{pg_round_down, PageTable, PteFlags};
use crate::param::{NOFILE, PGSIZE, PHYS_BASE, STACK_LIMIT, STACK_SLOP};
use crate::sync::Mutex;
use log::debug;
use std::sync::Arc;

pub(crate) struct MmapRegion {
    mapid: i32,
    // The reopened handle backing this mapping; pages share it.
    file: File,
    pages: Vec<Arc<SptEntry>>,
}

pub struct Process {
    pid: u32,
    kernel: Arc<Kernel>,
    pub(crate) pagetable: Arc<PageTable>,
    pub(crate) spt: Spt,
    mmaps: Mutex<Vec<MmapRegion>>,
    next_mapid: Mutex<i32>,
    cwd: Mutex<Option<Dir>>,
    fds: Mutex<Vec<Option<File>>>,
    exit_code: Mutex<Option<i32>>,
}

pub fn is_user_vaddr(addr: usize) -> bool {
    addr < PHYS_BASE
}

impl Process {
    pub(crate) fn new(kernel: &Arc<Kernel>, pid: u32) -> Arc<Process> {
        Arc::new(Process {
            pid,
            kernel: Arc::clone(kernel),
            pagetable: Arc::new(PageTable::new()),
            spt: Spt::new(),
            mmaps: Mutex::new(Vec::new(), "mmap list"),
            next_mapid: Mutex::new(0, "mapid"),
            cwd: Mutex::new(Some(kernel.fs.root()), "cwd"),
            fds: Mutex::new(Vec::new(), "fd table"),
            exit_code: Mutex::new(None, "exit code"),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    pub fn alive(&self) -> bool {
        self.exit_code().is_none()
    }

    // fd table ------------------------------------------------------

    pub(crate) fn install_fd(&self, file: File) -> Option<usize> {
        let mut fds = self.fds.lock();
        for (i, slot) in fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Some(i + crate::param::FD_BASE);
            }
        }
        if fds.len() >= NOFILE {
            return None;
        }
        fds.push(Some(file));
        Some(fds.len() - 1 + crate::param::FD_BASE)
    }

    pub(crate) fn fd(&self, fd: usize) -> Option<File> {
        let idx = fd.checked_sub(crate::param::FD_BASE)?;
        self.fds.lock().get(idx)?.clone()
    }

    pub(crate) fn close_fd(&self, fd: usize) -> Option<File> {
        let idx = fd.checked_sub(crate::param::FD_BASE)?;
        self.fds.lock().get_mut(idx)?.take()
    }

    pub fn cwd(&self) -> Option<Dir> {
        self.cwd.lock().as_ref().map(|d| d.reopen())
    }

    pub(crate) fn set_cwd(&self, dir: Dir) {
        *self.cwd.lock() = Some(dir);
    }

    // Address space -------------------------------------------------

    // Registers the lazy pages of a loaded segment: `read_bytes` from
    // the file starting at `ofs`, then zeros, rounded up to whole
    // pages. This is the loader's interface; nothing is read until the
    // first fault.
    pub fn load_segment(
        &self,
        file: &File,
        ofs: u32,
        vaddr: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        if vaddr % PGSIZE != 0 || (read_bytes + zero_bytes) % PGSIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut read_left = read_bytes;
        let mut addr = vaddr;
        let mut ofs = ofs;
        let pages = (read_bytes + zero_bytes) / PGSIZE;
        for _ in 0..pages {
            let page_read = read_left.min(PGSIZE);
            let entry = SptEntry::new_file(
                addr,
                writable,
                file.clone(),
                ofs,
                page_read,
                PGSIZE - page_read,
                false,
            );
            self.spt.insert(entry)?;
            read_left -= page_read;
            ofs += page_read as u32;
            addr += PGSIZE;
        }
        Ok(())
    }

    // Maps `file` at `addr`. The address must be page-aligned and
    // non-null, the file regular and non-empty, and no covered page may
    // collide with an existing mapping of any kind, the loaded image
    // included. The file is reopened so later closes of the descriptor
    // do not pull the mapping's backing away.
    pub fn mmap(&self, file: &File, addr: usize) -> Result<i32> {
        let len = file.length() as usize;
        if addr == 0 || addr % PGSIZE != 0 || len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if !file.is_regular() {
            return Err(KernelError::InvalidArgument);
        }
        let pages = (len + PGSIZE - 1) / PGSIZE;
        if addr + pages * PGSIZE > PHYS_BASE {
            return Err(KernelError::InvalidArgument);
        }
        for i in 0..pages {
            if self.spt.get(addr + i * PGSIZE).is_some() {
                return Err(KernelError::InvalidArgument);
            }
        }

        let backing = file.reopen();
        let mut entries = Vec::with_capacity(pages);
        for i in 0..pages {
            let ofs = i * PGSIZE;
            let read = (len - ofs).min(PGSIZE);
            let entry = SptEntry::new_file(
                addr + ofs,
                true,
                backing.clone(),
                ofs as u32,
                read,
                PGSIZE - read,
                true,
            );
            self.spt.insert(Arc::clone(&entry))?;
            entries.push(entry);
        }

        let mut next = self.next_mapid.lock();
        let mapid = *next;
        *next += 1;
        drop(next);
        self.mmaps.lock().push(MmapRegion {
            mapid,
            file: backing,
            pages: entries,
        });
        debug!("pid {}: mmap {:#x} ({} pages) -> {}", self.pid, addr, pages, mapid);
        Ok(mapid)
    }

    // Unmaps a region: dirty present pages reach the file, then every
    // page is forgotten.
    pub fn munmap(&self, mapid: i32) -> Result<()> {
        let region = {
            let mut mmaps = self.mmaps.lock();
            let idx = mmaps
                .iter()
                .position(|r| r.mapid == mapid)
                .ok_or(KernelError::NotFound)?;
            mmaps.swap_remove(idx)
        };
        for entry in &region.pages {
            entry.teardown(&self.kernel.frames, &self.pagetable);
            self.spt.remove(entry.addr);
        }
        drop(region.file);
        Ok(())
    }

    // Page-fault policy. Called for an access at `addr` (write or
    // read), with the faulting thread's stack pointer when known.
    // Returns Err when the process should die with exit code -1.
    pub fn handle_fault(&self, addr: usize, write: bool, esp: Option<usize>) -> Result<()> {
        if !is_user_vaddr(addr) {
            return Err(KernelError::InvalidUserAccess);
        }
        if let Some(entry) = self.spt.get(addr) {
            if write && !entry.writable {
                return Err(KernelError::PermissionViolation);
            }
            return entry.load(&self.kernel.frames, &self.pagetable, false);
        }
        let in_stack_window = esp.map_or(false, |esp| addr + STACK_SLOP >= esp);
        if in_stack_window && PHYS_BASE - pg_round_down(addr) <= STACK_LIMIT {
            return self.spt.stack_growth(&self.kernel.frames, &self.pagetable, addr);
        }
        Err(KernelError::InvalidUserAccess)
    }

    // Simulated user load/store. Faults exactly as the MMU would: an
    // unmapped page goes through handle_fault (with stack growth when
    // `esp` says so), a store to a read-only mapping kills the process.
    pub fn user_load(&self, addr: usize, esp: Option<usize>) -> Result<u8> {
        self.access(addr, None, esp)
    }

    pub fn user_store(&self, addr: usize, byte: u8, esp: Option<usize>) -> Result<()> {
        self.access(addr, Some(byte), esp).map(|_| ())
    }

    fn access(&self, addr: usize, write: Option<u8>, esp: Option<usize>) -> Result<u8> {
        loop {
            let vpage = pg_round_down(addr);
            let pte = match self.pagetable.get(vpage) {
                Some(pte) => pte,
                None => {
                    if let Err(e) = self.handle_fault(addr, write.is_some(), esp) {
                        self.exit(-1);
                        return Err(e);
                    }
                    continue;
                }
            };
            if write.is_some() && !pte.flags.contains(PteFlags::WRITABLE) {
                self.exit(-1);
                return Err(KernelError::PermissionViolation);
            }
            let page = self.kernel.frames.pool().page(pte.pfn);
            let mut frame = page.lock();
            // The frame may have been evicted between the table lookup
            // and the frame lock; retry the access if so.
            match self.pagetable.get(vpage) {
                Some(now) if now.pfn == pte.pfn => {}
                _ => continue,
            }
            self.pagetable.touch(vpage, write.is_some());
            let b = match write {
                Some(b) => {
                    frame[addr - vpage] = b;
                    b
                }
                None => frame[addr - vpage],
            };
            return Ok(b);
        }
    }

    // Kernel copies into / out of a pinned user buffer. The pages were
    // validated and pinned beforehand, so a missing mapping is a bug.
    pub(crate) fn copy_out(&self, addr: usize, src: &[u8]) -> Result<()> {
        let mut addr = addr;
        let mut src = src;
        while !src.is_empty() {
            let vpage = pg_round_down(addr);
            let chunk = src.len().min(vpage + PGSIZE - addr);
            let pte = self
                .pagetable
                .get(vpage)
                .ok_or(KernelError::InvalidUserAccess)?;
            let mut frame = self.kernel.frames.pool().page(pte.pfn).lock();
            self.pagetable.touch(vpage, true);
            frame[addr - vpage..addr - vpage + chunk].copy_from_slice(&src[..chunk]);
            addr += chunk;
            src = &src[chunk..];
        }
        Ok(())
    }

    pub(crate) fn copy_in(&self, dst: &mut [u8], addr: usize) -> Result<()> {
        let mut addr = addr;
        let mut dst = &mut dst[..];
        while !dst.is_empty() {
            let vpage = pg_round_down(addr);
            let chunk = dst.len().min(vpage + PGSIZE - addr);
            let pte = self
                .pagetable
                .get(vpage)
                .ok_or(KernelError::InvalidUserAccess)?;
            let frame = self.kernel.frames.pool().page(pte.pfn).lock();
            self.pagetable.touch(vpage, false);
            dst[..chunk].copy_from_slice(&frame[addr - vpage..addr - vpage + chunk]);
            addr += chunk;
            dst = &mut dst[chunk..];
        }
        Ok(())
    }

    // Pins every page of [addr, addr+len) into memory before the kernel
    // touches the buffer on a syscall's behalf, growing the stack where
    // the fault policy allows it. With `need_write`, read-only pages are
    // rejected. On failure the process dies with exit code -1 and the
    // pages pinned so far are released.
    pub(crate) fn pin_buffer(
        &self,
        addr: usize,
        len: usize,
        need_write: bool,
        esp: Option<usize>,
    ) -> Result<Vec<Arc<SptEntry>>> {
        let mut pinned = Vec::new();
        if len == 0 {
            return Ok(pinned);
        }
        let first = pg_round_down(addr);
        let last = pg_round_down(addr + len - 1);
        let mut vpage = first;
        loop {
            match self.try_pin_page(vpage, need_write, esp) {
                Ok(entry) => pinned.push(entry),
                Err(e) => {
                    unpin_all(&pinned);
                    self.exit(-1);
                    return Err(e);
                }
            }
            if vpage == last {
                break;
            }
            vpage += PGSIZE;
        }
        Ok(pinned)
    }

    fn try_pin_page(
        &self,
        vpage: usize,
        need_write: bool,
        esp: Option<usize>,
    ) -> Result<Arc<SptEntry>> {
        if !is_user_vaddr(vpage) {
            return Err(KernelError::InvalidUserAccess);
        }
        if let Some(entry) = self.spt.get(vpage) {
            if need_write && !entry.writable {
                return Err(KernelError::PermissionViolation);
            }
            entry.load(&self.kernel.frames, &self.pagetable, true)?;
            return Ok(entry);
        }
        let in_stack_window = esp.map_or(false, |esp| vpage + PGSIZE + STACK_SLOP > esp);
        if in_stack_window && PHYS_BASE - vpage <= STACK_LIMIT {
            self.spt
                .stack_growth(&self.kernel.frames, &self.pagetable, vpage)?;
            let entry = self.spt.get(vpage).unwrap();
            entry.load(&self.kernel.frames, &self.pagetable, true)?;
            return Ok(entry);
        }
        Err(KernelError::InvalidUserAccess)
    }

    // Duplicates the address space and the process-level state. Present
    // pages that have diverged from their backing file are copied frame
    // to frame; swapped-out pages get their own slots; clean lazy pages
    // stay lazy. Descriptors share file positions, as fork does.
    pub fn fork(self: &Arc<Self>) -> Result<Arc<Process>> {
        let child = self.kernel.spawn();
        *child.cwd.lock() = self.cwd.lock().as_ref().map(|d| d.reopen());
        *child.fds.lock() = self.fds.lock().clone();
        *child.next_mapid.lock() = *self.next_mapid.lock();

        for entry in self.spt.entries() {
            let st = entry.state.lock();
            let dirty = st.present && self.pagetable.is_dirty(entry.addr);
            match &st.backing {
                Backing::File {
                    file,
                    ofs,
                    read_bytes,
                    zero_bytes,
                    mmap,
                } => {
                    let centry = SptEntry::new_file(
                        entry.addr,
                        entry.writable,
                        file.clone(),
                        *ofs,
                        *read_bytes,
                        *zero_bytes,
                        *mmap,
                    );
                    if dirty {
                        self.copy_frame_into(&child, &centry, st.pfn.unwrap())?;
                        child.pagetable.touch(entry.addr, true);
                    }
                    child.spt.insert(centry)?;
                }
                Backing::Swap { slot } => {
                    let centry = SptEntry::new_anon(entry.addr);
                    if st.present {
                        self.copy_frame_into(&child, &centry, st.pfn.unwrap())?;
                    } else if let Some(slot) = slot {
                        let copy = self.kernel.frames.swap().duplicate(*slot);
                        if let Backing::Swap { slot } = &mut centry.state.lock().backing {
                            *slot = Some(copy);
                        }
                    }
                    child.spt.insert(centry)?;
                }
            }
        }

        // Rebuild the mmap regions over the child's own entries.
        let mut child_regions = Vec::new();
        for region in self.mmaps.lock().iter() {
            let pages = region
                .pages
                .iter()
                .map(|p| child.spt.get(p.addr).expect("forked mmap page missing"))
                .collect();
            child_regions.push(MmapRegion {
                mapid: region.mapid,
                file: region.file.reopen(),
                pages,
            });
        }
        *child.mmaps.lock() = child_regions;

        debug!("pid {}: forked pid {}", self.pid, child.pid);
        Ok(child)
    }

    // Copies the parent's resident frame into a fresh frame of the
    // child and makes the child's entry present. The parent entry's
    // state lock is held by the caller, which keeps the source frame
    // from being evicted mid-copy.
    fn copy_frame_into(
        &self,
        child: &Arc<Process>,
        centry: &Arc<SptEntry>,
        src_pfn: usize,
    ) -> Result<()> {
        let frames = &self.kernel.frames;
        let mut cst = centry.state.lock();
        let pfn = frames.acquire(centry, &child.pagetable, false);
        {
            let src = frames.pool().page(src_pfn).lock();
            let mut dst = frames.pool().page(pfn).lock();
            dst.copy_from_slice(&src[..]);
        }
        if !child.pagetable.map(centry.addr, pfn, centry.writable) {
            panic!("forked page {:#x} already mapped", centry.addr);
        }
        cst.present = true;
        cst.pfn = Some(pfn);
        Ok(())
    }

    // Releases everything: mappings written back, frames and swap slots
    // freed, descriptors and cwd dropped. Idempotent; the first caller
    // wins.
    pub fn exit(&self, code: i32) {
        {
            let mut exit_code = self.exit_code.lock();
            if exit_code.is_some() {
                return;
            }
            *exit_code = Some(code);
        }
        debug!("pid {}: exit({})", self.pid, code);

        let regions: Vec<MmapRegion> = self.mmaps.lock().drain(..).collect();
        for region in &regions {
            for entry in &region.pages {
                entry.teardown(&self.kernel.frames, &self.pagetable);
                self.spt.remove(entry.addr);
            }
        }
        drop(regions);

        for entry in self.spt.take_all() {
            entry.teardown(&self.kernel.frames, &self.pagetable);
        }
        self.fds.lock().clear();
        self.cwd.lock().take();
    }
}

pub(crate) fn unpin_all(entries: &[Arc<SptEntry>]) {
    for entry in entries {
        entry.unpin();
    }
}
