// Supplemental page table: the per-process map from each reserved user
// page to the instructions for materializing it. A page is either
// file-backed (an executable segment or an mmap window: read so many
// bytes at an offset, zero the tail) or anonymous (zero-filled at first
// touch, kept in a swap slot while evicted).
//
// Exactly one place holds a page's truth: the frame while present, the
// type-specific backing store otherwise. The entry's state lock covers
// that hand-off; it is held for the whole of a load, so eviction (which
// try-locks) can never race a fault on the same page.

use crate::error::{KernelError, Result};
use crate::file::File;
use crate::frame::FrameTable;
use crate::pagetable::{pg_round_down, PageTable};
use crate::param::{PGSIZE, PHYS_BASE, STACK_LIMIT};
use crate::sync::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

// Where a page's canonical contents live while it is not resident.
pub enum Backing {
    File {
        file: File,
        ofs: u32,
        read_bytes: usize,
        zero_bytes: usize,
        // Dirty mmap pages write back to the file; dirty non-mmap
        // (segment) pages are promoted to swap instead.
        mmap: bool,
    },
    Swap {
        // None until first evicted.
        slot: Option<usize>,
    },
}

pub struct SptState {
    pub(crate) backing: Backing,
    pub(crate) present: bool,
    // Disables eviction while a syscall holds a pointer into the frame.
    pub(crate) pinned: bool,
    pub(crate) pfn: Option<usize>,
}

pub struct SptEntry {
    pub addr: usize,
    pub writable: bool,
    pub(crate) state: Mutex<SptState>,
}

impl SptEntry {
    pub fn new_file(
        addr: usize,
        writable: bool,
        file: File,
        ofs: u32,
        read_bytes: usize,
        zero_bytes: usize,
        mmap: bool,
    ) -> Arc<Self> {
        debug_assert_eq!(addr % PGSIZE, 0);
        debug_assert_eq!(read_bytes + zero_bytes, PGSIZE);
        Arc::new(Self {
            addr,
            writable,
            state: Mutex::new(
                SptState {
                    backing: Backing::File {
                        file,
                        ofs,
                        read_bytes,
                        zero_bytes,
                        mmap,
                    },
                    present: false,
                    pinned: false,
                    pfn: None,
                },
                "spt entry",
            ),
        })
    }

    // A zero-filled anonymous page (stack growth).
    pub fn new_anon(addr: usize) -> Arc<Self> {
        debug_assert_eq!(addr % PGSIZE, 0);
        Arc::new(Self {
            addr,
            writable: true,
            state: Mutex::new(
                SptState {
                    backing: Backing::Swap { slot: None },
                    present: false,
                    pinned: false,
                    pfn: None,
                },
                "spt entry",
            ),
        })
    }

    pub fn is_present(&self) -> bool {
        self.state.lock().present
    }

    pub fn is_pinned(&self) -> bool {
        self.state.lock().pinned
    }

    pub fn frame(&self) -> Option<usize> {
        self.state.lock().pfn
    }

    pub fn is_mmap(&self) -> bool {
        matches!(self.state.lock().backing, Backing::File { mmap: true, .. })
    }

    // Makes the page resident: grabs a frame (evicting if needed),
    // fills it from the backing store and installs the mapping. With
    // `pin`, the page stays unevictable until unpin().
    pub fn load(self: &Arc<Self>, frames: &FrameTable, pt: &Arc<PageTable>, pin: bool) -> Result<()> {
        let mut st = self.state.lock();
        if pin {
            st.pinned = true;
        }
        if st.present {
            return Ok(());
        }

        enum Source {
            File { file: File, ofs: u32, read_bytes: usize },
            Swap(Option<usize>),
        }
        let source = match &st.backing {
            Backing::File {
                file, ofs, read_bytes, ..
            } => Source::File {
                file: file.clone(),
                ofs: *ofs,
                read_bytes: *read_bytes,
            },
            Backing::Swap { slot } => Source::Swap(*slot),
        };

        let pfn = match source {
            Source::File {
                file,
                ofs,
                read_bytes,
            } => {
                let pfn = frames.acquire(self, pt, read_bytes == 0);
                if read_bytes > 0 {
                    let _fs = frames.fs_lock();
                    let mut page = frames.pool().page(pfn).lock();
                    let n = file.read_at(&mut page[..read_bytes], ofs);
                    if n != read_bytes {
                        drop(page);
                        frames.release(pfn);
                        if pin {
                            st.pinned = false;
                        }
                        return Err(KernelError::NotFound);
                    }
                    page[read_bytes..].fill(0);
                }
                pfn
            }
            Source::Swap(slot) => {
                let pfn = frames.acquire(self, pt, slot.is_none());
                if let Some(slot) = slot {
                    let mut page = frames.pool().page(pfn).lock();
                    frames.swap().load(slot, &mut page);
                }
                if let Backing::Swap { slot } = &mut st.backing {
                    *slot = None;
                }
                pfn
            }
        };

        if !pt.map(self.addr, pfn, self.writable) {
            panic!("page {:#x} mapped while absent from its frame", self.addr);
        }
        st.present = true;
        st.pfn = Some(pfn);
        Ok(())
    }

    pub fn unpin(&self) {
        self.state.lock().pinned = false;
    }

    // Evicts nothing, writes back nothing it does not have to: a dirty
    // present mmap page reaches its file, a swap slot is given back,
    // the frame and mapping go away. For munmap and process teardown.
    pub(crate) fn teardown(&self, frames: &FrameTable, pt: &PageTable) {
        let mut st = self.state.lock();
        if st.present {
            let pfn = st.pfn.take().expect("present without frame");
            if pt.is_dirty(self.addr) {
                if let Backing::File {
                    file,
                    ofs,
                    read_bytes,
                    mmap: true,
                    ..
                } = &st.backing
                {
                    let file = file.clone();
                    let (ofs, len) = (*ofs, *read_bytes);
                    let _fs = frames.fs_lock();
                    let page = frames.pool().page(pfn).lock();
                    file.write_at(&page[..len], ofs);
                }
            }
            pt.clear(self.addr);
            frames.release(pfn);
            st.present = false;
        } else {
            let freed = match &mut st.backing {
                Backing::Swap { slot } => slot.take(),
                _ => None,
            };
            if let Some(slot) = freed {
                frames.swap().free_slot(slot);
            }
        }
    }
}

// The per-process page -> entry map.
pub struct Spt {
    map: Mutex<HashMap<usize, Arc<SptEntry>>>,
}

impl Spt {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new(), "spt"),
        }
    }

    pub fn get(&self, addr: usize) -> Option<Arc<SptEntry>> {
        self.map.lock().get(&pg_round_down(addr)).cloned()
    }

    pub fn insert(&self, entry: Arc<SptEntry>) -> Result<()> {
        let mut map = self.map.lock();
        if map.contains_key(&entry.addr) {
            return Err(KernelError::AlreadyExists);
        }
        map.insert(entry.addr, entry);
        Ok(())
    }

    pub fn remove(&self, addr: usize) -> Option<Arc<SptEntry>> {
        self.map.lock().remove(&pg_round_down(addr))
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<Arc<SptEntry>> {
        self.map.lock().values().cloned().collect()
    }

    pub fn take_all(&self) -> Vec<Arc<SptEntry>> {
        self.map.lock().drain().map(|(_, e)| e).collect()
    }

    // Materializes a fresh zero-filled stack page at `addr`. Valid only
    // within the stack cap below PHYS_BASE.
    pub fn stack_growth(
        &self,
        frames: &FrameTable,
        pt: &Arc<PageTable>,
        addr: usize,
    ) -> Result<()> {
        let vpage = pg_round_down(addr);
        if vpage >= PHYS_BASE || PHYS_BASE - vpage > STACK_LIMIT {
            return Err(KernelError::InvalidUserAccess);
        }
        let entry = SptEntry::new_anon(vpage);
        self.insert(Arc::clone(&entry))?;
        entry.load(frames, pt, false)
    }
}
