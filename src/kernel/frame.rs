// Frame table: tracks every user frame in use, by whom, and in what
// order to consider them for eviction.
//
// Eviction is a second-chance sweep: pinned pages are skipped, a page
// whose accessed bit is set gets it cleared and another trip around the
// clock, and the first cold page becomes the victim. The victim's PTE is
// cleared first so its owner faults on the next touch, then the frame
// table lock is dropped and the contents are saved out: a dirty mmap
// page goes back to its file under the filesystem lock, a swap-backed
// page is dumped to swap, a dirtied file-backed segment is promoted to
// swap, and anything clean is simply dropped.
//
// The spte probe uses try_lock: a fault-path loader holds its entry's
// state lock while asking this table for a frame, so blocking on a
// state lock here could deadlock. A busy entry just keeps its frame for
// this sweep.

use crate::file::File;
use crate::kalloc::UserPool;
use crate::page::{Backing, SptEntry};
use crate::pagetable::PageTable;
use crate::swap::SwapTable;
use crate::sync::{Mutex, MutexGuard};
use log::trace;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread;

struct FrameEntry {
    pt: Arc<PageTable>,
    spte: Weak<SptEntry>,
}

struct FrameInner {
    // Clock order; holds the pfn of every frame in use.
    clock: VecDeque<usize>,
    // Dense pfn -> entry index.
    entries: Vec<Option<FrameEntry>>,
}

pub struct FrameTable {
    pool: UserPool,
    inner: Mutex<FrameInner>,
    swap: Arc<SwapTable>,
    fslock: Arc<Mutex<()>>,
}

enum WriteBack {
    FileDirty { file: File, ofs: u32, len: usize },
    SwapOut,
    Promote,
    Drop,
}

impl FrameTable {
    pub fn new(pool: UserPool, swap: Arc<SwapTable>, fslock: Arc<Mutex<()>>) -> Self {
        let n = pool.len();
        Self {
            pool,
            inner: Mutex::new(
                FrameInner {
                    clock: VecDeque::with_capacity(n),
                    entries: (0..n).map(|_| None).collect(),
                },
                "frame table",
            ),
            swap,
            fslock,
        }
    }

    pub fn pool(&self) -> &UserPool {
        &self.pool
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    pub fn fs_lock(&self) -> MutexGuard<'_, ()> {
        self.fslock.lock()
    }

    pub fn used_frames(&self) -> usize {
        self.pool.len() - self.pool.free_count()
    }

    // Hands out a frame for `spte`, evicting until one is available.
    // The caller holds the entry's state lock, so the fresh frame cannot
    // be stolen before the mapping is installed.
    pub fn acquire(&self, spte: &Arc<SptEntry>, pt: &Arc<PageTable>, zero: bool) -> usize {
        let pfn = loop {
            if let Some(pfn) = self.pool.alloc() {
                break pfn;
            }
            if let Some(pfn) = self.evict() {
                break pfn;
            }
            // Everything pinned or freshly accessed; let the pinners run.
            thread::yield_now();
        };
        if zero {
            self.pool.page(pfn).lock().fill(0);
        }
        let mut inner = self.inner.lock();
        inner.entries[pfn] = Some(FrameEntry {
            pt: Arc::clone(pt),
            spte: Arc::downgrade(spte),
        });
        inner.clock.push_back(pfn);
        pfn
    }

    // Returns a voluntarily freed frame to the pool.
    pub fn release(&self, pfn: usize) {
        let mut inner = self.inner.lock();
        inner.entries[pfn] = None;
        inner.clock.retain(|&p| p != pfn);
        drop(inner);
        self.pool.free(pfn);
    }

    // One second-chance sweep. Returns a reclaimed pfn, or None if two
    // passes found nothing evictable.
    fn evict(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        let limit = inner.clock.len() * 2;
        for _ in 0..limit {
            let pfn = inner.clock.pop_front()?;
            let entry = inner.entries[pfn].take().expect("frame without entry");

            let spte = match entry.spte.upgrade() {
                Some(spte) => spte,
                None => {
                    // Owner already torn down; the frame is free.
                    drop(inner);
                    return Some(pfn);
                }
            };

            let mut st = match spte.state.try_lock() {
                Some(st) => st,
                None => {
                    inner.entries[pfn] = Some(entry);
                    inner.clock.push_back(pfn);
                    continue;
                }
            };

            if st.pinned {
                drop(st);
                inner.entries[pfn] = Some(entry);
                inner.clock.push_back(pfn);
                continue;
            }

            if entry.pt.is_accessed(spte.addr) {
                entry.pt.set_accessed(spte.addr, false);
                drop(st);
                inner.entries[pfn] = Some(entry);
                inner.clock.push_back(pfn);
                continue;
            }

            // Victim found. Unmap it so the owner faults, then write the
            // contents out with the frame table lock released.
            let dirty = entry.pt.is_dirty(spte.addr);
            entry.pt.clear(spte.addr);
            drop(inner);

            let plan = match &st.backing {
                Backing::File {
                    file,
                    ofs,
                    read_bytes,
                    mmap: true,
                    ..
                } if dirty => WriteBack::FileDirty {
                    file: file.clone(),
                    ofs: *ofs,
                    len: *read_bytes,
                },
                Backing::File { mmap: true, .. } => WriteBack::Drop,
                Backing::File { mmap: false, .. } => {
                    if dirty {
                        WriteBack::Promote
                    } else {
                        WriteBack::Drop
                    }
                }
                Backing::Swap { .. } => WriteBack::SwapOut,
            };

            match plan {
                WriteBack::FileDirty { file, ofs, len } => {
                    trace!("evict {:#x}: write back to file", spte.addr);
                    let _fs = self.fslock.lock();
                    let page = self.pool.page(pfn).lock();
                    file.write_at(&page[..len], ofs);
                }
                WriteBack::SwapOut => {
                    trace!("evict {:#x}: dump to swap", spte.addr);
                    let slot = {
                        let page = self.pool.page(pfn).lock();
                        self.swap.dump(&page)
                    };
                    if let Backing::Swap { slot: s } = &mut st.backing {
                        *s = Some(slot);
                    }
                }
                WriteBack::Promote => {
                    // A writable segment was modified; its file copy is
                    // stale from now on.
                    trace!("evict {:#x}: promote to swap", spte.addr);
                    let slot = {
                        let page = self.pool.page(pfn).lock();
                        self.swap.dump(&page)
                    };
                    st.backing = Backing::Swap { slot: Some(slot) };
                }
                WriteBack::Drop => {
                    trace!("evict {:#x}: drop clean page", spte.addr);
                }
            }

            st.present = false;
            st.pfn = None;
            return Some(pfn);
        }
        None
    }
}
