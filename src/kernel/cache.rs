// Block cache.
//
// 64 fixed slots holding cached copies of filesystem sectors. A slot is
// either free (sector == INVALID_SECTOR) or owned by exactly one sector.
// Callers lock a sector SHARED or EXCLUSIVE; writers are preferred over
// readers so a writer is never starved by a stream of readers.
//
// Each slot keeps its counter state (reader/writer/waiter counts) and its
// payload behind separate locks: payload I/O can block for a disk round
// trip, counter updates never do. The payload lock also serializes the
// lazy fault-in of a sector, so only one thread reads it from disk.
//
// Interface:
// * lock(sector, mode) returns a guard pinning the slot to the sector.
// * guard.read() / guard.data_mut() fault the payload in and expose it.
// * guard.setzero() installs a zeroed payload without touching disk.
// * guard.mark_dirty() schedules write-back; dropping the guard unlocks.
// * discard(sector) forgets a sector whose disk blocks are being freed.
// * flush_all() writes every dirty up-to-date payload back.
// * readahead(sector) asks the background worker to pull a sector in.

use crate::block::BlockDevice;
use crate::param::{CACHE_SIZE, INVALID_SECTOR, SECTOR_SIZE};
use crate::sync::{Condvar, Mutex, MutexGuard};
use array_macro::array;
use core::ops::{Deref, DerefMut};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// Backoff when a full eviction sweep finds every slot in use.
const EVICT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct SlotState {
    sector: u32,
    readers: u32,
    writers: u32, // 0 or 1
    waiting_readers: u32,
    waiting_writers: u32,
}

// Payloads are 8-byte aligned so on-disk structures can be viewed in
// place with zerocopy.
#[repr(C, align(8))]
pub struct SectorBuf(pub [u8; SECTOR_SIZE]);

struct SlotData {
    buf: SectorBuf,
    // Contents match disk, or are a fresh replacement not yet flushed.
    up_to_date: bool,
    dirty: bool,
}

struct Slot {
    state: Mutex<SlotState>,
    no_users: Condvar,   // readers == 0 && writers == 0
    no_writers: Condvar, // writers == 0
    data: Mutex<SlotData>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(
                SlotState {
                    sector: INVALID_SECTOR,
                    readers: 0,
                    writers: 0,
                    waiting_readers: 0,
                    waiting_writers: 0,
                },
                "cache entry",
            ),
            no_users: Condvar::new(),
            no_writers: Condvar::new(),
            data: Mutex::new(
                SlotData {
                    buf: SectorBuf([0; SECTOR_SIZE]),
                    up_to_date: false,
                    dirty: false,
                },
                "cache data",
            ),
        }
    }
}

struct DaemonState {
    readahead_tx: Option<Sender<u32>>,
    readahead: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
    stop: bool,
}

struct CacheInner {
    dev: Arc<dyn BlockDevice>,
    slots: [Slot; CACHE_SIZE],
    // Serializes lookup, placement and the eviction cursor. Always
    // released before waiting on a slot.
    scan: Mutex<usize>,
    daemons: Mutex<DaemonState>,
    flusher_wake: Condvar,
}

#[derive(Clone)]
pub struct BlockCache {
    inner: Arc<CacheInner>,
}

enum TryLock<'a> {
    Locked(CacheGuard<'a>),
    // A slot was reclaimed; retry immediately.
    Evicted,
    // Every slot busy; back off before retrying.
    Full,
}

impl BlockCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let cache = Self {
            inner: Arc::new(CacheInner {
                dev,
                slots: array![_ => Slot::new(); CACHE_SIZE],
                scan: Mutex::new(0, "cache scan"),
                daemons: Mutex::new(
                    DaemonState {
                        readahead_tx: None,
                        readahead: None,
                        flusher: None,
                        stop: false,
                    },
                    "cache daemons",
                ),
                flusher_wake: Condvar::new(),
            }),
        };
        cache.start_readahead();
        cache
    }

    // Acquires `sector` in `mode`, evicting or backing off as needed.
    pub fn lock(&self, sector: u32, mode: LockMode) -> CacheGuard<'_> {
        debug_assert!(sector != INVALID_SECTOR);
        loop {
            match self.inner.try_lock(sector, mode) {
                TryLock::Locked(guard) => return guard,
                TryLock::Evicted => continue,
                TryLock::Full => thread::sleep(EVICT_BACKOFF),
            }
        }
    }

    // Forgets `sector` without write-back if it is cached and idle.
    // Called when the sector is being released on disk.
    pub fn discard(&self, sector: u32) {
        let _scan = self.inner.scan.lock();
        for slot in self.inner.slots.iter() {
            let mut st = slot.state.lock();
            if st.sector == sector {
                if st.readers == 0
                    && st.writers == 0
                    && st.waiting_readers == 0
                    && st.waiting_writers == 0
                {
                    st.sector = INVALID_SECTOR;
                }
                break;
            }
        }
    }

    // Writes every up-to-date dirty payload back to disk.
    pub fn flush_all(&self) {
        for slot in self.inner.slots.iter() {
            let sector = slot.state.lock().sector;
            if sector == INVALID_SECTOR {
                continue;
            }
            let guard = self.lock(sector, LockMode::Exclusive);
            let mut data = guard.slot.data.lock();
            if data.up_to_date && data.dirty {
                self.inner.dev.write(guard.sector, &data.buf.0);
                data.dirty = false;
            }
        }
    }

    // Queues `sector` for the background worker to fault in.
    pub fn readahead(&self, sector: u32) {
        let daemons = self.inner.daemons.lock();
        if let Some(tx) = daemons.readahead_tx.as_ref() {
            let _ = tx.send(sector);
        }
    }

    fn start_readahead(&self) {
        let (tx, rx) = mpsc::channel::<u32>();
        let cache = self.clone();
        let handle = thread::spawn(move || {
            while let Ok(sector) = rx.recv() {
                if sector >= cache.inner.dev.size() {
                    continue;
                }
                let guard = cache.lock(sector, LockMode::Shared);
                let _ = guard.read();
            }
        });
        let mut daemons = self.inner.daemons.lock();
        daemons.readahead_tx = Some(tx);
        daemons.readahead = Some(handle);
    }

    // Starts the periodic write-back thread. Off unless asked for.
    pub fn start_flusher(&self, period: Duration) {
        let cache = self.clone();
        let handle = thread::spawn(move || loop {
            let daemons = cache.inner.daemons.lock();
            if daemons.stop {
                break;
            }
            let (daemons, timed_out) = cache.inner.flusher_wake.wait_timeout(daemons, period);
            let stop = daemons.stop;
            drop(daemons);
            if stop {
                break;
            }
            if timed_out {
                cache.flush_all();
            }
        });
        self.inner.daemons.lock().flusher = Some(handle);
    }

    // Stops the background threads. Idempotent.
    pub fn shutdown(&self) {
        let mut daemons = self.inner.daemons.lock();
        daemons.readahead_tx.take();
        daemons.stop = true;
        let readahead = daemons.readahead.take();
        let flusher = daemons.flusher.take();
        drop(daemons);
        self.inner.flusher_wake.notify_all();
        if let Some(h) = readahead {
            let _ = h.join();
        }
        if let Some(h) = flusher {
            let _ = h.join();
        }
    }
}

impl CacheInner {
    fn try_lock(&self, sector: u32, mode: LockMode) -> TryLock<'_> {
        let mut scan = self.scan.lock();

        // Already cached?
        for slot in self.slots.iter() {
            let st = slot.state.lock();
            if st.sector == sector {
                drop(scan);
                self.wait_acquire(slot, st, mode);
                return TryLock::Locked(CacheGuard {
                    cache: self,
                    slot,
                    sector,
                    mode,
                });
            }
        }

        // Claim a free slot; the first read() faults the payload in.
        for slot in self.slots.iter() {
            let mut st = slot.state.lock();
            if st.sector == INVALID_SECTOR {
                debug_assert!(st.readers == 0 && st.writers == 0);
                st.sector = sector;
                match mode {
                    LockMode::Shared => st.readers = 1,
                    LockMode::Exclusive => st.writers = 1,
                }
                drop(st);
                let mut data = slot.data.lock();
                data.up_to_date = false;
                data.dirty = false;
                return TryLock::Locked(CacheGuard {
                    cache: self,
                    slot,
                    sector,
                    mode,
                });
            }
        }

        // No free slot: advance the clock hand looking for an idle victim.
        for _ in 0..CACHE_SIZE {
            let slot = &self.slots[*scan];
            *scan = (*scan + 1) % CACHE_SIZE;

            let mut st = slot.state.lock();
            if st.readers != 0
                || st.writers != 0
                || st.waiting_readers != 0
                || st.waiting_writers != 0
            {
                continue;
            }
            let victim = st.sector;
            // Pin exclusively while flushing so late lockers wait.
            st.writers = 1;
            drop(st);
            drop(scan);

            {
                let mut data = slot.data.lock();
                if data.up_to_date && data.dirty {
                    self.dev.write(victim, &data.buf.0);
                    data.dirty = false;
                }
            }

            let mut st = slot.state.lock();
            st.writers = 0;
            if st.waiting_readers == 0 && st.waiting_writers == 0 {
                st.sector = INVALID_SECTOR;
            } else if st.waiting_readers > 0 {
                // A waiter arrived during the flush; the slot is theirs.
                slot.no_writers.notify_all();
            } else {
                slot.no_users.notify_one();
            }
            return TryLock::Evicted;
        }

        TryLock::Full
    }

    // Blocks until the already-cached `slot` can be held in `mode`.
    // Writers are preferred: new readers queue behind any waiting writer,
    // and a releasing writer hands the slot to waiting readers only if
    // there are any, else to the next writer.
    fn wait_acquire<'a>(&self, slot: &'a Slot, mut st: MutexGuard<'a, SlotState>, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                st.waiting_readers += 1;
                if st.writers > 0 || st.waiting_writers > 0 {
                    loop {
                        st = slot.no_writers.wait(st);
                        if st.writers == 0 {
                            break;
                        }
                    }
                }
                st.readers += 1;
                st.waiting_readers -= 1;
            }
            LockMode::Exclusive => {
                st.waiting_writers += 1;
                if st.readers > 0 || st.waiting_readers > 0 || st.writers > 0 {
                    loop {
                        st = slot.no_users.wait(st);
                        if st.readers == 0 && st.writers == 0 {
                            break;
                        }
                    }
                }
                st.writers += 1;
                st.waiting_writers -= 1;
            }
        }
    }
}

// A held sector lock. Dropping releases it, waking a waiting writer or
// all waiting readers as appropriate.
pub struct CacheGuard<'a> {
    cache: &'a CacheInner,
    slot: &'a Slot,
    sector: u32,
    mode: LockMode,
}

// Shared view of a faulted-in payload.
pub struct SectorData<'a>(MutexGuard<'a, SlotData>);

impl<'a> Deref for SectorData<'a> {
    type Target = [u8; SECTOR_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0.buf.0
    }
}

// Mutable view; only handed to exclusive holders.
pub struct SectorDataMut<'a>(MutexGuard<'a, SlotData>);

impl<'a> Deref for SectorDataMut<'a> {
    type Target = [u8; SECTOR_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0.buf.0
    }
}

impl<'a> DerefMut for SectorDataMut<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0.buf.0
    }
}

impl<'a> CacheGuard<'a> {
    pub fn sector(&self) -> u32 {
        self.sector
    }

    fn fault_in(&self, data: &mut SlotData) {
        if !data.up_to_date {
            self.cache.dev.read(self.sector, &mut data.buf.0);
            data.up_to_date = true;
            data.dirty = false;
        }
    }

    // Payload for reading, fetched from disk on first touch.
    pub fn read(&self) -> SectorData<'_> {
        let mut data = self.slot.data.lock();
        self.fault_in(&mut data);
        SectorData(data)
    }

    // Payload for writing. Still faults in first: a partial overwrite
    // must preserve the rest of the sector.
    pub fn data_mut(&mut self) -> SectorDataMut<'_> {
        debug_assert_eq!(self.mode, LockMode::Exclusive);
        let mut data = self.slot.data.lock();
        self.fault_in(&mut data);
        SectorDataMut(data)
    }

    // Zero-fills the payload without reading disk. For sectors whose
    // previous contents are dead, e.g. freshly allocated ones.
    pub fn setzero(&mut self) -> SectorDataMut<'_> {
        debug_assert_eq!(self.mode, LockMode::Exclusive);
        let mut data = self.slot.data.lock();
        data.buf.0.fill(0);
        data.up_to_date = true;
        data.dirty = true;
        SectorDataMut(data)
    }

    pub fn mark_dirty(&self) {
        self.slot.data.lock().dirty = true;
    }
}

impl<'a> Drop for CacheGuard<'a> {
    fn drop(&mut self) {
        let mut st = self.slot.state.lock();
        match self.mode {
            LockMode::Shared => {
                debug_assert!(st.readers > 0);
                st.readers -= 1;
                if st.readers == 0 {
                    self.slot.no_users.notify_one();
                }
            }
            LockMode::Exclusive => {
                debug_assert_eq!(st.writers, 1);
                st.writers -= 1;
                if st.waiting_readers > 0 {
                    self.slot.no_writers.notify_all();
                } else {
                    self.slot.no_users.notify_one();
                }
            }
        }
    }
}
