// The kernel aggregate: one filesystem (cache, free map, open inodes),
// one frame table over one user pool, one swap table, the global
// filesystem lock and the console. Everything a process touches hangs
// off an Arc<Kernel>, so tests and tools build isolated instances.

use crate::block::BlockDevice;
use crate::filesys::Filesys;
use crate::frame::FrameTable;
use crate::kalloc::UserPool;
use crate::param::NFRAME;
use crate::proc::Process;
use crate::swap::SwapTable;
use crate::sync::{Mutex, MutexGuard};
use log::info;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct KernelOptions {
    // Lay down a fresh filesystem on mount.
    pub format: bool,
    // Size of the user frame pool.
    pub user_frames: usize,
    // Period of the background cache flusher; None leaves it off.
    pub flush_period: Option<Duration>,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            format: true,
            user_frames: NFRAME,
            flush_period: None,
        }
    }
}

struct Console {
    out: Mutex<Vec<u8>>,
}

pub struct Kernel {
    pub fs: Filesys,
    pub frames: FrameTable,
    // Held across user-visible filesystem syscalls; the eviction
    // write-back path takes it only after dropping frame-table locks.
    fslock: Arc<Mutex<()>>,
    console: Console,
    next_pid: AtomicU32,
}

impl Kernel {
    pub fn new(
        fs_dev: Arc<dyn BlockDevice>,
        swap_dev: Arc<dyn BlockDevice>,
        opts: KernelOptions,
    ) -> Arc<Kernel> {
        let fslock = Arc::new(Mutex::new((), "filesys"));
        let swap = Arc::new(SwapTable::new(swap_dev));
        info!(
            "kernel: {} user frames, {} swap slots",
            opts.user_frames,
            swap.slots()
        );
        let frames = FrameTable::new(
            UserPool::new(opts.user_frames),
            Arc::clone(&swap),
            Arc::clone(&fslock),
        );
        let fs = Filesys::mount(fs_dev, opts.format, opts.flush_period);
        Arc::new(Kernel {
            fs,
            frames,
            fslock,
            console: Console {
                out: Mutex::new(Vec::new(), "console"),
            },
            next_pid: AtomicU32::new(1),
        })
    }

    pub fn fs_lock(&self) -> MutexGuard<'_, ()> {
        self.fslock.lock()
    }

    pub fn spawn(self: &Arc<Self>) -> Arc<Process> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        Process::new(self, pid)
    }

    // Best-effort flush of all on-disk state. Background daemons stop
    // when the filesystem is dropped.
    pub fn shutdown(&self) {
        self.fs.flush();
    }

    pub(crate) fn console_write(&self, bytes: &[u8]) {
        self.console.out.lock().extend_from_slice(bytes);
    }

    // Everything written to fd 1 so far.
    pub fn console_output(&self) -> Vec<u8> {
        self.console.out.lock().clone()
    }
}
