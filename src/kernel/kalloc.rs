// User frame pool: a fixed arena of page-sized buffers standing in for
// the physical pages available to user mappings. Frames are named by
// index (the simulated physical frame number); each frame's bytes sit
// behind their own lock, which is held only for the duration of a copy
// or a device transfer.

use crate::param::PGSIZE;
use crate::sync::Mutex;
use core::ops::{Deref, DerefMut};

pub struct Page([u8; PGSIZE]);

impl Page {
    fn new() -> Self {
        Page([0; PGSIZE])
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

pub struct UserPool {
    frames: Vec<Mutex<Page>>,
    free: Mutex<Vec<usize>>,
}

impl UserPool {
    pub fn new(nframes: usize) -> Self {
        Self {
            frames: (0..nframes).map(|_| Mutex::new(Page::new(), "frame")).collect(),
            free: Mutex::new((0..nframes).rev().collect(), "frame pool"),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn alloc(&self) -> Option<usize> {
        self.free.lock().pop()
    }

    pub fn free(&self, pfn: usize) {
        let mut free = self.free.lock();
        debug_assert!(!free.contains(&pfn), "double free of frame {}", pfn);
        free.push(pfn);
    }

    // The frame's bytes. Lock to touch them.
    pub fn page(&self, pfn: usize) -> &Mutex<Page> {
        &self.frames[pfn]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_every_frame_once() {
        let pool = UserPool::new(8);
        let mut got = Vec::new();
        while let Some(pfn) = pool.alloc() {
            got.push(pfn);
        }
        got.sort();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
        pool.free(3);
        assert_eq!(pool.alloc(), Some(3));
        assert_eq!(pool.alloc(), None);
    }
}
