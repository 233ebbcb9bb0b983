// Thread-abstraction seam. The scheduler outside the core provides
// blocking mutexes, condition variables and counting semaphores; hosted,
// those are thin wrappers over std::sync in the shape the rest of the
// kernel expects. A poisoned lock means a thread died while holding it,
// which the kernel treats as an ordinary unlock.

use core::fmt;
use core::ops::{Deref, DerefMut};
use std::sync::{self, PoisonError};
use std::time::Duration;

pub struct Mutex<T> {
    inner: sync::Mutex<T>,
    name: &'static str,
}

pub struct MutexGuard<'a, T>(sync::MutexGuard<'a, T>);

impl<T> Mutex<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            inner: sync::Mutex::new(data),
            name,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard(self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    // Used on paths that must not wait behind another holder, such as
    // the eviction scan probing page-table entries.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(MutexGuard(guard)),
            Err(sync::TryLockError::Poisoned(e)) => Some(MutexGuard(e.into_inner())),
            Err(sync::TryLockError::WouldBlock) => None,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mutex({})", self.name)
    }
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

pub struct Condvar {
    inner: sync::Condvar,
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish()
    }
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        MutexGuard(
            self.inner
                .wait(guard.0)
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    // Returns the guard and whether the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        match self.inner.wait_timeout(guard.0, dur) {
            Ok((g, timeout)) => (MutexGuard(g), timeout.timed_out()),
            Err(e) => {
                let (g, timeout) = e.into_inner();
                (MutexGuard(g), timeout.timed_out())
            }
        }
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub const fn new(value: usize) -> Self {
        Self {
            count: Mutex::new(value, "semaphore"),
            cond: Condvar::new(),
        }
    }

    pub fn down(&self) {
        let mut cnt = self.count.lock();
        while *cnt == 0 {
            cnt = self.cond.wait(cnt);
        }
        *cnt -= 1;
    }

    pub fn up(&self) {
        let mut cnt = self.count.lock();
        *cnt += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn semaphore_orders_handoff() {
        let sema = Arc::new(Semaphore::new(0));
        let done = Arc::new(Mutex::new(0usize, "done"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let sema = Arc::clone(&sema);
            let done = Arc::clone(&done);
            handles.push(thread::spawn(move || {
                sema.down();
                *done.lock() += 1;
            }));
        }
        assert_eq!(*done.lock(), 0);
        for _ in 0..4 {
            sema.up();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*done.lock(), 4);
    }
}
