//! Per-entry reader/writer lock with writer preference.
//!
//! One mutex guards the counters; readers and writers wait on separate
//! condition variables.
//!
//! | Request | Blocks while |
//! |---------|--------------|
//! | read | a writer holds the entry or a writer is waiting |
//! | write | any reader holds the entry or another writer holds it |
//!
//! Releasing a write lock wakes one waiting writer if there is one, otherwise
//! every waiting reader. Releasing the last read lock wakes one writer.
//! The open-handle counter is bookkeeping only. There are no timeouts.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub readers: u32,
    pub write_locked: bool,
    pub writers_waiting: u32,
    pub open_handles: u32,
}

#[derive(Debug, Default)]
pub struct EntryLock {
    state: Mutex<LockState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
}

impl EntryLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until shared access is granted.
    pub fn read(&self) -> EntryReadGuard<'_> {
        let mut state = self.lock_state();
        while state.write_locked || state.writers_waiting > 0 {
            state = self
                .readers_cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.readers += 1;
        trace!(readers = state.readers, "entry_read_lock");
        EntryReadGuard { lock: self }
    }

    /// Block until exclusive access is granted.
    pub fn write(&self) -> EntryWriteGuard<'_> {
        let mut state = self.lock_state();
        state.writers_waiting += 1;
        while state.readers > 0 || state.write_locked {
            state = self
                .writers_cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.writers_waiting -= 1;
        state.write_locked = true;
        trace!(waiting = state.writers_waiting, "entry_write_lock");
        EntryWriteGuard { lock: self }
    }

    fn release_read(&self) {
        let mut state = self.lock_state();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.writers_cv.notify_one();
        }
        trace!(readers = state.readers, "entry_read_unlock");
    }

    fn release_write(&self) {
        let mut state = self.lock_state();
        state.write_locked = false;
        if state.writers_waiting > 0 {
            self.writers_cv.notify_one();
        } else {
            self.readers_cv.notify_all();
        }
        trace!(waiting = state.writers_waiting, "entry_write_unlock");
    }

    /// Count a logical open handle.
    pub fn open(&self) {
        self.lock_state().open_handles += 1;
    }

    pub fn close(&self) {
        let mut state = self.lock_state();
        state.open_handles = state.open_handles.saturating_sub(1);
    }

    #[must_use]
    pub fn snapshot(&self) -> LockState {
        *self.lock_state()
    }
}

/// Shared access to one entry; released on drop.
#[derive(Debug)]
pub struct EntryReadGuard<'a> {
    lock: &'a EntryLock,
}

impl Drop for EntryReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive access to one entry; released on drop.
#[derive(Debug)]
pub struct EntryWriteGuard<'a> {
    lock: &'a EntryLock,
}

impl Drop for EntryWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share() {
        let lock = EntryLock::new();
        let a = lock.read();
        let b = lock.read();
        assert_eq!(lock.snapshot().readers, 2);
        drop(a);
        drop(b);
        assert_eq!(lock.snapshot(), LockState::default());
    }

    #[test]
    fn writer_waits_for_readers() {
        let lock = Arc::new(EntryLock::new());
        let reader = lock.read();
        let acquired = Arc::new(AtomicU32::new(0));

        let handle = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _w = lock.write();
                acquired.store(1, Ordering::SeqCst);
            })
        };

        while lock.snapshot().writers_waiting == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(acquired.load(Ordering::SeqCst), 0);
        drop(reader);
        handle.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert!(!lock.snapshot().write_locked);
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let lock = Arc::new(EntryLock::new());
        let first = lock.read();

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _w = lock.write();
                thread::sleep(Duration::from_millis(5));
            })
        };
        while lock.snapshot().writers_waiting == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let late_reader = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _r = lock.read();
                // The writer ran first, so nobody is waiting any more.
                assert_eq!(lock.snapshot().writers_waiting, 0);
            })
        };
        thread::sleep(Duration::from_millis(5));
        assert_eq!(lock.snapshot().readers, 1);
        drop(first);
        writer.join().unwrap();
        late_reader.join().unwrap();
    }

    #[test]
    fn open_handles_are_counted() {
        let lock = EntryLock::new();
        lock.open();
        lock.open();
        lock.close();
        assert_eq!(lock.snapshot().open_handles, 1);
        lock.close();
        lock.close();
        assert_eq!(lock.snapshot().open_handles, 0);
    }
}
