//! Reader/writer lock owned by each node identifier.
//!
//! Unlike `parking_lot::RwLock`, acquisition and release are separate calls so
//! guards can own an `Arc` of the identifier and outlive the borrow that took
//! them. The write side is reentrant for the owning thread, and that thread may
//! also take read locks on a node it is writing. Readers that arrive while a
//! writer is queued wait behind it.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: Option<ThreadId>,
    write_depth: usize,
    waiting_writers: usize,
}

#[derive(Debug, Default)]
pub(crate) struct NodeLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl NodeLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take a shared hold. Returns `false` if `timeout` elapsed first.
    pub(crate) fn acquire_read(&self, timeout: Option<Duration>) -> bool {
        let me = thread::current().id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            let owned_by_me = state.writer == Some(me);
            if owned_by_me || (state.writer.is_none() && state.waiting_writers == 0) {
                state.readers += 1;
                return true;
            }
            if !self.wait(&mut state, deadline) {
                return false;
            }
        }
    }

    pub(crate) fn release_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "read lock released without being held");
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// Take the exclusive hold, reentrantly for the owning thread.
    pub(crate) fn acquire_write(&self, timeout: Option<Duration>) -> bool {
        let me = thread::current().id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.write_depth += 1;
            return true;
        }
        state.waiting_writers += 1;
        loop {
            if state.writer.is_none() && state.readers == 0 {
                state.waiting_writers -= 1;
                state.writer = Some(me);
                state.write_depth = 1;
                return true;
            }
            if !self.wait(&mut state, deadline) {
                state.waiting_writers -= 1;
                // readers queued behind us may proceed now
                self.cond.notify_all();
                return false;
            }
        }
    }

    /// Non-blocking exclusive attempt. Reentrant for the owner.
    pub(crate) fn try_acquire_write(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.write_depth += 1;
            return true;
        }
        if state.writer.is_none() && state.readers == 0 {
            state.writer = Some(me);
            state.write_depth = 1;
            return true;
        }
        false
    }

    pub(crate) fn release_write(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(
            state.writer,
            Some(thread::current().id()),
            "write lock released by a thread that does not own it"
        );
        state.write_depth = state.write_depth.saturating_sub(1);
        if state.write_depth == 0 {
            state.writer = None;
            self.cond.notify_all();
        }
    }

    /// No reader currently holds the lock. A hint only.
    pub(crate) fn is_writable(&self) -> bool {
        self.state.lock().readers == 0
    }

    pub(crate) fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.readers > 0 || state.writer.is_some()
    }

    pub(crate) fn is_write_held_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    fn wait(
        &self,
        state: &mut parking_lot::MutexGuard<'_, LockState>,
        deadline: Option<Instant>,
    ) -> bool {
        match deadline {
            None => {
                self.cond.wait(state);
                true
            }
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return false;
                }
                // spurious or unrelated wakeups loop back to the caller's check
                self.cond.wait_until(state, deadline);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shared_readers() {
        let lock = NodeLock::new();
        assert!(lock.acquire_read(None));
        assert!(lock.acquire_read(None));
        assert!(lock.is_locked());
        assert!(!lock.is_writable());

        lock.release_read();
        lock.release_read();
        assert!(!lock.is_locked());
        assert!(lock.is_writable());
    }

    #[test]
    fn test_reentrant_write() {
        let lock = NodeLock::new();
        assert!(lock.acquire_write(None));
        assert!(lock.acquire_write(None));
        assert!(lock.try_acquire_write());
        assert!(lock.is_write_held_by_current_thread());

        // the owner may also read
        assert!(lock.acquire_read(None));
        lock.release_read();

        lock.release_write();
        lock.release_write();
        assert!(lock.is_locked());
        lock.release_write();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_write_times_out_while_read_held() {
        let lock = Arc::new(NodeLock::new());
        assert!(lock.acquire_read(None));

        let contender = Arc::clone(&lock);
        let acquired = std::thread::spawn(move || {
            contender.acquire_write(Some(Duration::from_millis(30)))
        })
        .join()
        .unwrap();
        assert!(!acquired);

        // a timed-out writer must not keep blocking new readers
        assert!(lock.acquire_read(Some(Duration::from_millis(30))));
        lock.release_read();
        lock.release_read();
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(NodeLock::new());
        assert!(lock.acquire_write(None));

        let reader_done = Arc::new(AtomicBool::new(false));
        let handle = {
            let lock = Arc::clone(&lock);
            let reader_done = Arc::clone(&reader_done);
            std::thread::spawn(move || {
                assert!(lock.acquire_read(None));
                reader_done.store(true, Ordering::SeqCst);
                lock.release_read();
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!reader_done.load(Ordering::SeqCst));
        lock.release_write();
        handle.join().unwrap();
        assert!(reader_done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_try_write_fails_when_contended() {
        let lock = Arc::new(NodeLock::new());
        assert!(lock.acquire_read(None));

        let other = Arc::clone(&lock);
        let got = std::thread::spawn(move || other.try_acquire_write())
            .join()
            .unwrap();
        assert!(!got);
        lock.release_read();
    }
}
