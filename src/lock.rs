//! Per-stream mutual exclusion with owner tracking.
//!
//! Every slow-path operation of a buffered stream runs inside
//! [`StreamLock::enter`]. The returned [`LockGuard`] clears the owner and
//! releases the mutex when dropped, so every exit path (including `?`)
//! leaves the lock.
//!
//! Acquisition order:
//!
//! 1. Try a non-blocking acquire. On success, record the calling thread as owner.
//! 2. Otherwise, if the calling thread already owns the lock, fail with
//!    `Error::ReentrantCall` instead of deadlocking.
//! 3. Otherwise block. During process shutdown (see [`begin_shutdown`]) the
//!    wait is bounded by [`SHUTDOWN_LOCK_TIMEOUT`] and ends in
//!    `Error::LockTimeout`.

use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{trace, warn};

/// Upper bound on lock waits once shutdown has begun.
pub const SHUTDOWN_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Marks the process as shutting down; lock waits become bounded.
pub fn begin_shutdown() {
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
}

/// Leaves shutdown mode (used by embedders that restart a runtime, and tests).
pub fn end_shutdown() {
    SHUTTING_DOWN.store(false, Ordering::SeqCst);
}

pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

/// A process-unique, non-zero id for the calling thread.
pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// A mutex plus the id of the thread holding it (0 when unowned).
#[derive(Debug)]
pub struct StreamLock<T> {
    inner: Mutex<T>,
    owner: AtomicU64,
}

impl<T> StreamLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            owner: AtomicU64::new(0),
        }
    }

    /// Acquires the lock for the calling thread.
    pub fn enter(&self) -> Result<LockGuard<'_, T>> {
        match self.inner.try_lock() {
            Some(guard) => Ok(self.own(guard)),
            None => self.enter_slow(),
        }
    }

    #[cold]
    fn enter_slow(&self) -> Result<LockGuard<'_, T>> {
        let me = current_thread_id();
        if self.owner.load(Ordering::Acquire) == me {
            return Err(Error::ReentrantCall);
        }
        trace!(thread = me, "stream lock contended");
        let guard = if is_shutting_down() {
            match self.inner.try_lock_for(SHUTDOWN_LOCK_TIMEOUT) {
                Some(guard) => guard,
                None => {
                    warn!(
                        timeout = ?SHUTDOWN_LOCK_TIMEOUT,
                        "giving up on stream lock during shutdown"
                    );
                    return Err(Error::LockTimeout(SHUTDOWN_LOCK_TIMEOUT));
                }
            }
        } else {
            self.inner.lock()
        };
        Ok(self.own(guard))
    }

    fn own<'a>(&'a self, guard: MutexGuard<'a, T>) -> LockGuard<'a, T> {
        self.owner.store(current_thread_id(), Ordering::Release);
        LockGuard {
            guard,
            owner: &self.owner,
        }
    }

    /// Whether the calling thread currently holds this lock.
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_id()
    }

    /// Exclusive access without locking; the borrow checker proves no other user.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Scoped ownership of a [`StreamLock`].
pub struct LockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: &'a AtomicU64,
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before the mutex guard field is dropped.
        self.owner.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_enter_and_leave() {
        let lock = StreamLock::new(5u32);
        {
            let mut guard = lock.enter().unwrap();
            *guard += 1;
            assert!(lock.is_owned_by_current_thread());
        }
        assert!(!lock.is_owned_by_current_thread());
        assert_eq!(*lock.enter().unwrap(), 6);
    }

    #[test]
    fn test_reentrant_enter_is_rejected() {
        let lock = StreamLock::new(());
        let _guard = lock.enter().unwrap();
        match lock.enter() {
            Err(Error::ReentrantCall) => {}
            Err(e) => panic!("Expected ReentrantCall, got: {:?}", e),
            Ok(_) => panic!("Expected ReentrantCall, got a guard"),
        };
    }

    #[test]
    fn test_guard_released_on_error_path() {
        fn failing(lock: &StreamLock<u8>) -> Result<()> {
            let _guard = lock.enter()?;
            Err(Error::WouldBlock)
        }
        let lock = StreamLock::new(0u8);
        assert!(failing(&lock).is_err());
        assert!(lock.enter().is_ok());
    }

    #[test]
    fn test_other_thread_blocks_until_release() {
        let lock = Arc::new(StreamLock::new(Vec::<u32>::new()));
        let barrier = Arc::new(Barrier::new(2));
        let guard = lock.enter().unwrap();

        let handle = {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                lock.enter().unwrap().push(2);
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        handle.join().unwrap();
        assert_eq!(*lock.enter().unwrap(), vec![2]);
    }

    #[test]
    fn test_thread_ids_are_distinct_and_nonzero() {
        let here = current_thread_id();
        let there = thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, 0);
        assert_ne!(there, 0);
        assert_ne!(here, there);
    }
}
