//! Reader/writer lock that admits requests strictly in arrival order.
//!
//! Admission is decided by a small gate: a state integer (`0` free, `n > 0`
//! readers, `-1` writer) and a FIFO of parked requests, each with its own
//! condition variable. A request is granted immediately only when nobody is
//! queued and the state is compatible; otherwise it parks. Release hands the
//! lock to the head of the queue and keeps granting while the following
//! heads stay compatible, so a reader that arrives behind a queued writer
//! waits for that writer.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{Result, TesseraError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

struct Waiter {
    mode: Mode,
    granted: AtomicBool,
    cv: Condvar,
}

#[derive(Default)]
struct GateState {
    /// 0 free, >0 reader count, -1 writer.
    holders: i64,
    queue: VecDeque<Arc<Waiter>>,
}

impl GateState {
    fn compatible(&self, mode: Mode) -> bool {
        match mode {
            Mode::Read => self.holders >= 0,
            Mode::Write => self.holders == 0,
        }
    }

    fn take(&mut self, mode: Mode) {
        match mode {
            Mode::Read => self.holders += 1,
            Mode::Write => self.holders = -1,
        }
    }

    fn grant_heads(&mut self) {
        while let Some(mode) = self.queue.front().map(|head| head.mode) {
            if !self.compatible(mode) {
                break;
            }
            self.take(mode);
            if let Some(head) = self.queue.pop_front() {
                head.granted.store(true, Ordering::Release);
                head.cv.notify_one();
            }
        }
    }
}

#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
}

impl Gate {
    fn try_acquire(&self, mode: Mode) -> bool {
        let mut st = self.state.lock();
        if st.queue.is_empty() && st.compatible(mode) {
            st.take(mode);
            true
        } else {
            false
        }
    }

    fn acquire(&self, mode: Mode, deadline: Option<Instant>) -> bool {
        let mut st = self.state.lock();
        if st.queue.is_empty() && st.compatible(mode) {
            st.take(mode);
            return true;
        }
        let waiter = Arc::new(Waiter {
            mode,
            granted: AtomicBool::new(false),
            cv: Condvar::new(),
        });
        st.queue.push_back(Arc::clone(&waiter));
        loop {
            if waiter.granted.load(Ordering::Acquire) {
                return true;
            }
            match deadline {
                None => waiter.cv.wait(&mut st),
                Some(deadline) => {
                    let timed_out = waiter.cv.wait_until(&mut st, deadline).timed_out();
                    if timed_out && !waiter.granted.load(Ordering::Acquire) {
                        st.queue.retain(|w| !Arc::ptr_eq(w, &waiter));
                        // Leaving may expose compatible requests queued behind us.
                        st.grant_heads();
                        return false;
                    }
                }
            }
        }
    }

    fn release(&self, mode: Mode) {
        let mut st = self.state.lock();
        match mode {
            Mode::Read => {
                debug_assert!(st.holders > 0, "read release without holder");
                st.holders -= 1;
            }
            Mode::Write => {
                debug_assert_eq!(st.holders, -1, "write release without holder");
                st.holders = 0;
            }
        }
        st.grant_heads();
    }
}

/// Fair reader/writer lock protecting a value.
pub struct FairRwLock<T> {
    gate: Gate,
    data: RwLock<T>,
}

/// Shared access to the value of a [`FairRwLock`].
pub struct FairReadGuard<'a, T> {
    data: RwLockReadGuard<'a, T>,
    gate: &'a Gate,
}

/// Exclusive access to the value of a [`FairRwLock`].
pub struct FairWriteGuard<'a, T> {
    data: RwLockWriteGuard<'a, T>,
    gate: &'a Gate,
}

impl<T> FairRwLock<T> {
    /// Wraps `value`.
    pub fn new(value: T) -> Self {
        Self {
            gate: Gate::default(),
            data: RwLock::new(value),
        }
    }

    /// Blocks until shared access is granted.
    pub fn read(&self) -> FairReadGuard<'_, T> {
        self.gate.acquire(Mode::Read, None);
        self.read_granted()
    }

    /// Blocks until exclusive access is granted.
    pub fn write(&self) -> FairWriteGuard<'_, T> {
        self.gate.acquire(Mode::Write, None);
        self.write_granted()
    }

    /// Shared access if it can be granted without queueing.
    pub fn try_read(&self) -> Option<FairReadGuard<'_, T>> {
        self.gate
            .try_acquire(Mode::Read)
            .then(|| self.read_granted())
    }

    /// Exclusive access if it can be granted without queueing.
    pub fn try_write(&self) -> Option<FairWriteGuard<'_, T>> {
        self.gate
            .try_acquire(Mode::Write)
            .then(|| self.write_granted())
    }

    /// Shared access, failing with `LockTimeout` after `timeout`.
    pub fn read_for(&self, timeout: Duration) -> Result<FairReadGuard<'_, T>> {
        if self.gate.acquire(Mode::Read, Some(Instant::now() + timeout)) {
            Ok(self.read_granted())
        } else {
            Err(TesseraError::LockTimeout(timeout))
        }
    }

    /// Exclusive access, failing with `LockTimeout` after `timeout`.
    pub fn write_for(&self, timeout: Duration) -> Result<FairWriteGuard<'_, T>> {
        if self.gate.acquire(Mode::Write, Some(Instant::now() + timeout)) {
            Ok(self.write_granted())
        } else {
            Err(TesseraError::LockTimeout(timeout))
        }
    }

    /// Number of parked requests.
    pub fn queued(&self) -> usize {
        self.gate.state.lock().queue.len()
    }

    /// Mutable access without locking; requires exclusive ownership.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    // The gate admitted us, so the inner lock is at most held by a guard
    // that is finishing its own drop.
    fn read_granted(&self) -> FairReadGuard<'_, T> {
        FairReadGuard {
            data: self.data.read(),
            gate: &self.gate,
        }
    }

    fn write_granted(&self) -> FairWriteGuard<'_, T> {
        FairWriteGuard {
            data: self.data.write(),
            gate: &self.gate,
        }
    }
}

impl<T: Default> Default for FairRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Deref for FairReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> Drop for FairReadGuard<'_, T> {
    fn drop(&mut self) {
        self.gate.release(Mode::Read);
    }
}

impl<T> Deref for FairWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for FairWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T> Drop for FairWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.gate.release(Mode::Write);
    }
}
