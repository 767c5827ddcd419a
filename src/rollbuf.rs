//! Bounded shift-FIFO shared by every pipeline stage.
//!
//! The producer never blocks: when the buffer is full, `append` shifts the
//! oldest elements out to make room and reports how many were lost. The
//! consumer blocks on a condition variable until a minimum fill is reached
//! or a cancel/reset flag is raised.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Fixed-capacity contiguous FIFO with in-place shifting.
///
/// Elements in `[0, len)` are valid, oldest first. Never reallocates after
/// construction.
pub struct RollBuffer<T> {
    buf: Vec<T>,
    capacity: usize,
}

impl<T: Clone> RollBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "roll buffer capacity must be at least 1");
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn get(&self) -> &[T] {
        &self.buf
    }

    /// Append as many tail elements of `xs` as fit, shifting the existing
    /// prefix out to make room. Returns the number of elements lost (shifted
    /// out plus any head of `xs` that never fit).
    pub fn append(&mut self, xs: &[T]) -> usize {
        if xs.len() >= self.capacity {
            let lost = self.buf.len() + xs.len() - self.capacity;
            self.buf.clear();
            self.buf.extend_from_slice(&xs[xs.len() - self.capacity..]);
            return lost;
        }
        let overflow = (self.buf.len() + xs.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.shift(overflow);
        }
        self.buf.extend_from_slice(xs);
        overflow
    }

    /// Single-element specialisation of [`append`](Self::append).
    pub fn append_one(&mut self, x: T) -> usize {
        if self.buf.len() == self.capacity {
            self.shift(1);
            self.buf.push(x);
            1
        } else {
            self.buf.push(x);
            0
        }
    }

    /// Drop the first `n` elements, moving the rest to the front. A no-op for
    /// `n == 0`, a reset for `n >= len`.
    pub fn shift(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if n >= self.buf.len() {
            self.buf.clear();
        } else {
            self.buf.drain(..n);
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Cancel/reset flags observed by both sides of a [`SyncRollBuffer`].
///
/// `cancel` is monotonic once set; `reset` is one-shot and cleared by the
/// consumer through [`RollGuard::release_and_signal`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub cancel: bool,
    pub reset: bool,
}

impl Status {
    pub fn flagged(&self) -> bool {
        self.cancel || self.reset
    }
}

struct Shared<T> {
    buf: RollBuffer<T>,
    status: Status,
}

/// Mutex/condvar wrapper giving a [`RollBuffer`] wait-for-N semantics.
pub struct SyncRollBuffer<T> {
    shared: Mutex<Shared<T>>,
    cond: Condvar,
    broadcast: bool,
}

impl<T: Clone> SyncRollBuffer<T> {
    pub fn new(capacity: usize, broadcast: bool) -> Self {
        Self {
            shared: Mutex::new(Shared {
                buf: RollBuffer::new(capacity),
                status: Status::default(),
            }),
            cond: Condvar::new(),
            broadcast,
        }
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared<T>> {
        // A poisoned mutex means a stage panicked; the data is plain samples
        // and remains usable for the teardown path.
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Producer-side append: shift-append under the lock, then signal and
    /// yield. Returns the number of elements lost to over-run.
    pub fn append(&self, xs: &[T]) -> usize {
        let lost = {
            let mut shared = self.lock_shared();
            shared.buf.append(xs)
        };
        if lost > 0 {
            log::warn!("rollbuffer overrun, {} elements dropped", lost);
        }
        self.notify();
        std::thread::yield_now();
        lost
    }

    pub fn append_one(&self, x: T) -> usize {
        let lost = {
            let mut shared = self.lock_shared();
            shared.buf.append_one(x)
        };
        if lost > 0 {
            log::warn!("rollbuffer overrun, 1 element dropped");
        }
        self.notify();
        std::thread::yield_now();
        lost
    }

    /// Wake whoever is blocked in [`wait_at_least`](Self::wait_at_least).
    pub fn notify(&self) {
        if self.broadcast {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    /// Acquire the lock without waiting for a fill level.
    pub fn lock(&self) -> RollGuard<'_, T> {
        RollGuard {
            shared: self.lock_shared(),
            owner: self,
        }
    }

    /// Block until at least `n` elements are buffered or a status flag is
    /// raised, whichever comes first.
    pub fn wait_at_least(&self, n: usize) -> RollGuard<'_, T> {
        let mut shared = self.lock_shared();
        while shared.buf.len() < n && !shared.status.flagged() {
            shared = self
                .cond
                .wait(shared)
                .unwrap_or_else(|e| e.into_inner());
        }
        RollGuard {
            shared,
            owner: self,
        }
    }

    /// [`wait_at_least`](Self::wait_at_least) with an upper bound on the wait.
    /// The returned guard may hold fewer than `n` elements after a timeout.
    pub fn wait_at_least_timeout(&self, n: usize, timeout: Duration) -> RollGuard<'_, T> {
        let mut shared = self.lock_shared();
        while shared.buf.len() < n && !shared.status.flagged() {
            let (guard, res) = self
                .cond
                .wait_timeout(shared, timeout)
                .unwrap_or_else(|e| e.into_inner());
            shared = guard;
            if res.timed_out() {
                break;
            }
        }
        RollGuard {
            shared,
            owner: self,
        }
    }

    pub fn wait_any(&self) -> RollGuard<'_, T> {
        self.wait_at_least(1)
    }

    /// Raise the reset flag and discard buffered data. Waiters wake and
    /// observe the flag. Idempotent.
    pub fn reset(&self) {
        {
            let mut shared = self.lock_shared();
            shared.status.reset = true;
            shared.buf.reset();
        }
        self.notify();
    }

    /// Raise the cancel flag. Buffered data stays readable but producers must
    /// stop. Monotonic until teardown.
    pub fn cancel(&self) {
        {
            let mut shared = self.lock_shared();
            shared.status.cancel = true;
        }
        self.notify();
    }

    pub fn status(&self) -> Status {
        self.lock_shared().status
    }

    pub fn len(&self) -> usize {
        self.lock_shared().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Critical-section handle over a [`SyncRollBuffer`].
///
/// Must not be held across blocking I/O. The two exits consume the guard:
/// [`release`](Self::release) just drops the mutex,
/// [`release_and_signal`](Self::release_and_signal) additionally clears the
/// reset flag (consumer acknowledgement) and signals.
pub struct RollGuard<'a, T> {
    shared: MutexGuard<'a, Shared<T>>,
    owner: &'a SyncRollBuffer<T>,
}

impl<'a, T: Clone> RollGuard<'a, T> {
    pub fn get(&self) -> &[T] {
        self.shared.buf.get()
    }

    pub fn len(&self) -> usize {
        self.shared.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.buf.is_empty()
    }

    pub fn append(&mut self, xs: &[T]) -> usize {
        self.shared.buf.append(xs)
    }

    pub fn append_one(&mut self, x: T) -> usize {
        self.shared.buf.append_one(x)
    }

    pub fn shift(&mut self, n: usize) {
        self.shared.buf.shift(n);
    }

    pub fn reset(&mut self) {
        self.shared.buf.reset();
    }

    pub fn status(&self) -> Status {
        self.shared.status
    }

    pub fn release(self) {
        drop(self.shared);
    }

    pub fn release_and_signal(mut self) {
        self.shared.status.reset = false;
        let owner = self.owner;
        drop(self.shared);
        owner.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn append_then_shift_keeps_order() {
        let mut rb = RollBuffer::new(8);
        rb.append(&[1, 2, 3]);
        rb.append(&[4, 5]);
        assert_eq!(rb.get(), &[1, 2, 3, 4, 5]);
        rb.shift(2);
        assert_eq!(rb.get(), &[3, 4, 5]);
        rb.shift(0);
        assert_eq!(rb.len(), 3);
        rb.shift(10);
        assert!(rb.is_empty());
    }

    #[test]
    fn append_shifts_prefix_when_full() {
        let mut rb = RollBuffer::new(4);
        assert_eq!(rb.append(&[1, 2, 3]), 0);
        assert_eq!(rb.append(&[4, 5]), 1);
        assert_eq!(rb.get(), &[2, 3, 4, 5]);
    }

    #[test]
    fn oversized_append_keeps_tail() {
        let mut rb = RollBuffer::new(3);
        rb.append(&[9]);
        let lost = rb.append(&[1, 2, 3, 4, 5]);
        assert_eq!(rb.get(), &[3, 4, 5]);
        assert_eq!(lost, 3);
    }

    #[test]
    fn append_one_rolls() {
        let mut rb = RollBuffer::new(2);
        rb.append_one(1);
        rb.append_one(2);
        assert_eq!(rb.append_one(3), 1);
        assert_eq!(rb.get(), &[2, 3]);
    }

    #[test]
    fn append_equals_truncated_concat() {
        // Property: after a sequence of appends, the content equals the
        // concatenation truncated to the last `capacity` elements.
        let mut rb = RollBuffer::new(5);
        let mut all: Vec<i32> = Vec::new();
        for xs in [vec![1, 2], vec![3], vec![4, 5, 6, 7], vec![8, 9]] {
            rb.append(&xs);
            all.extend_from_slice(&xs);
            let want_start = all.len().saturating_sub(5);
            assert_eq!(rb.get(), &all[want_start..]);
            assert!(rb.len() <= rb.capacity());
        }
    }

    #[test]
    fn wait_at_least_returns_on_fill() {
        let buf = Arc::new(SyncRollBuffer::<i32>::new(16, false));
        let producer = Arc::clone(&buf);
        let t = std::thread::spawn(move || {
            for i in 0..4 {
                producer.append(&[i, i]);
            }
        });
        let guard = buf.wait_at_least(8);
        assert!(guard.len() >= 8 || guard.status().flagged());
        guard.release();
        t.join().unwrap();
    }

    #[test]
    fn wait_at_least_returns_on_cancel() {
        let buf = Arc::new(SyncRollBuffer::<i32>::new(16, false));
        let side = Arc::clone(&buf);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            side.cancel();
        });
        let start = Instant::now();
        let guard = buf.wait_at_least(8);
        assert!(guard.status().cancel);
        assert!(guard.len() < 8);
        assert!(start.elapsed() < Duration::from_secs(1));
        guard.release();
        t.join().unwrap();
    }

    #[test]
    fn reset_discards_and_wakes() {
        let buf = SyncRollBuffer::<i32>::new(4, false);
        buf.append(&[1, 2, 3]);
        buf.reset();
        let guard = buf.wait_any();
        assert!(guard.status().reset);
        assert_eq!(guard.len(), 0);
        guard.release_and_signal();
        assert!(!buf.status().reset);
    }

    #[test]
    fn cancel_keeps_data() {
        let buf = SyncRollBuffer::<i32>::new(4, false);
        buf.append(&[1, 2]);
        buf.cancel();
        let guard = buf.wait_any();
        assert!(guard.status().cancel);
        assert_eq!(guard.get(), &[1, 2]);
        guard.release();
        // cancel is monotonic: an acknowledge does not clear it
        let guard = buf.wait_any();
        guard.release_and_signal();
        assert!(buf.status().cancel);
    }

    #[test]
    fn wait_timeout_expires() {
        let buf = SyncRollBuffer::<i32>::new(4, false);
        let start = Instant::now();
        let guard = buf.wait_at_least_timeout(1, Duration::from_millis(30));
        assert_eq!(guard.len(), 0);
        assert!(start.elapsed() >= Duration::from_millis(25));
        guard.release();
    }
}
