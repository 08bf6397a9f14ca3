//! Condition variables, built on a list of private per-waiter semaphores
//! (the standard Pintos `cond_wait` construction: each waiter parks on its
//! own one-shot semaphore rather than sharing a counter, so `signal` wakes
//! exactly one and `broadcast` wakes all without a thundering herd on a
//! shared counter).

use crate::scheduler::{LockId, Scheduler, SemId};
use alloc::collections::VecDeque;

#[derive(Default)]
pub struct Condvar {
    waiters: VecDeque<SemId>,
}

impl Condvar {
    pub fn new() -> Self {
        Condvar { waiters: VecDeque::new() }
    }

    /// Caller must already hold `lock`. Registers a fresh private
    /// semaphore, releases `lock`, and returns the semaphore id — the
    /// caller then follows the same `WouldBlock` protocol as
    /// `Lock::acquire` (a brand-new semaphore always starts at 0, so this
    /// always blocks) and, once woken, re-acquires `lock` before
    /// proceeding.
    pub fn wait(&mut self, s: &mut Scheduler, lock: LockId) -> SemId {
        let sem = s.new_semaphore(0);
        self.waiters.push_back(sem);
        s.lock_release(lock);
        let _ = s.sema_try_down(sem);
        sem
    }

    /// Wakes the longest-waiting waiter, if any.
    pub fn signal(&mut self, s: &mut Scheduler) {
        if let Some(sem) = self.waiters.pop_front() {
            s.sema_up(sem);
        }
    }

    pub fn broadcast(&mut self, s: &mut Scheduler) {
        while !self.waiters.is_empty() {
            self.signal(s);
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}
