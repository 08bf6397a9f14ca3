//! Semaphores (spec.md §4.2): a thin handle onto a `Scheduler`-owned
//! `SemId`. The counter and waiter list themselves live in the scheduler's
//! arena; this type exists so call sites read like Pintos' `struct
//! semaphore` rather than bare integers.

use crate::scheduler::{Acquire, Scheduler, SemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore(SemId);

impl Semaphore {
    pub fn new(s: &mut Scheduler, value: usize) -> Self {
        Semaphore(s.new_semaphore(value))
    }

    pub fn id(&self) -> SemId {
        self.0
    }

    /// `sema_down`. `WouldBlock` means the caller must `block_current` and
    /// hand off to the `ContextSwitch` collaborator; this call never
    /// suspends the Rust stack frame itself (spec.md §1).
    pub fn down(&self, s: &mut Scheduler) -> Acquire {
        s.sema_try_down(self.0)
    }

    /// `sema_up`: wakes the highest-priority waiter (FIFO among ties) and
    /// yields if it now outranks the caller.
    pub fn up(&self, s: &mut Scheduler) {
        s.sema_up(self.0)
    }

    pub fn value(&self, s: &Scheduler) -> usize {
        s.semaphore_value(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::thread::PRI_DEFAULT;

    #[test]
    fn down_blocks_at_zero_up_releases_one_waiter() {
        let mut s = Scheduler::new(false);
        let sem = Semaphore::new(&mut s, 0);
        let a = s.spawn("a", PRI_DEFAULT);
        s.set_current_for_test(a);
        assert_eq!(sem.down(&mut s), Acquire::WouldBlock);
        assert_eq!(sem.value(&s), 0);
        sem.up(&mut s);
        assert_eq!(sem.value(&s), 1);
    }

    #[test]
    fn down_succeeds_immediately_when_counter_positive() {
        let mut s = Scheduler::new(false);
        let sem = Semaphore::new(&mut s, 1);
        assert_eq!(sem.down(&mut s), Acquire::Acquired);
        assert_eq!(sem.value(&s), 0);
    }
}
