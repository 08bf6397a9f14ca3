//! The thread scheduler (spec.md §2.4/§4.3): ready queues, priority
//! donation, the optional MLFQS policy, and time-slice enforcement.
//!
//! Every thread, lock, and semaphore lives in an arena owned by this
//! `Scheduler` singleton and is referred to everywhere else by a small
//! integer id — the same "arena + index" shape the VM subsystem uses for
//! swap slots, chosen for the same reason: the reference implementation's
//! intrusive pointer-linked lists (`struct thread *`, `struct lock *`)
//! don't have a sound Rust translation without unsafe aliasing, and an
//! index into a single owner sidesteps that entirely.
//!
//! Real suspension of a thread of control is a context switch, which
//! spec.md §1 places outside this crate's scope ("the core requires only
//! the abstract operation 'suspend current execution context, resume
//! another'"). So rather than pretending a blocking call here can suspend
//! the calling Rust stack frame until woken, `down`/`acquire`-style methods
//! report `WouldBlock`, and the caller is expected to invoke `block_current`
//! and then hand control to the `ContextSwitch` collaborator (`context`).

pub mod context;
pub mod mlfqs;
pub mod thread;

pub use thread::{
    ProcessLink, Status, Thread, NICE_MAX, NICE_MIN, PRI_DEFAULT, PRI_MAX, PRI_MIN, THREAD_MAGIC,
};

use crate::fixed_point::Fixed;
use crate::ids::{Tid, TidAllocator};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;

/// Ticks between forced yields under priority scheduling (spec.md §4.3).
pub const TIME_SLICE: u32 = 4;
/// Ticks per second, used to pace the MLFQS's once-a-second recomputation.
pub const TIMER_FREQ: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(pub u64);

pub(crate) struct SemState {
    pub value: usize,
    pub waiters: Vec<Tid>,
}

pub(crate) struct LockState {
    pub sem: SemId,
    pub holder: Option<Tid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    WouldBlock,
}

enum ReadyQueue {
    /// Kept sorted by effective priority ascending (so the highest-priority
    /// runnable thread is always the last element, cheap to pop); threads of
    /// equal priority keep their relative insertion order (FIFO tie-break,
    /// spec.md §5).
    Priority(Vec<Tid>),
    /// One FIFO queue per priority level 0..=63.
    Mlfqs(Box<[VecDeque<Tid>; 64]>),
}

pub struct Scheduler {
    threads: BTreeMap<Tid, Thread>,
    tids: TidAllocator,
    ready: ReadyQueue,
    mlfqs_ready_count: usize,
    /// Ascending by wake deadline; ties keep insertion order (spec.md §5).
    sleeping: Vec<(u64, Tid)>,
    sems: BTreeMap<SemId, SemState>,
    next_sem: u64,
    locks: BTreeMap<LockId, LockState>,
    next_lock: u64,
    current: Tid,
    idle: Tid,
    ticks: u64,
    slice: u32,
    pub load_avg: Fixed,
    mlfqs: bool,
}

impl Scheduler {
    pub fn new(mlfqs: bool) -> Self {
        let mut tids = TidAllocator::new();
        let mut threads = BTreeMap::new();
        let idle = tids.alloc();
        let mut idle_thread = Thread::new(idle, "idle", PRI_MIN);
        idle_thread.status = Status::Running;
        threads.insert(idle, idle_thread);

        let ready = if mlfqs {
            ReadyQueue::Mlfqs(Box::new(core::array::from_fn(|_| VecDeque::new())))
        } else {
            ReadyQueue::Priority(Vec::new())
        };

        Scheduler {
            threads,
            tids,
            ready,
            mlfqs_ready_count: 0,
            sleeping: Vec::new(),
            sems: BTreeMap::new(),
            next_sem: 1,
            locks: BTreeMap::new(),
            next_lock: 1,
            current: idle,
            idle,
            ticks: 0,
            slice: 0,
            load_avg: Fixed::ZERO,
            mlfqs,
        }
    }

    pub fn is_mlfqs(&self) -> bool {
        self.mlfqs
    }

    pub fn current(&self) -> Tid {
        self.current
    }

    /// Test/harness hook: force which thread is "current" without going
    /// through a real scheduling decision, for scenarios (spec.md §6) that
    /// script a fixed sequence of threads taking actions.
    pub fn set_current_for_test(&mut self, tid: Tid) {
        self.current = tid;
    }

    pub fn idle_tid(&self) -> Tid {
        self.idle
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub fn effective_priority(&self, tid: Tid) -> u8 {
        self.threads.get(&tid).map(|t| t.effective_priority).unwrap_or(PRI_MIN)
    }

    /// Create a new thread in the READY state and enqueue it. Does not
    /// itself decide whether to preempt — callers that want that call
    /// `maybe_yield` afterward.
    pub fn spawn(&mut self, name: &str, priority: u8) -> Tid {
        let tid = self.tids.alloc();
        let priority = if self.mlfqs { PRI_DEFAULT } else { priority };
        self.threads.insert(tid, Thread::new(tid, name, priority));
        self.enqueue_ready(tid);
        tid
    }

    fn enqueue_ready(&mut self, tid: Tid) {
        if tid == self.idle {
            return;
        }
        if let Some(t) = self.threads.get_mut(&tid) {
            t.status = Status::Ready;
        }
        let priority = self.effective_priority(tid);
        match &mut self.ready {
            ReadyQueue::Priority(list) => {
                // Ascending by priority so `pick_next` can cheaply pop the
                // back. Within a priority tier, a new arrival goes in front
                // of (i.e. not yet behind) the existing ones, so the
                // longest-waiting thread of that tier is always the one
                // closest to the back and therefore popped first (FIFO
                // tie-break, spec.md §5).
                let pos = list
                    .iter()
                    .position(|&t| self.threads[&t].effective_priority >= priority)
                    .unwrap_or(list.len());
                list.insert(pos, tid);
            }
            ReadyQueue::Mlfqs(queues) => {
                queues[priority as usize].push_back(tid);
                self.mlfqs_ready_count += 1;
            }
        }
    }

    fn remove_from_ready(&mut self, tid: Tid) {
        match &mut self.ready {
            ReadyQueue::Priority(list) => list.retain(|&t| t != tid),
            ReadyQueue::Mlfqs(queues) => {
                for q in queues.iter_mut() {
                    let before = q.len();
                    q.retain(|&t| t != tid);
                    if q.len() != before {
                        self.mlfqs_ready_count -= 1;
                    }
                }
            }
        }
    }

    /// Reposition `tid` in the priority-ordered ready list after its
    /// effective priority changed while it was sitting there (spec.md §4.2
    /// "Donation correctness"). No-op under MLFQS, whose queue membership is
    /// instead adjusted explicitly by `reposition_in_mlfqs`.
    fn reposition_ready(&mut self, tid: Tid) {
        if let ReadyQueue::Priority(list) = &self.ready {
            if list.contains(&tid) {
                self.remove_from_ready(tid);
                self.enqueue_ready(tid);
            }
        }
    }

    fn pick_next(&mut self) -> Tid {
        let tid = match &mut self.ready {
            ReadyQueue::Priority(list) => list.pop().unwrap_or(self.idle),
            ReadyQueue::Mlfqs(queues) => {
                let mut picked = None;
                for p in (0..64).rev() {
                    if let Some(tid) = queues[p].pop_front() {
                        self.mlfqs_ready_count -= 1;
                        picked = Some(tid);
                        break;
                    }
                }
                picked.unwrap_or(self.idle)
            }
        };
        if let Some(t) = self.threads.get(&tid) {
            debug_assert_eq!(
                t.magic, THREAD_MAGIC,
                "thread {:?} corruption canary overwritten", tid
            );
        }
        tid
    }

    /// Voluntarily give up the CPU. The current thread goes back on the
    /// ready queue (unless it's the idle thread, or it's no longer
    /// runnable) and the highest-priority ready thread becomes current.
    pub fn yield_now(&mut self) -> (Tid, Tid) {
        let prev = self.current;
        if prev != self.idle {
            if let Some(t) = self.threads.get(&prev) {
                if t.status == Status::Running {
                    self.enqueue_ready(prev);
                }
            }
        }
        let next = self.pick_next();
        if let Some(t) = self.threads.get_mut(&next) {
            t.status = Status::Running;
        }
        self.current = next;
        (prev, next)
    }

    /// Yield only if a ready thread now outranks the current one — the
    /// non-mandatory half of spec.md §4.2's preemption rule ("if a
    /// now-ready thread outranks the releaser, yield").
    pub fn maybe_yield(&mut self) -> bool {
        let top = match &self.ready {
            ReadyQueue::Priority(list) => list.last().map(|&t| self.threads[&t].effective_priority),
            ReadyQueue::Mlfqs(queues) => (0..64).rev().find_map(|p| (!queues[p].is_empty()).then_some(p as u8)),
        };
        let current_priority = self.effective_priority(self.current);
        if let Some(top) = top {
            if top > current_priority {
                self.yield_now();
                return true;
            }
        }
        false
    }

    /// Mark the current thread BLOCKED and switch to the next ready
    /// thread. Returns the tid that was blocked.
    pub fn block_current(&mut self) -> Tid {
        let blocked = self.current;
        if let Some(t) = self.threads.get_mut(&blocked) {
            t.status = Status::Blocked;
        }
        let next = self.pick_next();
        if let Some(t) = self.threads.get_mut(&next) {
            t.status = Status::Running;
        }
        self.current = next;
        blocked
    }

    pub fn unblock(&mut self, tid: Tid) {
        match self.threads.get(&tid) {
            Some(t) if t.status == Status::Blocked => {}
            _ => return,
        }
        self.enqueue_ready(tid);
    }

    // ---- Raw semaphores, underlying both standalone use and locks/condvars ----

    pub fn new_semaphore(&mut self, initial: usize) -> SemId {
        let id = SemId(self.next_sem);
        self.next_sem += 1;
        self.sems.insert(
            id,
            SemState {
                value: initial,
                waiters: Vec::new(),
            },
        );
        id
    }

    pub fn sema_try_down(&mut self, sem_id: SemId) -> Acquire {
        let me = self.current;
        let sem = self.sems.get_mut(&sem_id).expect("unknown semaphore");
        if sem.value > 0 {
            sem.value -= 1;
            Acquire::Acquired
        } else {
            // Appended in chronological order; `sema_up` re-derives the
            // priority ordering (with a stable sort, so ties stay FIFO)
            // every time it wakes someone, since donation may have changed
            // priorities after this thread queued up.
            sem.waiters.push(me);
            self.threads.get_mut(&me).unwrap().waiting_on_semaphore = Some(sem_id);
            Acquire::WouldBlock
        }
    }

    pub fn sema_up(&mut self, sem_id: SemId) {
        let sem = self.sems.get_mut(&sem_id).expect("unknown semaphore");
        if !sem.waiters.is_empty() {
            // Re-sort: donation may have changed priorities since insertion.
            // The sort is stable, so the first occurrence of the maximum
            // priority is the longest-waiting thread at that priority
            // (spec.md §5 "ties broken FIFO").
            sem.waiters.sort_by_key(|&t| self.threads[&t].effective_priority);
            let max_priority = self.threads[sem.waiters.last().unwrap()].effective_priority;
            let idx = sem
                .waiters
                .iter()
                .position(|&t| self.threads[&t].effective_priority == max_priority)
                .unwrap();
            let woken = sem.waiters.remove(idx);
            self.threads.get_mut(&woken).unwrap().waiting_on_semaphore = None;
            self.unblock(woken);
        }
        self.sems.get_mut(&sem_id).unwrap().value += 1;
        self.maybe_yield();
    }

    pub fn semaphore_value(&self, sem_id: SemId) -> usize {
        self.sems[&sem_id].value
    }

    // ---- Locks with priority donation ----

    pub fn new_lock(&mut self) -> LockId {
        let sem = self.new_semaphore(1);
        let id = LockId(self.next_lock);
        self.next_lock += 1;
        self.locks.insert(id, LockState { sem, holder: None });
        id
    }

    pub fn lock_holder(&self, lock_id: LockId) -> Option<Tid> {
        self.locks[&lock_id].holder
    }

    /// Recursive donation up the `waiting_on_lock -> holder` chain
    /// (spec.md §7 "Cyclic graphs"): depth-bounded, terminates because a
    /// lock has one holder and a thread is blocked on at most one lock.
    const DONATION_DEPTH_LIMIT: u32 = 8;

    fn donate_chain(&mut self, target_priority: u8, starting_lock: LockId) {
        let mut current_lock = Some(starting_lock);
        let mut depth = 0;
        while let Some(lock_id) = current_lock {
            if depth >= Self::DONATION_DEPTH_LIMIT {
                break;
            }
            depth += 1;
            let Some(holder) = self.locks.get(&lock_id).and_then(|l| l.holder) else {
                break;
            };
            let holder_thread = self.threads.get_mut(&holder).expect("holder must exist");
            if holder_thread.effective_priority >= target_priority {
                break;
            }
            holder_thread.effective_priority = target_priority;
            self.reposition_ready(holder);
            current_lock = holder_thread.waiting_on_lock;
        }
    }

    /// `max(base, max over held locks of max over that lock's waiters of
    /// their effective_priority)` (spec.md §4.2 "Donation correctness").
    fn recompute_effective_priority(&mut self, tid: Tid) {
        let base = self.threads[&tid].base_priority;
        let held: Vec<LockId> = self.threads[&tid].held_locks.clone();
        let mut eff = base;
        for lock_id in held {
            let sem_id = self.locks[&lock_id].sem;
            for &waiter in &self.sems[&sem_id].waiters {
                eff = eff.max(self.threads[&waiter].effective_priority);
            }
        }
        self.threads.get_mut(&tid).unwrap().effective_priority = eff;
        self.reposition_ready(tid);
    }

    /// Acquire `lock_id`, donating priority up the holder chain if it's
    /// currently held, then attempting the underlying semaphore.
    pub fn lock_acquire(&mut self, lock_id: LockId) -> Acquire {
        let me = self.current;
        let sem_id = self.locks[&lock_id].sem;
        if self.locks[&lock_id].holder.is_some() && !self.mlfqs {
            self.threads.get_mut(&me).unwrap().waiting_on_lock = Some(lock_id);
            let my_priority = self.effective_priority(me);
            self.donate_chain(my_priority, lock_id);
        }
        let outcome = self.sema_try_down(sem_id);
        if outcome == Acquire::Acquired {
            self.finish_lock_acquire(lock_id, me);
        }
        outcome
    }

    /// Called once a blocked `lock_acquire` has been woken (its semaphore
    /// wait resolved) and is current again.
    pub fn finish_lock_acquire(&mut self, lock_id: LockId, me: Tid) {
        self.threads.get_mut(&me).unwrap().waiting_on_lock = None;
        self.threads.get_mut(&me).unwrap().held_locks.push(lock_id);
        self.locks.get_mut(&lock_id).unwrap().holder = Some(me);
    }

    pub fn lock_release(&mut self, lock_id: LockId) {
        let me = self.current;
        self.threads
            .get_mut(&me)
            .unwrap()
            .held_locks
            .retain(|&l| l != lock_id);
        self.locks.get_mut(&lock_id).unwrap().holder = None;
        self.recompute_effective_priority(me);
        let sem_id = self.locks[&lock_id].sem;
        self.sema_up(sem_id);
    }

    /// No-op under MLFQS (spec.md §4.3: "In MLFQS, set_priority is a no-op
    /// and donation is disabled").
    pub fn set_priority(&mut self, tid: Tid, priority: u8) {
        if self.mlfqs {
            return;
        }
        if let Some(t) = self.threads.get_mut(&tid) {
            t.base_priority = priority;
        }
        self.recompute_effective_priority(tid);
        self.maybe_yield();
    }

    // ---- Sleep queue ----

    pub fn sleep_until(&mut self, deadline: u64) {
        let me = self.current;
        self.threads.get_mut(&me).unwrap().wake_deadline = Some(deadline);
        let pos = self
            .sleeping
            .iter()
            .position(|&(d, _)| d > deadline)
            .unwrap_or(self.sleeping.len());
        self.sleeping.insert(pos, (deadline, me));
        self.block_current();
    }

    /// Advance the tick counter, wake due sleepers, run the MLFQS
    /// recomputation pass, and enforce the time slice (spec.md §2.2
    /// "Timer"). Returns true if a yield was requested on interrupt return.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        while let Some(&(deadline, tid)) = self.sleeping.first() {
            if deadline > self.ticks {
                break;
            }
            self.sleeping.remove(0);
            if let Some(t) = self.threads.get_mut(&tid) {
                t.wake_deadline = None;
            }
            self.unblock(tid);
        }

        if self.mlfqs {
            mlfqs::on_tick(self);
        }

        self.slice += 1;
        if self.slice >= TIME_SLICE {
            self.slice = 0;
            return true;
        }
        false
    }

    pub fn ready_thread_count(&self) -> usize {
        let running = if self.current != self.idle { 1 } else { 0 };
        match &self.ready {
            ReadyQueue::Priority(list) => list.len() + running,
            ReadyQueue::Mlfqs(_) => self.mlfqs_ready_count + running,
        }
    }

    pub(crate) fn threads_iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub(crate) fn threads_iter_mut(&mut self) -> impl Iterator<Item = &mut Thread> {
        self.threads.values_mut()
    }

    pub(crate) fn is_idle(&self, tid: Tid) -> bool {
        tid == self.idle
    }

    pub(crate) fn reposition_in_mlfqs(&mut self, tid: Tid, old_priority: u8, new_priority: u8) {
        if old_priority == new_priority || self.is_idle(tid) {
            return;
        }
        if let ReadyQueue::Mlfqs(queues) = &mut self.ready {
            if let Some(pos) = queues[old_priority as usize].iter().position(|&t| t == tid) {
                queues[old_priority as usize].remove(pos);
                queues[new_priority as usize].push_back(tid);
            }
        }
    }

    pub fn destroy_thread(&mut self, tid: Tid) {
        self.remove_from_ready(tid);
        self.threads.remove(&tid);
    }

    pub fn set_process_name(&mut self, tid: Tid, name: String) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.name = name;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_thread_carries_the_corruption_canary() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", PRI_DEFAULT);
        assert_eq!(s.thread(s.idle_tid()).unwrap().magic, THREAD_MAGIC);
        assert_eq!(s.thread(a).unwrap().magic, THREAD_MAGIC);
        // pick_next (driven here via yield_now) is a scheduling decision
        // and asserts the canary of whichever thread it selects.
        let (_, next) = s.yield_now();
        assert_eq!(s.thread(next).unwrap().magic, THREAD_MAGIC);
    }

    #[test]
    fn higher_priority_thread_runs_first() {
        let mut s = Scheduler::new(false);
        let low = s.spawn("low", 10);
        let high = s.spawn("high", 20);
        let (_, next) = s.yield_now();
        assert_eq!(next, high);
        let _ = low;
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", 10);
        let b = s.spawn("b", 10);
        let (_, next) = s.yield_now();
        assert_eq!(next, a);
        let _ = b;
    }

    #[test]
    fn nested_priority_donation_scenario() {
        // spec.md §6 scenario 2.
        let mut s = Scheduler::new(false);
        let l = s.spawn("L", 31);
        let m = s.spawn("M", 32);
        let h = s.spawn("H", 40);

        let lock_x = s.new_lock();
        let lock_y = s.new_lock();

        // L acquires X uncontended.
        s.set_current_for_test(l);
        assert_eq!(s.lock_acquire(lock_x), Acquire::Acquired);

        // M acquires Y uncontended, then tries X (blocks, donates to L).
        s.set_current_for_test(m);
        assert_eq!(s.lock_acquire(lock_y), Acquire::Acquired);
        assert_eq!(s.lock_acquire(lock_x), Acquire::WouldBlock);
        assert_eq!(s.effective_priority(l), 32);

        // H tries Y (blocks, donates to M, which transitively raises L too).
        s.set_current_for_test(h);
        assert_eq!(s.lock_acquire(lock_y), Acquire::WouldBlock);
        assert_eq!(s.effective_priority(m), 40);
        assert_eq!(s.effective_priority(l), 40);

        // L releases X: its effective priority falls back to base; M is
        // granted X (was the sole waiter).
        s.set_current_for_test(l);
        s.lock_release(lock_x);
        assert_eq!(s.effective_priority(l), 31);
        assert_eq!(s.thread(m).unwrap().waiting_on_semaphore, None);

        s.set_current_for_test(m);
        s.finish_lock_acquire(lock_x, m);
        assert_eq!(s.lock_holder(lock_x), Some(m));

        // M releases Y: H is granted it.
        s.lock_release(lock_y);
        s.set_current_for_test(h);
        s.finish_lock_acquire(lock_y, h);
        assert_eq!(s.lock_holder(lock_y), Some(h));
    }

    #[test]
    fn semaphore_wakes_highest_priority_waiter_first() {
        let mut s = Scheduler::new(false);
        let sem = s.new_semaphore(0);
        let low = s.spawn("low", 10);
        let high = s.spawn("high", 20);

        s.set_current_for_test(low);
        assert_eq!(s.sema_try_down(sem), Acquire::WouldBlock);
        s.set_current_for_test(high);
        assert_eq!(s.sema_try_down(sem), Acquire::WouldBlock);

        s.sema_up(sem);
        assert_eq!(s.thread(high).unwrap().status, Status::Ready);
        assert_eq!(s.thread(low).unwrap().status, Status::Blocked);
    }

    #[test]
    fn sleep_queue_wakes_in_deadline_order() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", PRI_DEFAULT);
        let b = s.spawn("b", PRI_DEFAULT);
        s.set_current_for_test(a);
        s.sleep_until(10);
        s.set_current_for_test(b);
        s.sleep_until(5);

        for _ in 0..4 {
            s.tick();
        }
        assert_eq!(s.thread(b).unwrap().status, Status::Blocked);
        assert_eq!(s.thread(a).unwrap().status, Status::Blocked);
        s.tick();
        assert_eq!(s.thread(b).unwrap().status, Status::Ready);
        assert_eq!(s.thread(a).unwrap().status, Status::Blocked);
        for _ in 0..5 {
            s.tick();
        }
        assert_eq!(s.thread(a).unwrap().status, Status::Ready);
    }
}
