//! The multi-level feedback queue scheduler policy (spec.md §4.3), active
//! only when `Scheduler::is_mlfqs()`. Pure bookkeeping: priorities and
//! `recent_cpu`/`load_avg` are recomputed from fixed formulas on a tick
//! schedule, with no donation and no `set_priority` effect (enforced by
//! `Scheduler::lock_acquire`/`set_priority` themselves, not here).

use super::thread::{NICE_MAX, NICE_MIN, PRI_MAX, PRI_MIN};
use super::Scheduler;
use crate::fixed_point::Fixed;

/// `priority = PRI_MAX - (recent_cpu / 4) - (nice * 2)`, clamped to
/// `[PRI_MIN, PRI_MAX]` (spec.md §4.3).
fn compute_priority(recent_cpu: Fixed, nice: i32) -> u8 {
    let raw = Fixed::from_int(PRI_MAX as i32)
        .sub(recent_cpu.div_int(4))
        .sub(Fixed::from_int(nice * 2))
        .to_int_round_nearest();
    raw.clamp(PRI_MIN as i32, PRI_MAX as i32) as u8
}

/// `recent_cpu = (2*load_avg)/(2*load_avg+1) * recent_cpu + nice`.
fn decay_recent_cpu(recent_cpu: Fixed, nice: i32, load_avg: Fixed) -> Fixed {
    let two_load_avg = load_avg.mul_int(2);
    let coefficient = two_load_avg.div(two_load_avg.add_int(1));
    coefficient.mul(recent_cpu).add_int(nice)
}

/// Called once per timer tick from `Scheduler::tick` while MLFQS is active.
/// `ticks` is the scheduler's post-increment tick counter, so `ticks == 1`
/// is the very first tick.
pub(super) fn on_tick(s: &mut Scheduler) {
    let ticks = s.ticks();
    let current = s.current();

    if !s.is_idle(current) {
        if let Some(t) = s.thread_mut(current) {
            t.recent_cpu = t.recent_cpu.add_int(1);
        }
    }

    if ticks % super::TIMER_FREQ == 0 {
        recompute_load_avg(s);
        recompute_all_recent_cpu(s);
        recompute_all_priorities(s);
    } else if ticks % 4 == 0 {
        recompute_one_priority(s, current);
    }
}

fn recompute_load_avg(s: &mut Scheduler) {
    let ready = s.ready_thread_count() as i32;
    let fifty_nine_sixtieths = Fixed::from_int(59).div_int(60);
    let one_sixtieth = Fixed::from_int(1).div_int(60);
    s.load_avg = fifty_nine_sixtieths
        .mul(s.load_avg)
        .add(one_sixtieth.mul_int(ready));
}

fn recompute_all_recent_cpu(s: &mut Scheduler) {
    let load_avg = s.load_avg;
    for t in s.threads_iter_mut() {
        t.recent_cpu = decay_recent_cpu(t.recent_cpu, t.nice, load_avg);
    }
}

fn recompute_all_priorities(s: &mut Scheduler) {
    let tids: alloc::vec::Vec<crate::ids::Tid> = s.threads_iter().map(|t| t.tid).collect();
    for tid in tids {
        recompute_one_priority(s, tid);
    }
}

fn recompute_one_priority(s: &mut Scheduler, tid: crate::ids::Tid) {
    if s.is_idle(tid) {
        return;
    }
    let Some(t) = s.thread(tid) else { return };
    let old_priority = t.effective_priority;
    let new_priority = compute_priority(t.recent_cpu, t.nice);
    if let Some(t) = s.thread_mut(tid) {
        t.base_priority = new_priority;
        t.effective_priority = new_priority;
    }
    s.reposition_in_mlfqs(tid, old_priority, new_priority);
}

/// `nice` setter, always legal even under MLFQS (only `set_priority` is
/// disabled): clamps to `[NICE_MIN, NICE_MAX]`, recomputes this thread's
/// priority, and yields if it no longer deserves the CPU.
pub fn set_nice(s: &mut Scheduler, tid: crate::ids::Tid, nice: i32) {
    let nice = nice.clamp(NICE_MIN, NICE_MAX);
    if let Some(t) = s.thread_mut(tid) {
        t.nice = nice;
    }
    recompute_one_priority(s, tid);
    s.maybe_yield();
}

pub fn get_nice(s: &Scheduler, tid: crate::ids::Tid) -> i32 {
    s.thread(tid).map(|t| t.nice).unwrap_or(0)
}

/// `load_avg * 100`, rounded to nearest, as returned by the `get_load_avg`
/// syscall (spec.md §4.10).
pub fn load_avg_percent(s: &Scheduler) -> i32 {
    s.load_avg.mul_int(100).to_int_round_nearest()
}

/// `recent_cpu * 100`, rounded to nearest, as returned by the
/// `get_recent_cpu` syscall.
pub fn recent_cpu_percent(s: &Scheduler, tid: crate::ids::Tid) -> i32 {
    s.thread(tid)
        .map(|t| t.recent_cpu.mul_int(100).to_int_round_nearest())
        .unwrap_or(0)
}
