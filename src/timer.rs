//! The timer (spec.md §2.2/§4.1): a 64-bit tick counter advanced by a
//! periodic interrupt, and a sleep queue built on `Scheduler::sleep_until`.
//! Busy-wait helpers are calibrated loop counts; since this core never runs
//! against real hardware, the loop count is supplied by the caller rather
//! than calibrated against a real PIT (calibration is a hardware concern,
//! spec.md §1).

use crate::scheduler::Scheduler;

/// `sleep(n)`: n≤0 returns immediately; otherwise blocks the current
/// thread until at least `n` ticks have passed (spec.md §4.1).
pub fn sleep(s: &mut Scheduler, n: i64) {
    if n <= 0 {
        return;
    }
    let deadline = s.ticks() + n as u64;
    s.sleep_until(deadline);
}

/// `elapsed(t) = now - t`.
pub fn elapsed(s: &Scheduler, t: u64) -> u64 {
    s.ticks() - t
}

/// A calibrated busy-wait over `loops` iterations of a single no-op
/// volatile read, the same shape as Pintos' `busy_wait`. The loop count is
/// supplied by the caller (a downstream arch-specific shell calibrates it
/// against the real timer frequency); this core only provides the loop
/// shape.
pub fn busy_wait(loops: u64) {
    let mut counter = 0u64;
    for _ in 0..loops {
        counter = core::hint::black_box(counter.wrapping_add(1));
    }
    let _ = counter;
}

/// Sleep for `us` microseconds given `loops_per_us`, calibrated elsewhere.
pub fn udelay(us: u64, loops_per_us: u64) {
    busy_wait(us.saturating_mul(loops_per_us));
}

/// Sleep for `ns` nanoseconds given `loops_per_us`, calibrated elsewhere.
pub fn ndelay(ns: u64, loops_per_us: u64) {
    busy_wait((ns.saturating_mul(loops_per_us)) / 1000);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::thread::PRI_DEFAULT;
    use crate::scheduler::Status;

    #[test]
    fn non_positive_sleep_returns_immediately() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", PRI_DEFAULT);
        s.set_current_for_test(a);
        sleep(&mut s, 0);
        sleep(&mut s, -5);
        assert_eq!(s.thread(a).unwrap().status, Status::Ready);
    }

    #[test]
    fn sleep_blocks_until_deadline() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", PRI_DEFAULT);
        s.set_current_for_test(a);
        let start = s.ticks();
        sleep(&mut s, 10);
        assert_eq!(s.thread(a).unwrap().status, Status::Blocked);
        for _ in 0..10 {
            s.tick();
        }
        assert_eq!(s.thread(a).unwrap().status, Status::Ready);
        assert!(elapsed(&s, start) >= 10);
    }
}
