//! The thread record (spec.md §3 "Thread"): everything the scheduler,
//! synchronization primitives and process subsystem track about one thread
//! of control, minus the kernel stack and saved context itself — those are
//! the `ContextSwitch` collaborator's concern (see `super::context`).

use super::{LockId, SemId};
use crate::fixed_point::Fixed;
use crate::ids::Tid;
use alloc::string::String;
use alloc::vec::Vec;

pub const PRI_MIN: u8 = 0;
pub const PRI_MAX: u8 = 63;
pub const PRI_DEFAULT: u8 = 31;
pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 20;

/// Corruption canary (spec.md §3/§9): every live thread carries this
/// sentinel, checked at each scheduling decision so a stack overflow that
/// clobbers a `Thread` is caught instead of silently corrupting the
/// scheduler's bookkeeping.
pub const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Process attributes, set only on threads backing a user process (spec.md
/// §3: "Process attributes (only set for threads backing a user process)").
/// The heavier subsystems (page directory, SPT, mmap table, open files) live
/// in `crate::process::Process`, referenced from here by id so the
/// scheduler's thread arena doesn't need to know their types.
pub struct ProcessLink {
    pub parent: Option<Tid>,
    pub children: Vec<Tid>,
    pub exit_status: i32,
    pub loaded: bool,
    pub waited: bool,
    pub load_complete_sem: SemId,
    pub exit_complete_sem: SemId,
}

pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub status: Status,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub nice: i32,
    pub recent_cpu: Fixed,
    pub waiting_on_lock: Option<LockId>,
    pub waiting_on_semaphore: Option<SemId>,
    pub held_locks: Vec<LockId>,
    pub wake_deadline: Option<u64>,
    pub process: Option<ProcessLink>,
    pub magic: u32,
}

impl Thread {
    pub fn new(tid: Tid, name: &str, priority: u8) -> Self {
        Thread {
            tid,
            name: String::from(name),
            status: Status::Ready,
            base_priority: priority,
            effective_priority: priority,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            waiting_on_lock: None,
            waiting_on_semaphore: None,
            held_locks: Vec::new(),
            wake_deadline: None,
            process: None,
            magic: THREAD_MAGIC,
        }
    }
}
