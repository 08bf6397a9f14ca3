//! User processes (spec.md §4.4): loading an ELF executable, argument
//! passing, the parent/child lifecycle and per-process open files. Builds
//! directly on the scheduler's `ProcessLink` (the thin per-thread record)
//! and the VM subsystem's `AddressSpace`; the two are tied together here
//! rather than in either of those modules so neither has to know about the
//! other (spec.md §9's module boundaries).

pub mod elf;
pub mod stack;

use crate::console::ConsoleOutput;
use crate::fs::{FileObject, FsResult};
use crate::memory::frame::{FrameTable, FramePool, OwnerLookup};
use crate::memory::pagedir::PageDirectory;
use crate::memory::swap::{BlockDevice, SwapDevice};
use crate::memory::{AddressSpace, VAddr, PAGE_SIZE, PHYS_BASE};
use crate::scheduler::{Acquire, ProcessLink, Scheduler, PRI_DEFAULT};
use crate::ids::Tid;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

/// Returned by `execute` in place of a valid tid (spec.md §4.4 "a failed
/// load returns `TID_ERROR`"). `Tid::INVALID` already means "no such
/// thread" everywhere else, so it doubles as this sentinel.
pub const TID_ERROR: Tid = Tid::INVALID;

/// fd 0 and 1 are reserved for stdin/stdout (spec.md §4.10); real open
/// files start here.
const FIRST_FD: u32 = 2;

pub struct OpenFile {
    pub file: Box<dyn FileObject>,
    pub writable: bool,
}

/// Everything about a user process beyond the scheduler's own `ProcessLink`:
/// its address space and its open file table. Indexed by the owning
/// thread's `Tid` in `ProcessTable`, mirroring how `AddressSpace` is already
/// indexed by owner.
pub struct Process {
    pub executable_name: String,
    pub address_space: AddressSpace,
    open_files: BTreeMap<u32, OpenFile>,
    next_fd: u32,
}

impl Process {
    fn new(executable_name: String, address_space: AddressSpace) -> Self {
        Process {
            executable_name,
            address_space,
            open_files: BTreeMap::new(),
            next_fd: FIRST_FD,
        }
    }

    /// Install a freshly opened file under a new fd. Deny write access if
    /// `name` is this process's own running executable (spec.md §4.4
    /// "deny_write_on_executables").
    pub fn register_open(&mut self, name: &str, file: Box<dyn FileObject>) -> u32 {
        let writable = name != self.executable_name;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open_files.insert(fd, OpenFile { file, writable });
        fd
    }

    pub fn file(&mut self, fd: u32) -> Option<&mut OpenFile> {
        self.open_files.get_mut(&fd)
    }

    pub fn close(&mut self, fd: u32) {
        self.open_files.remove(&fd);
    }
}

/// All live processes, keyed by the `Tid` of the thread that backs them.
#[derive(Default)]
pub struct ProcessTable {
    processes: BTreeMap<Tid, Process>,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable::default()
    }

    pub fn get(&self, tid: Tid) -> Option<&Process> {
        self.processes.get(&tid)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Process> {
        self.processes.get_mut(&tid)
    }

    pub fn insert(&mut self, tid: Tid, process: Process) {
        self.processes.insert(tid, process);
    }

    pub fn remove(&mut self, tid: Tid) -> Option<Process> {
        self.processes.remove(&tid)
    }
}

/// Load `cmdline`'s executable and build a new process for it, or return
/// `None` (spec.md §4.4: a failed load returns `TID_ERROR`, which the
/// caller produces from `None`). Unlike the reference kernel, where a
/// freshly spawned thread races its parent to load the executable, there is
/// no separate thread body to run here (real execution is the
/// `ContextSwitch` collaborator's concern, spec.md §1), so loading happens
/// synchronously: the whole pipeline — parse, open, validate ELF, lay out
/// the stack — runs to completion before the child thread is even created,
/// so there is no partially-constructed process to unwind on failure.
///
/// Deliberately does NOT take `&mut ProcessTable`: `owner_lookup` may need
/// to reach back into that very table (to evict a page from some other
/// live process while installing this one's stack), and a second `&mut
/// ProcessTable` held by this function for the final insert would alias
/// it. Instead this returns the built `(Tid, Process)` and leaves the
/// insert to the caller, once `owner_lookup`'s borrow has ended.
#[allow(clippy::too_many_arguments)]
pub fn execute(
    s: &mut Scheduler,
    cmdline: &str,
    parent: Option<Tid>,
    open_file: &dyn Fn(&str) -> FsResult<Box<dyn FileObject>>,
    new_page_dir: &dyn Fn() -> Box<dyn PageDirectory>,
    frame_table: &FrameTable,
    pool: &FramePool,
    swap: &Mutex<SwapDevice<Box<dyn BlockDevice>>>,
    owner_lookup: &dyn OwnerLookup,
    write_frame: &mut dyn FnMut(VAddr, &[u8]),
) -> Option<(Tid, Process)> {
    let (filename, argv) = stack::parse_command_line(cmdline)?;

    let mut file = open_file(&filename).ok()?;

    let len = file.len();
    if len > (16 * 1024 * 1024) {
        return None;
    }
    let mut data = alloc::vec![0u8; len as usize];
    file.read(0, &mut data);

    let (_entry, segments) = elf::validate(&data).ok()?;

    let (stack_page, _esp_offset) = stack::build_initial_stack(&argv)?;

    let tid = s.spawn(&filename, PRI_DEFAULT);
    let load_complete_sem = s.new_semaphore(0);
    let exit_complete_sem = s.new_semaphore(0);
    if let Some(t) = s.thread_mut(tid) {
        t.process = Some(ProcessLink {
            parent,
            children: Vec::new(),
            exit_status: -1,
            loaded: true,
            waited: false,
            load_complete_sem,
            exit_complete_sem,
        });
    }
    if let Some(parent_tid) = parent {
        if let Some(p) = s.thread_mut(parent_tid) {
            if let Some(link) = &mut p.process {
                link.children.push(tid);
            }
        }
    }

    let mut address_space = AddressSpace::new(tid, new_page_dir());
    for seg in &segments {
        if seg.mem_size == 0 {
            continue;
        }
        let seg_vaddr = VAddr::new(seg.vaddr);
        let page_offset = seg_vaddr.offset_in_page();
        let upage = seg_vaddr.round_down();
        let read_bytes = seg.file_size as u32 + page_offset as u32;
        let zero_bytes = ((seg.mem_size - seg.file_size) as u32).saturating_add(0);
        let file_offset = seg.file_offset - page_offset;
        address_space.load_file_backed(
            upage,
            file.reopen(),
            read_bytes,
            zero_bytes,
            file_offset,
            seg.writable,
            false,
            seg.executable,
        );
    }

    let top_page = VAddr::new(PHYS_BASE - PAGE_SIZE);
    address_space.install_initial_stack(
        top_page,
        &stack_page,
        frame_table,
        pool,
        swap,
        owner_lookup,
        write_frame,
    );

    s.sema_up(load_complete_sem);
    Some((tid, Process::new(filename, address_space)))
}

/// What `wait` does when the scheduler's non-suspending model (spec.md §1)
/// means it cannot simply return the exit status inline. Mirrors the
/// `Acquire`/`finish_lock_acquire` split every other blocking call in this
/// crate already uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The child had already exited; its status is ready immediately.
    Done(i32),
    /// Not ready yet — the caller must `block_current` (already done) and
    /// hand off to the `ContextSwitch` collaborator, then call
    /// `finish_wait` once `parent` is scheduled again.
    Blocked,
    /// `child` is not a living, un-waited-on child of `parent` (spec.md
    /// §4.4: wait on anything else returns -1 immediately).
    NotAChild,
}

/// `wait(child)` (spec.md §4.4): a process may wait on each of its direct
/// children exactly once.
pub fn wait(s: &mut Scheduler, parent: Tid, child: Tid) -> WaitOutcome {
    let is_child = s
        .thread(parent)
        .and_then(|t| t.process.as_ref())
        .map(|link| link.children.contains(&child))
        .unwrap_or(false);
    if !is_child {
        return WaitOutcome::NotAChild;
    }

    let Some(link) = s.thread(child).and_then(|t| t.process.as_ref()) else {
        // Already reaped by a previous wait.
        return WaitOutcome::NotAChild;
    };
    if link.waited {
        return WaitOutcome::NotAChild;
    }
    let exit_sem = link.exit_complete_sem;

    if let Some(t) = s.thread_mut(child) {
        if let Some(link) = &mut t.process {
            link.waited = true;
        }
    }

    match s.sema_try_down(exit_sem) {
        Acquire::Acquired => WaitOutcome::Done(reap(s, child)),
        Acquire::WouldBlock => {
            s.block_current();
            WaitOutcome::Blocked
        }
    }
}

/// Complete a `wait` that returned `WaitOutcome::Blocked`, once `parent` has
/// been scheduled again after `child`'s `exit` raised `exit_complete_sem`.
pub fn finish_wait(s: &mut Scheduler, child: Tid) -> i32 {
    reap(s, child)
}

fn reap(s: &mut Scheduler, child: Tid) -> i32 {
    let status = s
        .thread(child)
        .and_then(|t| t.process.as_ref())
        .map(|l| l.exit_status)
        .unwrap_or(-1);
    s.destroy_thread(child);
    status
}

/// `exit(status)` (spec.md §4.4/§6): print the termination message, tear
/// down every resource the process owns, then hand the exit status to
/// whichever parent is waiting (or will wait later). The scheduler-level
/// thread record survives as a zombie, holding only `exit_status`, until a
/// parent calls `wait`/`finish_wait` to reap it — if no parent ever does,
/// it leaks, the same trade-off the reference kernel makes when a parent
/// exits before its children.
pub fn exit(
    s: &mut Scheduler,
    table: &mut ProcessTable,
    tid: Tid,
    status: i32,
    frame_table: &FrameTable,
    read_frame: &mut dyn FnMut(VAddr, &mut [u8]),
    console: &mut dyn ConsoleOutput,
) {
    let name = s.thread(tid).map(|t| t.name.clone()).unwrap_or_default();
    let message = format!("{}: exit({})\n", name, status);
    console.put_buffer(message.as_bytes());

    if let Some(mut process) = table.remove(tid) {
        process.address_space.destroy(frame_table, read_frame);
    }

    let exit_sem = s.thread(tid).and_then(|t| t.process.as_ref()).map(|l| l.exit_complete_sem);
    if let Some(t) = s.thread_mut(tid) {
        if let Some(link) = &mut t.process {
            link.exit_status = status;
        }
    }
    if let Some(sem) = exit_sem {
        s.sema_up(sem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemStore;
    use crate::memory::pagedir::MockPageDirectory;
    use crate::memory::swap::MemBlockDevice;
    use crate::memory::frame::FramePool as Pool;
    use alloc::sync::Arc;
    use alloc::collections::BTreeMap as Map;

    struct SingleOwner {
        spaces: Mutex<Map<u64, Mutex<AddressSpace>>>,
    }

    impl OwnerLookup for SingleOwner {
        fn with_address_space<R>(
            &self,
            owner: Tid,
            f: &mut dyn FnMut(&mut dyn PageDirectory, &mut crate::memory::spt::Spt) -> R,
        ) -> Option<R> {
            let spaces = self.spaces.lock();
            let aspace = spaces.get(&owner.0)?;
            let mut aspace = aspace.lock();
            Some(f(&mut *aspace.page_dir, &mut aspace.spt))
        }
    }

    fn build_minimal_elf() -> Vec<u8> {
        const EHDR_SIZE: usize = 52;
        const PHDR_SIZE: usize = 32;
        let mut data = alloc::vec![0u8; EHDR_SIZE + PHDR_SIZE];
        data[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        data[4] = 1; // ELFCLASS32
        data[5] = 1; // ELFDATA2LSB
        data[6] = 1; // EV_CURRENT
        data[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        data[18..20].copy_from_slice(&0x03u16.to_le_bytes()); // EM_386
        data[20..24].copy_from_slice(&1u32.to_le_bytes());
        data[24..28].copy_from_slice(&0x1000u32.to_le_bytes()); // e_entry
        data[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes()); // e_phoff
        data[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        data[44..46].copy_from_slice(&1u16.to_le_bytes()); // one phdr

        let base = EHDR_SIZE;
        data[base..base + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        data[base + 4..base + 8].copy_from_slice(&0u32.to_le_bytes()); // p_offset
        data[base + 8..base + 12].copy_from_slice(&0x1000u32.to_le_bytes()); // p_vaddr
        data[base + 16..base + 20].copy_from_slice(&(EHDR_SIZE as u32 + PHDR_SIZE as u32).to_le_bytes()); // p_filesz
        data[base + 20..base + 24].copy_from_slice(&0x1000u32.to_le_bytes()); // p_memsz
        data[base + 24..base + 28].copy_from_slice(&5u32.to_le_bytes()); // PF_R | PF_X
        data
    }

    fn harness() -> (Scheduler, ProcessTable, MemStore, Arc<SingleOwner>, FrameTable, Pool, Mutex<SwapDevice<Box<dyn BlockDevice>>>) {
        let s = Scheduler::new(false);
        let table = ProcessTable::new();
        let store = MemStore::new();
        store.create("echo").unwrap();
        store.write_all("echo", &build_minimal_elf()).unwrap();
        let owner = Arc::new(SingleOwner { spaces: Mutex::new(Map::new()) });
        let frame_table = FrameTable::new();
        let pool = Pool::new(0x500000, 16);
        let dev: Box<dyn BlockDevice> = Box::new(MemBlockDevice::new(4 * crate::memory::swap::SECTORS_PER_SLOT));
        let swap = Mutex::new(SwapDevice::new(dev));
        (s, table, store, owner, frame_table, pool, swap)
    }

    #[test]
    fn execute_unknown_file_returns_tid_error() {
        let (mut s, mut table, store, owner, frame_table, pool, swap) = harness();
        let result = execute(
            &mut s,
            "nonexistent arg",
            None,
            &|name| store.open(name).map(|f| Box::new(f) as Box<dyn FileObject>),
            &|| Box::new(MockPageDirectory::new()),
            &frame_table,
            &pool,
            &swap,
            &*owner,
            &mut |_, _| {},
        );
        assert!(result.is_none());
        let _ = table;
    }

    #[test]
    fn execute_valid_elf_spawns_process_and_links_parent() {
        let (mut s, mut table, store, owner, frame_table, pool, swap) = harness();
        let parent = s.spawn("shell", PRI_DEFAULT);

        let (tid, process) = execute(
            &mut s,
            "echo hello",
            Some(parent),
            &|name| store.open(name).map(|f| Box::new(f) as Box<dyn FileObject>),
            &|| Box::new(MockPageDirectory::new()),
            &frame_table,
            &pool,
            &swap,
            &*owner,
            &mut |_, _| {},
        )
        .expect("valid elf should load");
        table.insert(tid, process);

        assert_ne!(tid, TID_ERROR);
        assert!(table.get(tid).is_some());
        assert_eq!(table.get(tid).unwrap().executable_name, "echo");
        assert!(s
            .thread(parent)
            .unwrap()
            .process
            .as_ref()
            .unwrap()
            .children
            .contains(&tid));
    }

    #[test]
    fn exit_then_wait_reaps_immediately() {
        let (mut s, mut table, store, owner, frame_table, pool, swap) = harness();
        let parent = s.spawn("shell", PRI_DEFAULT);
        if let Some(t) = s.thread_mut(parent) {
            t.process = Some(ProcessLink {
                parent: None,
                children: Vec::new(),
                exit_status: -1,
                loaded: true,
                waited: false,
                load_complete_sem: s_dummy_sem(&mut s),
                exit_complete_sem: s_dummy_sem(&mut s),
            });
        }

        let (child, process) = execute(
            &mut s,
            "echo",
            Some(parent),
            &|name| store.open(name).map(|f| Box::new(f) as Box<dyn FileObject>),
            &|| Box::new(MockPageDirectory::new()),
            &frame_table,
            &pool,
            &swap,
            &*owner,
            &mut |_, _| {},
        )
        .expect("valid elf should load");
        table.insert(child, process);
        assert_ne!(child, TID_ERROR);

        let mut console = crate::console::MemConsole::new();
        exit(&mut s, &mut table, child, 42, &frame_table, &mut |_, _| {}, &mut console);
        assert!(core::str::from_utf8(&console.written).unwrap().contains("exit(42)"));

        match wait(&mut s, parent, child) {
            WaitOutcome::Done(status) => assert_eq!(status, 42),
            other => panic!("expected immediate completion, got {:?}", other),
        }

        // A second wait on the same child is rejected.
        assert_eq!(wait(&mut s, parent, child), WaitOutcome::NotAChild);
    }

    fn s_dummy_sem(s: &mut Scheduler) -> crate::scheduler::SemId {
        s.new_semaphore(0)
    }

    #[test]
    fn wait_on_non_child_returns_not_a_child() {
        let (mut s, _table, _store, _owner, _frame_table, _pool, _swap) = harness();
        let a = s.spawn("a", PRI_DEFAULT);
        let b = s.spawn("b", PRI_DEFAULT);
        assert_eq!(wait(&mut s, a, b), WaitOutcome::NotAChild);
    }
}
