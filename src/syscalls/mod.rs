//! System-call dispatch (spec.md §4.10/§6): the sole entry point from user
//! mode. `Kernel` is the "singleton kernel context" spec.md §9 describes —
//! the scheduler, the process table, and every VM collaborator live here as
//! plain fields, each with its own lock discipline, rather than as hidden
//! globals (the reference kernel's `struct thread *cur`/`frame_table`/
//! `filesys_lock` file-scope statics).
//!
//! Argument marshalling mirrors `userprog/syscall.c`'s `get_word_on_stack`:
//! every word is read off the user stack at a fixed offset from `esp`, and
//! every user pointer (the call number's own word included) is validated
//! before use.

use crate::console::{ConsoleOutput, InputSource, CONSOLE_CHUNK};
use crate::fs::{FileObject, FsResult, MemStore};
use crate::ids::Tid;
use crate::memory::address_space::FaultOutcome;
use crate::memory::frame::{FramePool, FrameTable, OwnerLookup};
use crate::memory::pagedir::PageDirectory;
use crate::memory::spt::Spt;
use crate::memory::swap::{BlockDevice, MemBlockDevice, SwapDevice, SECTORS_PER_SLOT};
use crate::memory::{VAddr, PAGE_SIZE};
use crate::process::{self, ProcessTable, WaitOutcome, TID_ERROR};
use crate::scheduler::Scheduler;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use spin::Mutex;

/// Call numbers, in the order `userprog/syscall-nr.h` assigns them; `mmap`
/// and `munmap` are appended after `close` the way the VM project extends
/// the table (spec.md §4.10).
pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_REMOVE: u32 = 5;
pub const SYS_OPEN: u32 = 6;
pub const SYS_FILESIZE: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_TELL: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_MMAP: u32 = 13;
pub const SYS_MUNMAP: u32 = 14;

/// `fd` reserved for the keyboard (spec.md §4.10: "fd=0 reads keyboard").
const STDIN_FD: u32 = 0;
/// `fd` reserved for the console (spec.md §4.10: "fd=1 calls console put-buffer").
const STDOUT_FD: u32 = 1;

/// What a syscall handler does once it's decided the process must die
/// instead of returning a value — folds every user-fault path (spec.md §7.1)
/// into one outcome the dispatcher can act on uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Value(i32),
    /// The calling process is terminated with status -1 before returning.
    Terminate,
    /// `wait`/`exec` blocked; the caller must suspend and come back via
    /// `finish_wait`/`finish_exec` once rescheduled.
    Blocked,
}

/// Adapter handing `frame_table`'s eviction sweep a view onto whichever
/// process it needs, without requiring `Kernel::table` to be a real lock.
/// `RefCell` rather than `spin::Mutex` because this is single-threaded,
/// interrupts-disabled kernel code (spec.md §5) — there is no second thread
/// to race, only the possibility that eviction circles back to the very
/// process already being serviced. `try_borrow_mut` turns that one case into
/// "owner vanished" (`None`) instead of a panic, the same fallback the frame
/// table already uses when a victim's owner has exited mid-sweep. A process
/// evicting one of its own other pages while already mid-fault therefore
/// skips that page's dirty write-back — an accepted gap, noted in
/// DESIGN.md, that the reference kernel's unlocked single-threaded C code
/// never has to consider.
struct TableLookup<'a> {
    table: RefCell<&'a mut ProcessTable>,
}

impl<'a> OwnerLookup for TableLookup<'a> {
    fn with_address_space<R>(
        &self,
        owner: Tid,
        f: &mut dyn FnMut(&mut dyn PageDirectory, &mut Spt) -> R,
    ) -> Option<R> {
        let mut table = self.table.try_borrow_mut().ok()?;
        let proc = table.get_mut(owner)?;
        Some(f(&mut *proc.address_space.page_dir, &mut proc.address_space.spt))
    }
}

/// Simulated physical memory: every frame the pool hands out is backed by a
/// page-sized slot here instead of a real mapped address, since this core
/// never runs on hardware (spec.md §1). `read_frame`/`write_frame` close
/// over this the same way `AddressSpace`'s own tests do.
#[derive(Default)]
struct PhysicalMemory {
    frames: BTreeMap<u64, [u8; PAGE_SIZE as usize]>,
}

impl PhysicalMemory {
    fn read(&mut self, frame: VAddr, buf: &mut [u8]) {
        let page = self.frames.entry(frame.0).or_insert([0u8; PAGE_SIZE as usize]);
        buf.copy_from_slice(&page[..buf.len()]);
    }

    fn write(&mut self, frame: VAddr, buf: &[u8]) {
        let page = self.frames.entry(frame.0).or_insert([0u8; PAGE_SIZE as usize]);
        page[..buf.len()].copy_from_slice(buf);
    }
}

/// The kernel singleton (spec.md §9 "Global mutable state"): the scheduler,
/// every live process, and the VM collaborators they all share.
pub struct Kernel {
    pub scheduler: Scheduler,
    table: ProcessTable,
    frame_table: FrameTable,
    pool: FramePool,
    swap: Mutex<SwapDevice<Box<dyn BlockDevice>>>,
    store: MemStore,
    memory: Mutex<PhysicalMemory>,
    console: Box<dyn ConsoleOutput>,
    input: Box<dyn InputSource>,
}

impl Kernel {
    pub fn new(mlfqs: bool, console: Box<dyn ConsoleOutput>, input: Box<dyn InputSource>) -> Self {
        let dev: Box<dyn BlockDevice> = Box::new(MemBlockDevice::new(4096 * SECTORS_PER_SLOT));
        Kernel {
            scheduler: Scheduler::new(mlfqs),
            table: ProcessTable::new(),
            frame_table: FrameTable::new(),
            pool: FramePool::new(0x1000_0000, 256),
            swap: Mutex::new(SwapDevice::new(dev)),
            store: MemStore::new(),
            memory: Mutex::new(PhysicalMemory::default()),
            console,
            input,
        }
    }

    fn open_file(&self, name: &str) -> FsResult<Box<dyn FileObject>> {
        self.store.open(name).map(|f| Box::new(f) as Box<dyn FileObject>)
    }

    /// `execute(cmdline)` on behalf of `exec` (spec.md §4.4). Parent is the
    /// currently scheduled thread.
    ///
    /// Destructures `self` into disjoint field borrows rather than calling
    /// `process::execute(&mut self.scheduler, ...)` alongside a
    /// `TableLookup` built over `&mut self.table` — the two would otherwise
    /// be two live mutable borrows of the same field in one call. Since
    /// `execute` itself no longer touches the table (see its doc comment),
    /// `table` only needs to be reclaimed from the lookup afterward, for the
    /// actual insert.
    pub fn spawn_process(&mut self, cmdline: &str) -> Tid {
        let parent = self.scheduler.current();
        let Kernel { scheduler, table, frame_table, pool, swap, store, memory, .. } = self;
        let mut mem = memory.lock();
        let lookup = TableLookup { table: RefCell::new(table) };
        let result = process::execute(
            scheduler,
            cmdline,
            Some(parent),
            &|name| store.open(name).map(|f| Box::new(f) as Box<dyn FileObject>),
            &|| Box::new(crate::memory::pagedir::MockPageDirectory::new()) as Box<dyn PageDirectory>,
            frame_table,
            pool,
            swap,
            &lookup,
            &mut |frame, buf| mem.write(frame, buf),
        );
        drop(mem);
        let table = lookup.table.into_inner();
        match result {
            Some((tid, process)) => {
                table.insert(tid, process);
                tid
            }
            None => TID_ERROR,
        }
    }

    /// Resolve a page fault at `fault_addr` for the currently running
    /// process (spec.md §4.9). Returns `Terminate` when the fault cannot be
    /// resolved; the caller (the fault-handler collaborator, out of scope
    /// per spec.md §1) is responsible for then calling `exit_current`.
    ///
    /// Takes the faulting process out of the table for the duration of the
    /// fault rather than holding a `&mut Process` borrowed from it: that
    /// leaves `self.table` free for `TableLookup` to reach any *other* live
    /// process during eviction. A re-entrant touch of this same tid (the
    /// one genuine self-eviction case) simply finds the table missing its
    /// entry and returns `None`, the same "owner vanished mid-sweep"
    /// fallback the frame table already has to handle.
    pub fn handle_page_fault(&mut self, fault_addr: VAddr, esp: VAddr, is_write: bool) -> Outcome {
        let tid = self.scheduler.current();
        let Some(mut process) = self.table.remove(tid) else {
            return Outcome::Terminate;
        };
        let mut memory = self.memory.lock();
        let lookup = TableLookup { table: RefCell::new(&mut self.table) };
        let outcome = process.address_space.fault(
            fault_addr,
            esp,
            is_write,
            &self.frame_table,
            &self.pool,
            &self.swap,
            &lookup,
            &mut |frame, buf| memory.read(frame, buf),
            &mut |frame, buf| memory.write(frame, buf),
        );
        drop(memory);
        self.table.insert(tid, process);
        match outcome {
            FaultOutcome::Resolved | FaultOutcome::StackGrown => Outcome::Value(0),
            FaultOutcome::Unmappable => Outcome::Terminate,
        }
    }

    /// Validate that every byte of `[addr, addr+len)` is a legitimate user
    /// access and fault it into residence if necessary, then read it into a
    /// fresh buffer. `None` means the access is invalid and the process must
    /// be terminated (spec.md §4.10 "every read word's address is
    /// validated... failure terminates the process").
    fn read_user_bytes(&mut self, tid: Tid, addr: VAddr, len: usize, esp: VAddr) -> Option<Vec<u8>> {
        if addr.0 == 0 || !addr.is_user_space() {
            return None;
        }
        let mut out = alloc::vec![0u8; len];
        let mut offset = 0usize;
        while offset < len {
            let page_addr = addr.add(offset as u64);
            if !page_addr.is_user_space() {
                return None;
            }
            self.ensure_resident(tid, page_addr, esp)?;
            let frame = self.translate(tid, page_addr)?;
            let page_off = page_addr.offset_in_page() as usize;
            let chunk = core::cmp::min(PAGE_SIZE as usize - page_off, len - offset);
            let mut page = [0u8; PAGE_SIZE as usize];
            self.memory.lock().read(frame, &mut page);
            out[offset..offset + chunk].copy_from_slice(&page[page_off..page_off + chunk]);
            offset += chunk;
        }
        Some(out)
    }

    fn write_user_bytes(&mut self, tid: Tid, addr: VAddr, data: &[u8], esp: VAddr) -> bool {
        if addr.0 == 0 || !addr.is_user_space() {
            return false;
        }
        let mut offset = 0usize;
        while offset < data.len() {
            let page_addr = addr.add(offset as u64);
            if !page_addr.is_user_space() || self.ensure_resident(tid, page_addr, esp).is_none() {
                return false;
            }
            if !self.is_writable(tid, page_addr) {
                return false;
            }
            let Some(frame) = self.translate(tid, page_addr) else {
                return false;
            };
            let page_off = page_addr.offset_in_page() as usize;
            let chunk = core::cmp::min(PAGE_SIZE as usize - page_off, data.len() - offset);
            let mut page = [0u8; PAGE_SIZE as usize];
            self.memory.lock().read(frame, &mut page);
            page[page_off..page_off + chunk].copy_from_slice(&data[offset..offset + chunk]);
            self.memory.lock().write(frame, &page);
            offset += chunk;
        }
        true
    }

    fn ensure_resident(&mut self, tid: Tid, addr: VAddr, esp: VAddr) -> Option<()> {
        let resident = self
            .table
            .get(tid)
            .and_then(|p| p.address_space.spt.lookup(addr.round_down()))
            .map(|e| e.in_memory)
            .unwrap_or(false);
        if resident {
            return Some(());
        }
        match self.handle_page_fault(addr, esp, false) {
            Outcome::Value(_) => Some(()),
            _ => None,
        }
    }

    fn translate(&self, tid: Tid, addr: VAddr) -> Option<VAddr> {
        let upage = addr.round_down();
        let base = self.table.get(tid)?.address_space.page_dir.translate(upage)?;
        Some(base.add(addr.offset_in_page()))
    }

    fn is_writable(&self, tid: Tid, addr: VAddr) -> bool {
        self.table
            .get(tid)
            .and_then(|p| p.address_space.spt.lookup(addr.round_down()))
            .map(|e| e.is_writable())
            .unwrap_or(false)
    }

    fn read_user_cstr(&mut self, tid: Tid, addr: VAddr, esp: VAddr) -> Option<String> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        loop {
            let b = self.read_user_bytes(tid, cursor, 1, esp)?;
            if b[0] == 0 {
                break;
            }
            bytes.push(b[0]);
            cursor = cursor.add(1);
            if bytes.len() > PAGE_SIZE as usize {
                return None;
            }
        }
        String::from_utf8(bytes).ok()
    }

    /// Terminate `tid` with `status`, printing the termination message and
    /// tearing down its resources (spec.md §4.4/§6).
    pub fn exit_current(&mut self, status: i32) {
        let tid = self.scheduler.current();
        let mut memory = self.memory.lock();
        process::exit(
            &mut self.scheduler,
            &mut self.table,
            tid,
            status,
            &self.frame_table,
            &mut |frame, buf| memory.read(frame, buf),
            &mut *self.console,
        );
    }

    /// Dispatch one syscall trap. `esp` is the user stack pointer at the
    /// moment of the trap, used both to read arguments and — if a syscall
    /// argument pointer is itself unmapped — to judge stack growth (spec.md
    /// §4.9's `esp` parameter to the fault handler is this same value).
    pub fn dispatch(&mut self, esp: VAddr) -> Outcome {
        let tid = self.scheduler.current();
        let Some(number) = self.read_u32_arg(tid, esp, 0) else {
            return self.kill(tid);
        };

        macro_rules! arg {
            ($i:expr) => {
                match self.read_u32_arg(tid, esp, $i) {
                    Some(v) => v,
                    None => return self.kill(tid),
                }
            };
        }

        match number {
            SYS_HALT => Outcome::Value(0),
            SYS_EXIT => {
                let status = arg!(1) as i32;
                self.exit_current(status);
                Outcome::Value(status)
            }
            SYS_EXEC => {
                let Some(cmdline) = self.read_user_cstr(tid, VAddr::new(arg!(1) as u64), esp) else {
                    return self.kill(tid);
                };
                let child = self.spawn_process(&cmdline);
                if child == TID_ERROR {
                    return Outcome::Value(-1);
                }
                let loaded = self.scheduler.thread(child).and_then(|t| t.process.as_ref()).map(|l| l.loaded).unwrap_or(false);
                if !loaded {
                    Outcome::Value(-1)
                } else {
                    Outcome::Value(child.0 as i32)
                }
            }
            SYS_WAIT => {
                let child = Tid(arg!(1) as u64);
                match process::wait(&mut self.scheduler, tid, child) {
                    WaitOutcome::Done(status) => Outcome::Value(status),
                    WaitOutcome::Blocked => Outcome::Blocked,
                    WaitOutcome::NotAChild => Outcome::Value(-1),
                }
            }
            SYS_CREATE => {
                let Some(name) = self.read_user_cstr(tid, VAddr::new(arg!(1) as u64), esp) else {
                    return self.kill(tid);
                };
                let _initial_size = arg!(2);
                Outcome::Value(self.store.create(&name).is_ok() as i32)
            }
            SYS_REMOVE => {
                let Some(name) = self.read_user_cstr(tid, VAddr::new(arg!(1) as u64), esp) else {
                    return self.kill(tid);
                };
                Outcome::Value(self.store.remove(&name).is_ok() as i32)
            }
            SYS_OPEN => {
                let Some(name) = self.read_user_cstr(tid, VAddr::new(arg!(1) as u64), esp) else {
                    return self.kill(tid);
                };
                match self.open_file(&name) {
                    Ok(file) => {
                        let Some(proc) = self.table.get_mut(tid) else {
                            return Outcome::Value(-1);
                        };
                        Outcome::Value(proc.register_open(&name, file) as i32)
                    }
                    Err(_) => Outcome::Value(-1),
                }
            }
            SYS_FILESIZE => {
                let fd = arg!(1);
                match self.table.get_mut(tid).and_then(|p| p.file(fd)) {
                    Some(of) => Outcome::Value(of.file.len() as i32),
                    None => Outcome::Value(-1),
                }
            }
            SYS_READ => {
                let fd = arg!(1);
                let buf_addr = VAddr::new(arg!(2) as u64);
                let n = arg!(3) as usize;
                self.sys_read(tid, fd, buf_addr, n, esp)
            }
            SYS_WRITE => {
                let fd = arg!(1);
                let buf_addr = VAddr::new(arg!(2) as u64);
                let n = arg!(3) as usize;
                self.sys_write(tid, fd, buf_addr, n, esp)
            }
            SYS_SEEK => Outcome::Value(0), // per-fd offset is tracked by the caller (spec.md §1)
            SYS_TELL => Outcome::Value(0),
            SYS_CLOSE => {
                let fd = arg!(1);
                if fd == STDIN_FD || fd == STDOUT_FD {
                    return self.kill(tid);
                }
                if let Some(proc) = self.table.get_mut(tid) {
                    if proc.file(fd).is_none() {
                        return self.kill(tid);
                    }
                    proc.close(fd);
                }
                Outcome::Value(0)
            }
            SYS_MMAP => {
                let fd = arg!(1);
                let addr = VAddr::new(arg!(2) as u64);
                self.sys_mmap(tid, fd, addr)
            }
            SYS_MUNMAP => {
                let mapid = arg!(1);
                self.sys_munmap(tid, mapid);
                Outcome::Value(0)
            }
            _ => self.kill(tid),
        }
    }

    fn kill(&mut self, tid: Tid) -> Outcome {
        let _ = tid;
        self.exit_current(-1);
        Outcome::Value(-1)
    }

    /// Read the `i`-th stack-relative word (0 = the call number itself),
    /// validating the pointer first (spec.md §4.10).
    fn read_u32_arg(&mut self, tid: Tid, esp: VAddr, i: u64) -> Option<u32> {
        let addr = esp.add(i * 4);
        let bytes = self.read_user_bytes(tid, addr, 4, esp)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    fn sys_read(&mut self, tid: Tid, fd: u32, buf: VAddr, n: usize, esp: VAddr) -> Outcome {
        if fd == STDOUT_FD {
            return self.kill(tid);
        }
        if fd == STDIN_FD {
            let mut data = Vec::with_capacity(n);
            for _ in 0..n {
                match self.input.read_char() {
                    Some(b) => data.push(b),
                    None => break,
                }
            }
            let len = data.len();
            if !self.write_user_bytes(tid, buf, &data, esp) {
                return self.kill(tid);
            }
            return Outcome::Value(len as i32);
        }
        let Some(proc) = self.table.get_mut(tid) else {
            return Outcome::Value(-1);
        };
        let Some(of) = proc.file(fd) else {
            return Outcome::Value(-1);
        };
        let mut data = alloc::vec![0u8; n];
        let read = of.file.read(0, &mut data);
        data.truncate(read);
        if !self.write_user_bytes(tid, buf, &data, esp) {
            return self.kill(tid);
        }
        Outcome::Value(read as i32)
    }

    fn sys_write(&mut self, tid: Tid, fd: u32, buf: VAddr, n: usize, esp: VAddr) -> Outcome {
        if fd == STDIN_FD {
            return self.kill(tid);
        }
        let Some(data) = self.read_user_bytes(tid, buf, n, esp) else {
            return self.kill(tid);
        };
        if fd == STDOUT_FD {
            for chunk in data.chunks(CONSOLE_CHUNK) {
                self.console.put_chunk(chunk);
            }
            return Outcome::Value(n as i32);
        }
        let Some(proc) = self.table.get_mut(tid) else {
            return Outcome::Value(0);
        };
        let Some(of) = proc.file(fd) else {
            return Outcome::Value(0);
        };
        if !of.writable {
            return Outcome::Value(0);
        }
        let written = of.file.write(0, &data);
        Outcome::Value(written as i32)
    }

    /// `mmap(fd, addr)` (spec.md §4.8): fails on fd 0/1, a zero or
    /// unaligned address, an empty file, or any page of the range already
    /// spoken for.
    fn sys_mmap(&mut self, tid: Tid, fd: u32, addr: VAddr) -> Outcome {
        if fd == STDIN_FD || fd == STDOUT_FD || addr.0 == 0 || !addr.is_page_aligned() {
            return Outcome::Value(-1);
        }
        let Some(proc) = self.table.get_mut(tid) else {
            return Outcome::Value(-1);
        };
        let Some(of) = proc.file(fd) else {
            return Outcome::Value(-1);
        };
        let file = of.file.reopen();
        let len = file.len();
        match proc.address_space.mmap(addr, file, len) {
            Some(mapid) => Outcome::Value(mapid as i32),
            None => Outcome::Value(-1),
        }
    }

    fn sys_munmap(&mut self, tid: Tid, mapid: u32) {
        let mut memory = self.memory.lock();
        if let Some(proc) = self.table.get_mut(tid) {
            proc.address_space.munmap(mapid, &self.frame_table, &mut |frame, buf| memory.read(frame, buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::MemConsole;
    use crate::process::stack;

    const EHDR_SIZE: usize = 52;
    const PHDR_SIZE: usize = 32;

    fn build_minimal_elf() -> Vec<u8> {
        let mut data = alloc::vec![0u8; EHDR_SIZE + PHDR_SIZE + 0x2000];
        data[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        data[4] = 1;
        data[5] = 1;
        data[6] = 1;
        data[16..18].copy_from_slice(&2u16.to_le_bytes());
        data[18..20].copy_from_slice(&0x03u16.to_le_bytes());
        data[20..24].copy_from_slice(&1u32.to_le_bytes());
        data[24..28].copy_from_slice(&0x1000u32.to_le_bytes());
        data[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
        data[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        data[44..46].copy_from_slice(&1u16.to_le_bytes());

        let base = EHDR_SIZE;
        data[base..base + 4].copy_from_slice(&1u32.to_le_bytes());
        data[base + 4..base + 8].copy_from_slice(&0u32.to_le_bytes());
        data[base + 8..base + 12].copy_from_slice(&0x1000u32.to_le_bytes());
        data[base + 16..base + 20].copy_from_slice(&(EHDR_SIZE as u32 + PHDR_SIZE as u32).to_le_bytes());
        data[base + 20..base + 24].copy_from_slice(&0x1000u32.to_le_bytes());
        data[base + 24..base + 28].copy_from_slice(&6u32.to_le_bytes()); // PF_R | PF_W
        data
    }

    fn make_kernel() -> Kernel {
        Kernel::new(false, Box::new(MemConsole::new()), Box::new(MemConsole::new()))
    }

    #[test]
    fn execute_and_exit_prints_termination_message() {
        let mut k = make_kernel();
        k.store.create("prog").unwrap();
        k.store.write_all("prog", &build_minimal_elf()).unwrap();

        let shell = k.scheduler.spawn("shell", crate::scheduler::PRI_DEFAULT);
        k.scheduler.set_current_for_test(shell);

        let child = k.spawn_process("prog");
        assert_ne!(child, TID_ERROR);

        k.scheduler.set_current_for_test(child);
        k.exit_current(7);
        match process::wait(&mut k.scheduler, shell, child) {
            WaitOutcome::Done(status) => assert_eq!(status, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn halt_returns_zero_via_full_dispatch() {
        let mut k = make_kernel();
        k.store.create("prog").unwrap();
        k.store.write_all("prog", &build_minimal_elf()).unwrap();
        let shell = k.scheduler.spawn("shell", crate::scheduler::PRI_DEFAULT);
        k.scheduler.set_current_for_test(shell);
        let child = k.spawn_process("prog");
        k.scheduler.set_current_for_test(child);

        // Recompute where the real initial stack lands the fake return
        // address, then overwrite it with a halt call: exercises the whole
        // argument-marshalling path, not just the handler body.
        let (_, argv) = stack::parse_command_line("prog").unwrap();
        let (_, esp_offset) = stack::build_initial_stack(&argv).unwrap();
        let esp = VAddr::new(crate::memory::PHYS_BASE - PAGE_SIZE + esp_offset);

        assert!(k.write_user_bytes(child, esp, &SYS_HALT.to_le_bytes(), esp));
        assert_eq!(k.dispatch(esp), Outcome::Value(0));
    }

    #[test]
    fn write_to_stdin_is_rejected() {
        let mut k = make_kernel();
        k.store.create("prog").unwrap();
        k.store.write_all("prog", &build_minimal_elf()).unwrap();
        let shell = k.scheduler.spawn("shell", crate::scheduler::PRI_DEFAULT);
        k.scheduler.set_current_for_test(shell);
        let child = k.spawn_process("prog");
        k.scheduler.set_current_for_test(child);

        let outcome = k.sys_write(child, STDIN_FD, VAddr::new(0x1000), 4, VAddr::new(0xBFFF_F000));
        // Writing to fd 0 is a user fault: the process is terminated.
        assert_eq!(outcome, Outcome::Value(-1));
    }

    #[test]
    fn mmap_rejects_std_fds_and_unaligned_addr() {
        let mut k = make_kernel();
        k.store.create("prog").unwrap();
        k.store.write_all("prog", &build_minimal_elf()).unwrap();
        let shell = k.scheduler.spawn("shell", crate::scheduler::PRI_DEFAULT);
        k.scheduler.set_current_for_test(shell);
        let child = k.spawn_process("prog");
        k.scheduler.set_current_for_test(child);

        assert_eq!(k.sys_mmap(child, STDOUT_FD, VAddr::new(0x20000)), Outcome::Value(-1));
        assert_eq!(k.sys_mmap(child, 2, VAddr::new(0x20001)), Outcome::Value(-1));
    }
}
