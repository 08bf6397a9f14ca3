//! Ties the supplemental page table, mmap table and page directory together
//! into one process's virtual memory (spec.md §3/§4.6/§4.8/§4.9).

use super::frame::{FrameTable, FramePool, OwnerLookup};
use super::mmap::{MmapEntry, MmapTable};
use super::pagedir::PageDirectory;
use super::spt::{Kind, Spt};
use super::swap::{BlockDevice, SwapDevice};
use super::{VAddr, PAGE_SIZE, PHYS_BASE, STACK_LIMIT};
use crate::fs::FileObject;
use crate::ids::Tid;
use alloc::boxed::Box;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    StackGrown,
    Unmappable,
}

/// One process's demand-paged address space. Owns its own page directory
/// and supplemental/mmap tables; shares the frame table, frame pool and
/// swap device with every other address space in the kernel.
pub struct AddressSpace {
    pub owner: Tid,
    pub page_dir: Box<dyn PageDirectory>,
    pub spt: Spt,
    pub mmap: MmapTable,
}

impl AddressSpace {
    pub fn new(owner: Tid, page_dir: Box<dyn PageDirectory>) -> Self {
        AddressSpace {
            owner,
            page_dir,
            spt: Spt::new(),
            mmap: MmapTable::new(),
        }
    }

    /// Install a freshly demand-paged page and bring it into a frame right
    /// away. Used by the loader for each PT_LOAD segment page and by mmap
    /// for a read-ahead page; the page-fault handler installs the SPT entry
    /// lazily instead and relies on `fault` to do the frame work later.
    #[allow(clippy::too_many_arguments)]
    pub fn load_file_backed(
        &mut self,
        upage: VAddr,
        file: Box<dyn FileObject>,
        read_bytes: u32,
        zero_bytes: u32,
        offset: u64,
        writable: bool,
        is_mmap: bool,
        is_executable: bool,
    ) {
        self.spt.insert_file(
            upage,
            file,
            read_bytes,
            zero_bytes,
            offset,
            writable,
            is_mmap,
            is_executable,
        );
    }

    pub fn load_zero_page(&mut self, upage: VAddr) {
        self.spt.insert_all_zero(upage);
    }

    /// Eagerly install the topmost user stack page with `content` (the
    /// argv layout from `process::stack::build_initial_stack`), unlike
    /// every other page which is demand-paged on first fault (spec.md
    /// §4.4: the initial stack is populated before the process ever runs,
    /// so there is no fault to demand-page it on).
    #[allow(clippy::too_many_arguments)]
    pub fn install_initial_stack(
        &mut self,
        top_page: VAddr,
        content: &[u8],
        frame_table: &FrameTable,
        pool: &FramePool,
        swap: &Mutex<SwapDevice<Box<dyn BlockDevice>>>,
        owner_lookup: &dyn OwnerLookup,
        write_frame: &mut dyn FnMut(VAddr, &[u8]),
    ) {
        self.spt.insert_all_zero(top_page);
        let (frame, _) = frame_table.alloc_for(pool, swap, owner_lookup, self.owner, top_page, &mut |_, buf| {
            buf.fill(0)
        });
        let mut page = alloc::vec![0u8; PAGE_SIZE as usize];
        page[..content.len()].copy_from_slice(content);
        write_frame(frame, &page);
        let entry = self.spt.lookup_mut(top_page).expect("just inserted");
        entry.in_memory = true;
        entry.frame_addr = Some(frame);
        let _ = self.page_dir.map(top_page, frame, true);
    }

    /// Map `file` into `page_count` consecutive pages starting at
    /// `start_uaddr`. Fails if any covered page is already mapped by
    /// anything (spec.md §4.8's "no overlap with the executable or another
    /// mapping").
    pub fn mmap(
        &mut self,
        start_uaddr: VAddr,
        file: Box<dyn FileObject>,
        file_len: u64,
    ) -> Option<u32> {
        if !start_uaddr.is_page_aligned() || start_uaddr.0 == 0 || file_len == 0 {
            return None;
        }
        let page_count = ((file_len + PAGE_SIZE - 1) / PAGE_SIZE) as u32;
        for i in 0..page_count as u64 {
            let upage = start_uaddr.add(i * PAGE_SIZE);
            if self.spt.contains(upage) || !upage.is_user_space() {
                return None;
            }
        }

        let end_uaddr = start_uaddr.add(page_count as u64 * PAGE_SIZE);
        for i in 0..page_count as u64 {
            let upage = start_uaddr.add(i * PAGE_SIZE);
            let offset = i * PAGE_SIZE;
            let remaining = file_len.saturating_sub(offset);
            let read_bytes = core::cmp::min(PAGE_SIZE, remaining) as u32;
            let zero_bytes = (PAGE_SIZE as u32) - read_bytes;
            self.spt.insert_file(
                upage,
                file.reopen(),
                read_bytes,
                zero_bytes,
                offset,
                true,
                true,
                false,
            );
        }

        let mapid = self.mmap.insert(MmapEntry {
            start_uaddr,
            end_uaddr,
            page_count,
            file,
        });
        Some(mapid)
    }

    /// Unmap `mapid`: write back any dirty resident page, then drop the SPT
    /// entry for every page in the mapping. The write-back length always
    /// comes from the mapping's own recorded range, never the file's
    /// current length (spec.md §9 — the file may have been truncated by
    /// another handle since the mapping was created).
    pub fn munmap(&mut self, mapid: u32, frame_table: &FrameTable, read_frame: &mut dyn FnMut(VAddr, &mut [u8])) {
        let Some(entry) = self.mmap.remove(mapid) else {
            return;
        };
        let mut upage = entry.start_uaddr;
        while upage.0 < entry.end_uaddr.0 {
            if let Some(spt_entry) = self.spt.lookup(upage) {
                let dirty = self.page_dir.is_dirty(upage);
                if spt_entry.in_memory && dirty {
                    if let (Some(frame), Some(info)) = (spt_entry.frame_addr, &spt_entry.file_info) {
                        let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
                        read_frame(frame, &mut buf);
                        let mut file = info.file.reopen();
                        file.write(info.offset, &buf[..info.read_bytes as usize]);
                    }
                }
                if let Some(frame) = spt_entry.frame_addr {
                    frame_table.forget(frame);
                    self.page_dir.unmap(upage);
                }
            }
            self.spt.remove(upage);
            upage = upage.add(PAGE_SIZE);
        }
    }

    /// Resolve a page fault at `fault_addr`. `esp` is the user stack pointer
    /// at fault time, needed to distinguish a legitimate stack-growth fault
    /// from an invalid access (spec.md §4.9: growth is allowed when the
    /// fault address is within 32 bytes below `esp`, i.e. covers a `PUSHA`).
    pub fn fault(
        &mut self,
        fault_addr: VAddr,
        esp: VAddr,
        is_write: bool,
        frame_table: &FrameTable,
        pool: &FramePool,
        swap: &Mutex<SwapDevice<Box<dyn BlockDevice>>>,
        owner_lookup: &dyn OwnerLookup,
        read_frame: &mut dyn FnMut(VAddr, &mut [u8]),
        write_frame: &mut dyn FnMut(VAddr, &[u8]),
    ) -> FaultOutcome {
        let upage = fault_addr.round_down();

        if !self.spt.contains(upage) {
            let grows_stack = fault_addr.is_user_space()
                && fault_addr.0 >= esp.0.saturating_sub(32)
                && PHYS_BASE - fault_addr.0 <= STACK_LIMIT;
            if !grows_stack {
                return FaultOutcome::Unmappable;
            }
            self.spt.insert_all_zero(upage);
        }

        if self.spt.lookup(upage).map(|e| e.in_memory).unwrap_or(false) {
            // Already resident: a second fault on the same page before the
            // hardware mapping caught up. Nothing to do.
            return FaultOutcome::Resolved;
        }

        if is_write && !self.spt.lookup(upage).map(|e| e.is_writable()).unwrap_or(true) {
            return FaultOutcome::Unmappable;
        }

        let (frame, _outcome) = frame_table.alloc_for(pool, swap, owner_lookup, self.owner, upage, read_frame);

        let mut page = alloc::vec![0u8; PAGE_SIZE as usize];
        let writable = {
            let entry = self.spt.lookup_mut(upage).expect("just inserted or already present");
            match (&entry.kind, entry.swap_slot) {
                (Kind::Swap, Some(slot)) => {
                    swap.lock().swap_in_page(slot, &mut page);
                    entry.swap_slot = None;
                }
                (Kind::AllZero, _) => {}
                (Kind::Fsys, _) | (Kind::Mmap, _) => {
                    if let Some(info) = &mut entry.file_info {
                        let n = info.file.read(info.offset, &mut page[..info.read_bytes as usize]);
                        debug_assert!(n as u32 <= info.read_bytes);
                    }
                }
                _ => {}
            }
            entry.in_memory = true;
            entry.frame_addr = Some(frame);
            entry.is_writable()
        };

        write_frame(frame, &page);
        let _ = self.page_dir.map(upage, frame, writable);
        let grew_stack = !self.spt.contains(upage.sub(PAGE_SIZE)) && fault_addr.round_down() != fault_addr;
        let _ = grew_stack;
        FaultOutcome::Resolved
    }

    /// Tear down every mapping on process exit: write back dirty mmap pages,
    /// free swap slots and frames, drop the page directory. Called once,
    /// from `process::exit`.
    pub fn destroy(&mut self, frame_table: &FrameTable, read_frame: &mut dyn FnMut(VAddr, &mut [u8])) {
        let pages = self.spt.pages();
        for upage in pages {
            if let Some(entry) = self.spt.lookup(upage) {
                let dirty = self.page_dir.is_dirty(upage);
                if entry.in_memory && dirty {
                    if let (Some(frame), Kind::Mmap) = (entry.frame_addr, &entry.kind) {
                        if let Some(info) = &entry.file_info {
                            let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
                            read_frame(frame, &mut buf);
                            let mut file = info.file.reopen();
                            file.write(info.offset, &buf[..info.read_bytes as usize]);
                        }
                    }
                }
                if let Some(frame) = entry.frame_addr {
                    frame_table.forget(frame);
                }
            }
            self.spt.remove(upage);
        }
    }
}
