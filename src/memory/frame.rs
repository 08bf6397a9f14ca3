//! The global frame table (spec.md §4.5) and the physical-frame pool it
//! draws from. Eviction uses the same second-chance clock sweep as
//! `vm/frame.c`'s `choose_frame_to_evict_snd_chance`: walk the table in
//! insertion-tick order, clearing the accessed bit and skipping any frame
//! that had it set, and pick the first one that didn't.

use super::pagedir::PageDirectory;
use super::spt::Kind;
use super::swap::SwapDevice;
use super::{Frame, VAddr, PAGE_SIZE};
use crate::ids::Tid;
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

/// One frame's worth of owner bookkeeping. `tick` is the frame table's own
/// logical clock, bumped each time a frame is inserted — it stands in for
/// the eviction sweep's notion of insertion order, not wall-clock time.
struct FrameEntry {
    frame: Frame,
    owner: Tid,
    upage: VAddr,
    tick: u64,
}

/// Lets the frame table reach into the owning thread's address space
/// without `memory` depending on `scheduler` directly (spec.md §9 "Arena +
/// index" applied across module boundaries too).
pub trait OwnerLookup {
    /// Run `f` with exclusive access to `owner`'s page directory and
    /// supplemental page table. Returns `None` if `owner` no longer exists
    /// (it exited between the frame being chosen and the lookup running).
    fn with_address_space<R>(
        &self,
        owner: Tid,
        f: &mut dyn FnMut(&mut dyn PageDirectory, &mut super::spt::Spt) -> R,
    ) -> Option<R>;
}

/// A simple free-list physical frame pool. Unlike the reference
/// implementation's pure bump allocator, frames here are both allocated and
/// freed throughout a process's life (demand paging frees frames on evict
/// and on process exit), so a free list is required rather than a
/// watermark.
pub struct FramePool {
    free: Mutex<Vec<Frame>>,
}

impl FramePool {
    /// Carve `count` frames out of a contiguous kernel region starting at
    /// `base`, each `PAGE_SIZE` apart. In the real kernel `base` would come
    /// from the boot memory map; tests hand it a plain scratch buffer
    /// address.
    pub fn new(base: u64, count: usize) -> Self {
        let free = (0..count)
            .map(|i| VAddr::new(base + (i as u64) * PAGE_SIZE))
            .collect();
        FramePool {
            free: Mutex::new(free),
        }
    }

    pub fn try_alloc(&self) -> Option<Frame> {
        self.free.lock().pop()
    }

    pub fn free(&self, frame: Frame) {
        self.free.lock().push(frame);
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// Why a frame allocation needed to evict, reported back to callers that
/// care (mostly tests and logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    Fresh,
    Evicted { victim_owner: Tid, victim_upage: VAddr },
}

/// Maps every in-use physical frame to the page and thread that owns it.
/// Guarded by its own lock, separate from the eviction lock (spec.md §5's
/// fixed order: frame table → eviction → swap → filesystem), so that a
/// second thread can still look up an unrelated frame while an eviction is
/// in flight.
pub struct FrameTable {
    entries: Mutex<Vec<FrameEntry>>,
    evict_lock: Mutex<()>,
    next_tick: Mutex<u64>,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable {
            entries: Mutex::new(Vec::new()),
            evict_lock: Mutex::new(()),
            next_tick: Mutex::new(0),
        }
    }

    fn bump_tick(&self) -> u64 {
        let mut t = self.next_tick.lock();
        let cur = *t;
        *t += 1;
        cur
    }

    pub fn record(&self, frame: Frame, owner: Tid, upage: VAddr) {
        let tick = self.bump_tick();
        self.entries.lock().push(FrameEntry {
            frame,
            owner,
            upage,
            tick,
        });
    }

    /// Drop the bookkeeping entry for `frame` without writing it back
    /// anywhere — used when a frame is freed outright (process exit tears
    /// down its own mappings first).
    pub fn forget(&self, frame: Frame) {
        self.entries.lock().retain(|e| e.frame != frame);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a frame for `owner`/`upage`, evicting the second-chance
    /// victim if the pool is empty. On success the returned frame is
    /// already recorded as belonging to `owner`/`upage`.
    pub fn alloc_for(
        &self,
        pool: &FramePool,
        swap: &Mutex<SwapDevice<Box<dyn super::swap::BlockDevice>>>,
        owner_lookup: &dyn OwnerLookup,
        owner: Tid,
        upage: VAddr,
        read_frame: &mut dyn FnMut(Frame, &mut [u8]),
    ) -> (Frame, AllocOutcome) {
        if let Some(frame) = pool.try_alloc() {
            self.record(frame, owner, upage);
            return (frame, AllocOutcome::Fresh);
        }

        let _guard = self.evict_lock.lock();
        // Someone may have freed a frame while we waited for the eviction
        // lock; re-check before paying the cost of a sweep.
        if let Some(frame) = pool.try_alloc() {
            self.record(frame, owner, upage);
            return (frame, AllocOutcome::Fresh);
        }

        let (victim_index, victim_owner, victim_upage, victim_frame) =
            self.choose_victim(owner_lookup);
        self.save_frame(
            owner_lookup,
            victim_owner,
            victim_upage,
            victim_frame,
            swap,
            read_frame,
        );
        self.entries.lock().remove(victim_index);
        self.record(victim_frame, owner, upage);
        (
            victim_frame,
            AllocOutcome::Evicted {
                victim_owner,
                victim_upage,
            },
        )
    }

    /// Second-chance clock sweep: sort by insertion tick ascending, walk
    /// from the front, clearing the accessed bit and skipping any page that
    /// had it set, wrapping once if the sweep reaches the end without
    /// finding a victim. Mirrors `vm/frame.c` exactly rather than
    /// maintaining a persistent clock-hand index, which keeps this
    /// deterministic to test.
    fn choose_victim(&self, owner_lookup: &dyn OwnerLookup) -> (usize, Tid, VAddr, Frame) {
        let mut entries = self.entries.lock();
        assert!(!entries.is_empty(), "eviction requested with no frames in use");
        entries.sort_by_key(|e| e.tick);

        let n = entries.len();
        for pass in 0..2 {
            for i in 0..n {
                let (owner, upage) = (entries[i].owner, entries[i].upage);
                let accessed = owner_lookup
                    .with_address_space(owner, &mut |pd, _spt| pd.is_accessed(upage))
                    .unwrap_or(false);
                if accessed && pass == 0 {
                    owner_lookup.with_address_space(owner, &mut |pd, _spt| pd.clear_accessed(upage));
                    continue;
                }
                let frame = entries[i].frame;
                return (i, owner, upage, frame);
            }
        }
        // Every entry's owner vanished mid-sweep (all lookups returned
        // None): fall back to evicting the oldest entry outright.
        let frame = entries[0].frame;
        (0, entries[0].owner, entries[0].upage, frame)
    }

    /// Write the victim's content out before its frame is handed to a new
    /// owner. Matches `vm/frame.c`'s `save_frame`: a dirty `Mmap` page is
    /// written back to its file; a writable `Fsys` page (a process's own
    /// data/bss segment, loaded from a deny-write executable it cannot be
    /// written back into) is upgraded to `Swap` (one-way — spec.md §9)
    /// before either `Swap` or `AllZero` pages are written to the swap
    /// device.
    fn save_frame(
        &self,
        owner_lookup: &dyn OwnerLookup,
        owner: Tid,
        upage: VAddr,
        frame: Frame,
        swap: &Mutex<SwapDevice<Box<dyn super::swap::BlockDevice>>>,
        read_frame: &mut dyn FnMut(Frame, &mut [u8]),
    ) {
        let mut page = alloc::vec![0u8; PAGE_SIZE as usize];
        read_frame(frame, &mut page);

        owner_lookup.with_address_space(owner, &mut |pd, spt| {
            let dirty = pd.is_dirty(upage);
            if let Some(entry) = spt.lookup_mut(upage) {
                if dirty {
                    if let Kind::Mmap = entry.kind {
                        if let Some(info) = &mut entry.file_info {
                            let len = info.read_bytes as u64;
                            info.file.write(info.offset, &page[..len as usize]);
                            entry.in_memory = false;
                            entry.frame_addr = None;
                            pd.unmap(upage);
                            return;
                        }
                    }
                }

                if let Kind::Fsys = entry.kind {
                    if entry.is_writable() {
                        entry.kind = Kind::Swap;
                        entry.file_info = None;
                    }
                }

                match entry.kind {
                    Kind::Swap | Kind::AllZero => {
                        let slot = swap.lock().swap_out_page(&page);
                        entry.swap_slot = Some(slot);
                        entry.kind = Kind::Swap;
                    }
                    _ => {}
                }

                entry.in_memory = false;
                entry.frame_addr = None;
            }
            pd.unmap(upage);
        });
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}
