//! The supplemental page table (spec.md §4.6 / §3): per-process map from a
//! user page address to the source of that page's content.

use super::VAddr;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use crate::fs::FileObject;

/// Where a page's content comes from. A sum type, not a set of booleans
/// that could disagree (spec.md §9 "Tagged variants").
pub enum Kind {
    AllZero,
    Swap,
    Fsys,
    Mmap,
}

/// Backing-file details, valid when `kind` is `Fsys` or `Mmap`.
pub struct FileInfo {
    pub file: Box<dyn FileObject>,
    pub offset: u64,
    pub read_bytes: u32,
    pub zero_bytes: u32,
    pub writable: bool,
    pub is_executable: bool,
}

pub struct SptEntry {
    pub vaddr: VAddr,
    pub frame_addr: Option<VAddr>,
    pub in_memory: bool,
    pub kind: Kind,
    pub swap_slot: Option<usize>,
    pub file_info: Option<FileInfo>,
}

impl SptEntry {
    fn all_zero(vaddr: VAddr) -> Self {
        SptEntry {
            vaddr,
            frame_addr: None,
            in_memory: false,
            kind: Kind::AllZero,
            swap_slot: None,
            file_info: None,
        }
    }

    fn file_backed(vaddr: VAddr, kind: Kind, info: FileInfo) -> Self {
        SptEntry {
            vaddr,
            frame_addr: None,
            in_memory: false,
            kind,
            swap_slot: None,
            file_info: Some(info),
        }
    }

    /// Whether this page is writable as far as the loader/mmap source is
    /// concerned (zero-fill pages are always writable).
    pub fn is_writable(&self) -> bool {
        match &self.file_info {
            Some(info) => info.writable,
            None => true,
        }
    }
}

/// Per-process supplemental page table.
#[derive(Default)]
pub struct Spt {
    entries: BTreeMap<u64, SptEntry>,
}

impl Spt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, upage: VAddr) -> Option<&SptEntry> {
        self.entries.get(&upage.0)
    }

    pub fn lookup_mut(&mut self, upage: VAddr) -> Option<&mut SptEntry> {
        self.entries.get_mut(&upage.0)
    }

    pub fn contains(&self, upage: VAddr) -> bool {
        self.entries.contains_key(&upage.0)
    }

    pub fn remove(&mut self, upage: VAddr) -> Option<SptEntry> {
        self.entries.remove(&upage.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &SptEntry)> {
        self.entries.iter()
    }

    pub fn pages(&self) -> alloc::vec::Vec<VAddr> {
        self.entries.keys().map(|&a| VAddr::new(a)).collect()
    }

    /// Reading faults yield a freshly zeroed frame; writable.
    pub fn insert_all_zero(&mut self, upage: VAddr) {
        self.entries.insert(upage.0, SptEntry::all_zero(upage));
    }

    /// Reading faults read `read_bytes` from `file` at `offset` into a
    /// frame, then zero the tail `zero_bytes`.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_file(
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
        let kind = if is_mmap { Kind::Mmap } else { Kind::Fsys };
        let info = FileInfo {
            file,
            offset,
            read_bytes,
            zero_bytes,
            writable,
            is_executable,
        };
        self.entries
            .insert(upage.0, SptEntry::file_backed(upage, kind, info));
    }

    /// Created by eviction, not the loader — installs a swap-backed entry
    /// directly (used when an evicted page had nowhere else to go).
    pub fn insert_swap(&mut self, upage: VAddr, slot: usize) {
        self.entries.insert(
            upage.0,
            SptEntry {
                vaddr: upage,
                frame_addr: None,
                in_memory: false,
                kind: Kind::Swap,
                swap_slot: Some(slot),
                file_info: None,
            },
        );
    }
}
