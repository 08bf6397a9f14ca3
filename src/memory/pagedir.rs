//! The page-directory collaborator interface.
//!
//! A `PageDirectory` owns exactly one process's address space mappings. The
//! real MMU-programming implementation lives outside this crate (per
//! spec.md §1, segment/descriptor tables and low-level paging structures are
//! external collaborators); everything here is specified only at the points
//! the core touches it: install/clear a mapping, read/clear the hardware
//! accessed/dirty bits the evictor and `munmap` rely on, and activate the
//! address space on a context switch.

use super::VAddr;
use alloc::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// The backing physical frame pool is exhausted (distinct from the
    /// frame-table's own eviction path — this is a lower-level mapping
    /// failure, e.g. no page-table page could be allocated).
    OutOfMemory,
    AlreadyMapped,
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagingError::OutOfMemory => write!(f, "no memory to extend page tables"),
            PagingError::AlreadyMapped => write!(f, "page already mapped"),
        }
    }
}

pub trait PageDirectory: Send {
    /// Install `upage -> kpage`, writable iff `writable`. Overwrites any
    /// existing mapping for `upage`.
    fn map(&mut self, upage: VAddr, kpage: VAddr, writable: bool) -> Result<(), PagingError>;

    /// Remove the mapping for `upage`, if any.
    fn unmap(&mut self, upage: VAddr);

    /// Whether `upage` currently has a present mapping.
    fn is_present(&self, upage: VAddr) -> bool;

    /// The kernel frame address `upage` is mapped to, if present.
    fn translate(&self, upage: VAddr) -> Option<VAddr>;

    /// The hardware dirty bit for `upage` (false if unmapped).
    fn is_dirty(&self, upage: VAddr) -> bool;

    /// The hardware accessed bit for `upage` (false if unmapped).
    fn is_accessed(&self, upage: VAddr) -> bool;

    fn clear_accessed(&mut self, upage: VAddr);

    fn clear_dirty(&mut self, upage: VAddr);

    /// Make this the active address space (load the MMU root register).
    fn activate(&self);

    /// Downcast hook for tests that need to drive a concrete mock's
    /// test-only helpers (e.g. `MockPageDirectory::simulate_access`) through
    /// a `Box<dyn PageDirectory>`.
    fn as_any_mut(&mut self) -> &mut dyn core::any::Any;
}

/// An in-memory `PageDirectory` used in tests and as a reference
/// implementation: mappings, dirty bits and accessed bits are plain maps
/// rather than real page-table walks.
#[derive(Default)]
pub struct MockPageDirectory {
    entries: alloc::collections::BTreeMap<u64, MockEntry>,
}

struct MockEntry {
    kpage: VAddr,
    writable: bool,
    dirty: bool,
    accessed: bool,
}

impl MockPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/demo helper: simulate a CPU write to `upage`, setting the dirty
    /// and accessed bits the way real hardware would.
    pub fn simulate_access(&mut self, upage: VAddr, is_write: bool) {
        if let Some(e) = self.entries.get_mut(&upage.0) {
            e.accessed = true;
            if is_write {
                e.dirty = true;
            }
        }
    }

    pub fn is_writable(&self, upage: VAddr) -> bool {
        self.entries.get(&upage.0).map(|e| e.writable).unwrap_or(false)
    }
}

impl PageDirectory for MockPageDirectory {
    fn map(&mut self, upage: VAddr, kpage: VAddr, writable: bool) -> Result<(), PagingError> {
        self.entries.insert(
            upage.0,
            MockEntry {
                kpage,
                writable,
                dirty: false,
                accessed: false,
            },
        );
        Ok(())
    }

    fn unmap(&mut self, upage: VAddr) {
        self.entries.remove(&upage.0);
    }

    fn is_present(&self, upage: VAddr) -> bool {
        self.entries.contains_key(&upage.0)
    }

    fn translate(&self, upage: VAddr) -> Option<VAddr> {
        self.entries.get(&upage.0).map(|e| e.kpage)
    }

    fn is_dirty(&self, upage: VAddr) -> bool {
        self.entries.get(&upage.0).map(|e| e.dirty).unwrap_or(false)
    }

    fn is_accessed(&self, upage: VAddr) -> bool {
        self.entries.get(&upage.0).map(|e| e.accessed).unwrap_or(false)
    }

    fn clear_accessed(&mut self, upage: VAddr) {
        if let Some(e) = self.entries.get_mut(&upage.0) {
            e.accessed = false;
        }
    }

    fn clear_dirty(&mut self, upage: VAddr) {
        if let Some(e) = self.entries.get_mut(&upage.0) {
            e.dirty = false;
        }
    }

    fn activate(&self) {}

    fn as_any_mut(&mut self) -> &mut dyn core::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_translate_and_unmap() {
        let mut pd = MockPageDirectory::new();
        let up = VAddr::new(0x1000);
        let kp = VAddr::new(0x5000);
        pd.map(up, kp, true).unwrap();
        assert!(pd.is_present(up));
        assert_eq!(pd.translate(up), Some(kp));
        pd.unmap(up);
        assert!(!pd.is_present(up));
    }

    #[test]
    fn accessed_and_dirty_bits() {
        let mut pd = MockPageDirectory::new();
        let up = VAddr::new(0x2000);
        pd.map(up, VAddr::new(0x9000), true).unwrap();
        assert!(!pd.is_accessed(up));
        pd.simulate_access(up, false);
        assert!(pd.is_accessed(up));
        assert!(!pd.is_dirty(up));
        pd.simulate_access(up, true);
        assert!(pd.is_dirty(up));
        pd.clear_accessed(up);
        pd.clear_dirty(up);
        assert!(!pd.is_accessed(up));
        assert!(!pd.is_dirty(up));
    }
}
