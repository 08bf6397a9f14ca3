//! Per-process memory-mapping table (spec.md §3/§4.8): keyed by mapid, each
//! entry records the user address range and the independent (reopened)
//! file handle backing it.

use super::VAddr;
use crate::fs::FileObject;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

pub struct MmapEntry {
    pub start_uaddr: VAddr,
    pub end_uaddr: VAddr,
    pub page_count: u32,
    pub file: Box<dyn FileObject>,
}

#[derive(Default)]
pub struct MmapTable {
    entries: BTreeMap<u32, MmapEntry>,
    next_mapid: u32,
}

impl MmapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: MmapEntry) -> u32 {
        let id = self.next_mapid;
        self.next_mapid += 1;
        self.entries.insert(id, entry);
        id
    }

    pub fn get(&self, mapid: u32) -> Option<&MmapEntry> {
        self.entries.get(&mapid)
    }

    pub fn remove(&mut self, mapid: u32) -> Option<MmapEntry> {
        self.entries.remove(&mapid)
    }

    pub fn mapids(&self) -> alloc::vec::Vec<u32> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemStore;

    #[test]
    fn monotonic_mapid_per_process() {
        let store = MemStore::new();
        store.create("f").unwrap();
        store.write_all("f", b"0123456789").unwrap();

        let mut table = MmapTable::new();
        let a = table.insert(MmapEntry {
            start_uaddr: VAddr::new(0x1000),
            end_uaddr: VAddr::new(0x2000),
            page_count: 1,
            file: Box::new(store.open("f").unwrap()),
        });
        let b = table.insert(MmapEntry {
            start_uaddr: VAddr::new(0x2000),
            end_uaddr: VAddr::new(0x3000),
            page_count: 1,
            file: Box::new(store.open("f").unwrap()),
        });
        assert!(b > a);
        assert!(table.get(a).is_some());
        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
    }
}
