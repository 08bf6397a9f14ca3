//! A minimal in-memory object store implementing `FileObject`/open, used in
//! tests and as the reference backing when no real on-disk filesystem is
//! wired in. Deliberately simple — the real filesystem is out of scope
//! (spec.md §1); this exists only so the loader, mmap, and syscall paths
//! have something concrete to open/read/write/reopen against.

use super::object::{FileObject, FsError, FsResult};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

struct Entry {
    data: Mutex<Vec<u8>>,
}

/// A shared, named collection of byte blobs — the "disk" `open()` resolves
/// against.
#[derive(Clone)]
pub struct MemStore {
    files: Arc<Mutex<BTreeMap<String, Arc<Entry>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            files: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn create(&self, name: &str) -> FsResult<()> {
        let mut files = self.files.lock();
        if files.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        files.insert(
            String::from(name),
            Arc::new(Entry {
                data: Mutex::new(Vec::new()),
            }),
        );
        Ok(())
    }

    pub fn write_all(&self, name: &str, data: &[u8]) -> FsResult<()> {
        let files = self.files.lock();
        let entry = files.get(name).ok_or(FsError::NotFound)?;
        *entry.data.lock() = data.to_vec();
        Ok(())
    }

    pub fn remove(&self, name: &str) -> FsResult<()> {
        self.files.lock().remove(name).map(|_| ()).ok_or(FsError::NotFound)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    /// Resolve `name` to a fresh handle. Multiple `open()` calls on the same
    /// name yield independent `StoreFile` handles over the same bytes.
    pub fn open(&self, name: &str) -> FsResult<StoreFile> {
        let files = self.files.lock();
        let entry = files.get(name).cloned().ok_or(FsError::NotFound)?;
        Ok(StoreFile { entry })
    }
}

pub struct StoreFile {
    entry: Arc<Entry>,
}

impl FileObject for StoreFile {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.entry.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = core::cmp::min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> usize {
        let mut data = self.entry.data.lock();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }

    fn len(&self) -> u64 {
        self.entry.data.lock().len() as u64
    }

    fn reopen(&self) -> Box<dyn FileObject> {
        Box::new(StoreFile {
            entry: self.entry.clone(),
        })
    }
}
