//! The filesystem boundary: a black-box object store (spec.md §1). The
//! real on-disk filesystem is out of scope; this module only carries the
//! `FileObject` trait the rest of the core depends on, plus a minimal
//! in-memory reference store for tests/demos.

pub mod mem_store;
pub mod object;

pub use mem_store::MemStore;
pub use object::{FileObject, FsError, FsResult};
