//! Disk-backed, single-writer B+Tree index engine.
//!
//! Two storage strategies share one generic core: the clustered tree keeps
//! fixed-length values inline in its leaves, the unclustered tree spills
//! variable-length values into an append-only data region of the same page
//! file and stores packed addresses instead. Node objects and raw pages
//! each get their own write-back LRU tier, so high-frequency node mutation
//! decouples from page-granular disk I/O, and evictions land on disk as
//! sorted, batched page writes.

mod cache;
mod meta;
mod node;
mod page;

pub mod alloc;
pub mod error;
pub mod options;
pub mod storage;
pub mod tree;
pub mod types;
pub mod values;

pub use error::{Error, Result};
pub use options::Options;
pub use storage::{DiskStorage, MemoryStorage, Storage};
pub use tree::{BPlusTree, ClusteredTree, Iter, ReverseIter, UnclusteredTree};
pub use types::{Key, KeyKind, Value, ValueKind};
pub use values::{Inline, Spill, ValueMode};
