//! Storage layer for the grid core
//!
//! This crate implements the entry store model:
//! - EntryCell/EntryHolder: per-entry lock, data, shadow, lock state
//! - Published snapshots for lock-free non-blocking reads
//! - MVCC generation chains and the visibility resolver
//! - TypeRegistry: single-inheritance type hierarchy
//! - EntryStore: uid map plus per-type shards with equality indexes
//! - ScanDriver: candidate ordering for one search attempt

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod holder;
pub mod mvcc;
pub mod registry;
pub mod scan;
pub mod sharded;

pub use holder::{EntryCell, EntryGuard, EntryHolder, EntrySnapshot};
pub use mvcc::{
    resolve_generation, resolve_shadow, resolve_visible, MvccGeneration, MvccShell, Resolved,
    Visibility,
};
pub use registry::{TypeDescriptor, TypeRegistry};
pub use scan::{Candidate, Scan, ScanDriver, ScanPolicy};
pub use sharded::{EntryStore, Inserted, TypeShard};
