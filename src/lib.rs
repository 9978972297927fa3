//! # gridspace
//!
//! Transaction-aware entry matching for an in-memory data grid node.
//!
//! A space stores typed entries (named fields plus a uid, version and
//! lease). Clients write entries and match them back with templates: read
//! copies a match, take removes it, update and change modify it. Operations
//! can run inside transactions, wait for a match to appear, and see entries
//! through MVCC generations or in FIFO order.
//!
//! ## Quick Start
//!
//! ```ignore
//! use gridspace::prelude::*;
//!
//! let space = GridSpace::builder()
//!     .register_type(TypeDescriptor::new("Task").id_property("id").index("state"))
//!     .open()?;
//!
//! space.write(EntryPacket::new("Task").with_field("id", 1).with_field("state", "new"))?;
//!
//! // Wait up to a second for a new task and claim it
//! let task = space.take_blocking(
//!     Selector::matching("Task", Predicate::all().eq("state", "new")),
//!     Duration::from_secs(1),
//! )?;
//!
//! // Transactional hand-off
//! space.transaction(|txn| {
//!     txn.write(EntryPacket::new("Task").with_field("id", 1).with_field("state", "done"))?;
//!     Ok(())
//! })?;
//! ```
//!
//! ## Layers
//!
//! - [`gridspace_core`] - data model, templates, errors, configuration
//! - [`gridspace_concurrency`] - transactions, entry locks, conflict rules, FIFO
//! - [`gridspace_storage`] - entry store, MVCC chains, type registry, scans
//! - [`gridspace_engine`] - operation executor, waiting templates, termination

#![warn(missing_docs)]

mod error;
mod space;
mod transaction;
mod types;

pub mod prelude;

pub use error::{Error, Result};
pub use space::{GridSpace, GridSpaceBuilder};
pub use transaction::Transaction;

pub use types::*;
