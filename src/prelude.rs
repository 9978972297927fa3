//! Convenient imports for gridspace.
//!
//! ```ignore
//! use gridspace::prelude::*;
//!
//! let space = GridSpace::new()?;
//! space.write(EntryPacket::new("Task").with_field("state", "new"))?;
//! ```

// Main entry points
pub use crate::space::{GridSpace, GridSpaceBuilder};
pub use crate::transaction::Transaction;

// Error handling
pub use crate::error::{Error, Result};

// Entries and templates
pub use crate::types::{
    ChangeSet, EntryData, EntryPacket, Modifiers, Predicate, Selector, Template, TypeDescriptor,
    Uid, UpdateSource, Value,
};

// Results
pub use crate::types::{UpdateOrWriteResult, UpdateResult, WriteResult};

pub use std::time::Duration;
