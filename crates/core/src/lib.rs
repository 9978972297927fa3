//! Core types for the grid core
//!
//! This crate defines the data model shared by every other crate:
//! - Identifiers (uids, transactions, template handles)
//! - Entry values and client packets
//! - The template / operation descriptor
//! - The error taxonomy
//! - Space configuration
//! - Collaborator traits (persistence, replication, leases, MVCC
//!   generations, filters) and their in-process defaults

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod change;
pub mod config;
pub mod entry;
pub mod error;
pub mod local;
pub mod mutation;
pub mod operation;
pub mod predicate;
pub mod template;
pub mod traits;
pub mod types;
pub mod value;

pub use change::{ChangeSet, Mutator};
pub use config::SpaceConfig;
pub use entry::{EntryData, EntryPacket};
pub use error::{ErrorKind, Result, SpaceError};
pub use mutation::Mutation;
pub use operation::{Modifiers, OperationKind, UpdateSource};
pub use predicate::{CompareOp, FieldCondition, Predicate};
pub use template::{Selector, Template, TemplatePayload};
pub use traits::{
    EntryPersistence, FilterContext, GenerationCoordinator, GenerationState, LeaseOracle,
    OperationFilter, ReplicationSink,
};
pub use types::{Generation, TemplateHandle, Timestamp, Uid, XtnId, LEASE_FOREVER};
pub use value::Value;
