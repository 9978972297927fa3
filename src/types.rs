//! Public types for the gridspace API.
//!
//! This module re-exports types from internal crates with a clean public interface.

// Entry model
pub use gridspace_core::{EntryData, EntryPacket, Uid, Value, XtnId, LEASE_FOREVER};

// Templates
pub use gridspace_core::{
    ChangeSet, CompareOp, Modifiers, Mutator, OperationKind, Predicate, Selector, Template,
    UpdateSource,
};

// Configuration and collaborators
pub use gridspace_core::local::{
    LocalGenerationCoordinator, ManualClock, MemoryPersistence, NoPersistence, NoReplication,
    RecordingReplication, SystemLeases,
};
pub use gridspace_core::{
    EntryPersistence, FilterContext, GenerationCoordinator, GenerationState, LeaseOracle,
    Mutation, OperationFilter, ReplicationSink, SpaceConfig,
};

// Types
pub use gridspace_storage::TypeDescriptor;

// Results
pub use gridspace_engine::{Applied, SpaceStats, UpdateOrWriteResult, UpdateResult, WriteResult};
