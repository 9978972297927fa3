//! Replication records
//!
//! Every accepted mutation is handed to the replication sink exactly once:
//! individually when it happens outside a transaction, or bundled into a
//! single [`Mutation::Transaction`] when its transaction prepares (two-phase)
//! or commits (one-phase).

use serde::{Deserialize, Serialize};

use crate::entry::EntryData;
use crate::types::{Uid, XtnId};

/// One mutation as seen by the replication layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// New entry
    Write {
        /// Written entry
        entry: EntryData,
    },
    /// Replaced or changed entry
    Update {
        /// New entry content
        entry: EntryData,
        /// Version before the update
        previous_version: u64,
    },
    /// Removed entry
    Take {
        /// Removed uid
        uid: Uid,
        /// Type of the removed entry
        type_name: String,
        /// Version at removal
        version: u64,
    },
    /// All mutations of one transaction
    Transaction {
        /// Transaction id
        xtn: XtnId,
        /// Mutations in the order they were applied
        mutations: Vec<Mutation>,
    },
}

impl Mutation {
    /// Uid affected by a single-entry mutation
    pub fn uid(&self) -> Option<&Uid> {
        match self {
            Mutation::Write { entry } | Mutation::Update { entry, .. } => Some(&entry.uid),
            Mutation::Take { uid, .. } => Some(uid),
            Mutation::Transaction { .. } => None,
        }
    }

    /// Number of single-entry mutations carried
    pub fn len(&self) -> usize {
        match self {
            Mutation::Transaction { mutations, .. } => mutations.len(),
            _ => 1,
        }
    }

    /// Whether a transaction record carries nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
