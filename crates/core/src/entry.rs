//! Entry data as seen by clients and by the matcher
//!
//! [`EntryPacket`] is what a client hands to write/update; [`EntryData`] is
//! the server-side, versioned value of a stored entry (or of one of its MVCC
//! generations). Lock ownership lives next to the data in the store, not in
//! these types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Timestamp, Uid, LEASE_FOREVER};
use crate::value::Value;

/// Versioned value of a stored entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryData {
    /// Unique id of the entry
    pub uid: Uid,
    /// Concrete type name
    pub type_name: String,
    /// Field values
    pub fields: BTreeMap<String, Value>,
    /// Version, starts at 1 and strictly increases on every update
    pub version: u64,
    /// Absolute expiration time in milliseconds
    pub expiration: Timestamp,
}

impl EntryData {
    /// Build the first version of an entry from a client packet
    pub fn from_packet(uid: Uid, packet: &EntryPacket, expiration: Timestamp) -> Self {
        Self {
            uid,
            type_name: packet.type_name.clone(),
            fields: packet.fields.clone(),
            version: 1,
            expiration,
        }
    }

    /// Field value by name
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Whether the entry never expires
    pub fn is_forever(&self) -> bool {
        self.expiration == LEASE_FOREVER
    }
}

/// Client-supplied entry for write and update operations
///
/// # Example
///
/// ```
/// use gridspace_core::entry::EntryPacket;
///
/// let packet = EntryPacket::new("Order")
///     .with_field("id", 17)
///     .with_field("status", "NEW");
/// assert_eq!(packet.type_name, "Order");
/// assert_eq!(packet.fields.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPacket {
    /// Type name of the entry
    pub type_name: String,
    /// Explicit uid (required for update, optional for write)
    pub uid: Option<Uid>,
    /// Field values
    pub fields: BTreeMap<String, Value>,
    /// Version known to the client; 0 means "unversioned"
    pub version: u64,
    /// Transient entries are never handed to persistence
    pub transient: bool,
}

impl EntryPacket {
    /// Create an empty packet of the given type
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            uid: None,
            fields: BTreeMap::new(),
            version: 0,
            transient: false,
        }
    }

    /// Set a field value
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set an explicit uid
    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Set the client-known version
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Mark the entry transient
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Build a packet that replaces the fields of an existing entry
    pub fn from_data(data: &EntryData) -> Self {
        Self {
            type_name: data.type_name.clone(),
            uid: Some(data.uid.clone()),
            fields: data.fields.clone(),
            version: data.version,
            transient: false,
        }
    }
}
