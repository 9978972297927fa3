//! Core identifier types for the grid core
//!
//! This module defines the identifiers used throughout the system:
//! - [`Uid`]: Unique identity of a stored entry
//! - [`XtnId`]: Identity of a transaction
//! - [`TemplateHandle`]: Generation-checked handle into the template arena
//! - [`Timestamp`]: Absolute wall-clock time in milliseconds

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::value::Value;

/// Absolute time in milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Expiration value meaning "never expires"
pub const LEASE_FOREVER: Timestamp = i64::MAX;

/// MVCC generation number handed out by the generation coordinator
pub type Generation = u64;

/// Unique identifier of an entry
///
/// A Uid is either supplied by the client, derived from the entry's type
/// and id property (so that by-id lookups are O(1)), or auto-generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(String);

impl Uid {
    /// Wrap an explicit uid string
    pub fn new(uid: impl Into<String>) -> Self {
        Uid(uid.into())
    }

    /// Generate a fresh random uid (UUID v4)
    ///
    /// # Examples
    ///
    /// ```
    /// use gridspace_core::types::Uid;
    ///
    /// let a = Uid::generate();
    /// let b = Uid::generate();
    /// assert_ne!(a, b);
    /// ```
    pub fn generate() -> Self {
        Uid(Uuid::new_v4().to_string())
    }

    /// Derive the uid of an entry from its type and id property value
    ///
    /// Two entries of the same type with equal id values always map to the
    /// same uid, which is what makes write-after-write detection and
    /// by-id lookups work without scanning.
    ///
    /// # Examples
    ///
    /// ```
    /// use gridspace_core::types::Uid;
    /// use gridspace_core::value::Value;
    ///
    /// let a = Uid::from_id("Order", &Value::Int(7));
    /// let b = Uid::from_id("Order", &Value::Int(7));
    /// assert_eq!(a, b);
    /// assert_ne!(a, Uid::from_id("Invoice", &Value::Int(7)));
    /// ```
    pub fn from_id(type_name: &str, id: &Value) -> Self {
        Uid(format!("{}^{}", type_name, id.to_key_string()))
    }

    /// Borrow the uid as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Uid(s.to_string())
    }
}

/// Transaction identifier
///
/// Allocated by the transaction table; unique for the lifetime of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct XtnId(pub u64);

impl fmt::Display for XtnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xtn-{}", self.0)
    }
}

/// Handle into the template arena
///
/// The `generation` field is bumped every time the arena slot is reused,
/// so a stale handle held by an entry's waiting list can never resolve to
/// a different, newer template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateHandle {
    /// Slot index in the arena
    pub index: u32,
    /// Slot generation at the time the handle was issued
    pub generation: u32,
}

impl fmt::Display for TemplateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmpl-{}.{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_uids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(Uid::generate()));
        }
    }

    #[test]
    fn test_uid_from_id_is_type_scoped() {
        let a = Uid::from_id("Order", &Value::from("A-1"));
        let b = Uid::from_id("Order", &Value::from("A-1"));
        let c = Uid::from_id("Trade", &Value::from("A-1"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("Order^"));
    }

    #[test]
    fn test_uid_from_id_distinguishes_value_types() {
        let int_uid = Uid::from_id("Order", &Value::Int(1));
        let str_uid = Uid::from_id("Order", &Value::from("1"));
        assert_ne!(int_uid, str_uid);
    }

    #[test]
    fn test_xtn_id_display() {
        assert_eq!(XtnId(42).to_string(), "xtn-42");
    }

    #[test]
    fn test_template_handle_generation_distinguishes() {
        let a = TemplateHandle { index: 3, generation: 1 };
        let b = TemplateHandle { index: 3, generation: 2 };
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "tmpl-3.1");
    }
}
