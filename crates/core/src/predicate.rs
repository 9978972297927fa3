//! Match predicates for template scans
//!
//! A [`Predicate`] is a conjunction of field conditions. The empty predicate
//! matches every entry of the template's type (and its subtypes).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::entry::EntryData;
use crate::value::Value;

/// Comparison applied by a single condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Field equals value
    Eq,
    /// Field differs from value (or is missing)
    Ne,
    /// Field strictly less than value
    Lt,
    /// Field less than or equal to value
    Le,
    /// Field strictly greater than value
    Gt,
    /// Field greater than or equal to value
    Ge,
    /// Field missing or null
    IsNull,
    /// Field present and not null
    NotNull,
}

/// One `field <op> value` condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    /// Field name
    pub field: String,
    /// Comparison
    pub op: CompareOp,
    /// Operand (ignored by `IsNull`/`NotNull`)
    pub value: Value,
}

impl FieldCondition {
    fn matches(&self, data: &EntryData) -> bool {
        let actual = data.get(&self.field);
        match self.op {
            CompareOp::IsNull => actual.map_or(true, Value::is_null),
            CompareOp::NotNull => actual.map_or(false, |v| !v.is_null()),
            CompareOp::Eq => actual == Some(&self.value),
            CompareOp::Ne => actual != Some(&self.value),
            CompareOp::Lt => ordered(actual, &self.value, |o| o == Ordering::Less),
            CompareOp::Le => ordered(actual, &self.value, |o| o != Ordering::Greater),
            CompareOp::Gt => ordered(actual, &self.value, |o| o == Ordering::Greater),
            CompareOp::Ge => ordered(actual, &self.value, |o| o != Ordering::Less),
        }
    }
}

fn ordered(actual: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    actual
        .and_then(|v| v.compare(operand))
        .map_or(false, accept)
}

/// Conjunction of field conditions
///
/// # Example
///
/// ```
/// use gridspace_core::predicate::Predicate;
///
/// let p = Predicate::all().eq("status", "NEW").gt("qty", 10);
/// assert_eq!(p.conditions().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    conditions: Vec<FieldCondition>,
}

impl Predicate {
    /// Predicate matching everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a condition
    pub fn and(mut self, field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        self.conditions.push(FieldCondition {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Add an equality condition
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(field, CompareOp::Eq, value)
    }

    /// Add a greater-than condition
    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(field, CompareOp::Gt, value)
    }

    /// Add a less-than condition
    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(field, CompareOp::Lt, value)
    }

    /// The conditions of this predicate
    pub fn conditions(&self) -> &[FieldCondition] {
        &self.conditions
    }

    /// Whether this predicate has no conditions
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// First equality condition on one of the given fields
    ///
    /// Used by the scan driver to pick an equality index.
    pub fn equality_on<'a>(&'a self, indexed: &[String]) -> Option<&'a FieldCondition> {
        self.conditions
            .iter()
            .find(|c| c.op == CompareOp::Eq && indexed.iter().any(|f| f == &c.field))
    }

    /// Evaluate against entry data
    pub fn matches(&self, data: &EntryData) -> bool {
        self.conditions.iter().all(|c| c.matches(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryPacket;
    use crate::types::{Uid, LEASE_FOREVER};

    fn order(qty: i64, status: &str) -> EntryData {
        let packet = EntryPacket::new("Order")
            .with_field("qty", qty)
            .with_field("status", status);
        EntryData::from_packet(Uid::generate(), &packet, LEASE_FOREVER)
    }

    #[test]
    fn test_empty_predicate_matches_everything() {
        assert!(Predicate::all().matches(&order(1, "NEW")));
    }

    #[test]
    fn test_conjunction() {
        let p = Predicate::all().eq("status", "NEW").gt("qty", 5);
        assert!(p.matches(&order(6, "NEW")));
        assert!(!p.matches(&order(5, "NEW")));
        assert!(!p.matches(&order(6, "DONE")));
    }

    #[test]
    fn test_missing_field_semantics() {
        let data = order(1, "NEW");
        assert!(Predicate::all().and("price", CompareOp::IsNull, Value::Null).matches(&data));
        assert!(!Predicate::all().and("price", CompareOp::NotNull, Value::Null).matches(&data));
        assert!(Predicate::all().and("price", CompareOp::Ne, 3).matches(&data));
        assert!(!Predicate::all().lt("price", 3).matches(&data));
    }

    #[test]
    fn test_equality_on_indexed_field() {
        let p = Predicate::all().gt("qty", 1).eq("status", "NEW");
        let indexed = vec!["status".to_string()];
        assert_eq!(p.equality_on(&indexed).map(|c| c.field.as_str()), Some("status"));
        assert!(p.equality_on(&["qty".to_string()]).is_none());
    }
}
