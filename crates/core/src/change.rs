//! In-place change mutators
//!
//! A [`ChangeSet`] is applied to a copy of an entry's fields. If any mutator
//! fails, the copy is dropped and the stored entry is left untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, SpaceError};
use crate::value::Value;

/// A single field mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutator {
    /// Replace (or add) a field value
    Set(String, Value),
    /// Remove a field
    Unset(String),
    /// Add a numeric delta; the field must exist and share the delta's type
    Increment(String, Value),
    /// Append to an array field (creates the array if missing)
    AddToCollection(String, Value),
    /// Remove every occurrence of a value from an array field
    RemoveFromCollection(String, Value),
}

impl Mutator {
    fn field(&self) -> &str {
        match self {
            Mutator::Set(f, _)
            | Mutator::Unset(f)
            | Mutator::Increment(f, _)
            | Mutator::AddToCollection(f, _)
            | Mutator::RemoveFromCollection(f, _) => f,
        }
    }

    fn apply(&self, fields: &mut BTreeMap<String, Value>) -> std::result::Result<(), String> {
        match self {
            Mutator::Set(field, value) => {
                fields.insert(field.clone(), value.clone());
                Ok(())
            }
            Mutator::Unset(field) => {
                fields.remove(field);
                Ok(())
            }
            Mutator::Increment(field, delta) => {
                let current = fields
                    .get(field)
                    .ok_or_else(|| "field is missing".to_string())?;
                let next = match (current, delta) {
                    (Value::Int(a), Value::Int(b)) => Value::Int(
                        a.checked_add(*b)
                            .ok_or_else(|| "integer overflow".to_string())?,
                    ),
                    (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                    (a, b) => {
                        return Err(format!(
                            "cannot increment {} by {}",
                            a.type_name(),
                            b.type_name()
                        ))
                    }
                };
                fields.insert(field.clone(), next);
                Ok(())
            }
            Mutator::AddToCollection(field, value) => {
                match fields.entry(field.clone()).or_insert_with(|| Value::Array(Vec::new())) {
                    Value::Array(items) => {
                        items.push(value.clone());
                        Ok(())
                    }
                    other => Err(format!("expected Array, found {}", other.type_name())),
                }
            }
            Mutator::RemoveFromCollection(field, value) => match fields.get_mut(field) {
                Some(Value::Array(items)) => {
                    items.retain(|v| v != value);
                    Ok(())
                }
                Some(other) => Err(format!("expected Array, found {}", other.type_name())),
                None => Err("field is missing".to_string()),
            },
        }
    }
}

/// Ordered list of mutators applied as one unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    mutators: Vec<Mutator>,
}

impl ChangeSet {
    /// Empty change set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `Set` mutator
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.mutators.push(Mutator::Set(field.into(), value.into()));
        self
    }

    /// Append an `Unset` mutator
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.mutators.push(Mutator::Unset(field.into()));
        self
    }

    /// Append an `Increment` mutator
    pub fn increment(mut self, field: impl Into<String>, delta: impl Into<Value>) -> Self {
        self.mutators.push(Mutator::Increment(field.into(), delta.into()));
        self
    }

    /// Append an `AddToCollection` mutator
    pub fn add_to_collection(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.mutators
            .push(Mutator::AddToCollection(field.into(), value.into()));
        self
    }

    /// Append a `RemoveFromCollection` mutator
    pub fn remove_from_collection(
        mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.mutators
            .push(Mutator::RemoveFromCollection(field.into(), value.into()));
        self
    }

    /// The mutators in application order
    pub fn mutators(&self) -> &[Mutator] {
        &self.mutators
    }

    /// Apply every mutator to a copy of `fields`
    ///
    /// Returns the new field map, or the first mutator error. The input is
    /// never modified.
    pub fn apply(&self, fields: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
        let mut working = fields.clone();
        for mutator in &self.mutators {
            mutator
                .apply(&mut working)
                .map_err(|reason| SpaceError::ChangeFailed {
                    field: mutator.field().to_string(),
                    reason,
                })?;
        }
        Ok(working)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fields() -> BTreeMap<String, Value> {
        let mut f = BTreeMap::new();
        f.insert("qty".to_string(), Value::Int(5));
        f.insert("name".to_string(), Value::from("widget"));
        f.insert("tags".to_string(), Value::Array(vec![Value::from("a")]));
        f
    }

    #[test]
    fn test_apply_all_mutators() {
        let changed = ChangeSet::new()
            .increment("qty", 2)
            .set("status", "OPEN")
            .unset("name")
            .add_to_collection("tags", "b")
            .remove_from_collection("tags", "a")
            .apply(&fields())
            .unwrap();
        assert_eq!(changed["qty"], Value::Int(7));
        assert_eq!(changed["status"], Value::from("OPEN"));
        assert!(!changed.contains_key("name"));
        assert_eq!(changed["tags"], Value::Array(vec![Value::from("b")]));
    }

    #[test]
    fn test_failure_leaves_input_untouched() {
        let original = fields();
        let err = ChangeSet::new()
            .set("status", "OPEN")
            .increment("name", 1)
            .apply(&original)
            .unwrap_err();
        assert!(matches!(err, SpaceError::ChangeFailed { ref field, .. } if field == "name"));
        assert_eq!(original, fields());
    }

    #[test]
    fn test_increment_overflow_is_an_error() {
        let mut f = BTreeMap::new();
        f.insert("n".to_string(), Value::Int(i64::MAX));
        assert!(ChangeSet::new().increment("n", 1).apply(&f).is_err());
    }

    #[test]
    fn test_add_to_collection_creates_array() {
        let changed = ChangeSet::new()
            .add_to_collection("history", 1)
            .apply(&BTreeMap::new())
            .unwrap();
        assert_eq!(changed["history"], Value::Array(vec![Value::Int(1)]));
    }

    proptest! {
        #[test]
        fn prop_increments_accumulate(
            start in -1_000i64..1_000,
            deltas in prop::collection::vec(-100i64..100, 0..16),
        ) {
            let mut f = BTreeMap::new();
            f.insert("n".to_string(), Value::Int(start));
            let changes = deltas
                .iter()
                .fold(ChangeSet::new(), |changes, delta| changes.increment("n", *delta));
            let changed = changes.apply(&f).unwrap();
            prop_assert_eq!(&changed["n"], &Value::Int(start + deltas.iter().sum::<i64>()));
        }

        #[test]
        fn prop_failed_change_returns_no_partial_result(value in any::<i64>(), label in "[a-z]{1,8}") {
            let mut f = BTreeMap::new();
            f.insert("n".to_string(), Value::Int(value));
            f.insert("label".to_string(), Value::from(label));
            let before = f.clone();
            let result = ChangeSet::new()
                .set("n", 0)
                .increment("label", 1)
                .apply(&f);
            prop_assert!(result.is_err());
            prop_assert_eq!(f, before);
        }
    }
}
