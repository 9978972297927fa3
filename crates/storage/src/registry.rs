//! Type registry
//!
//! Types form a single-inheritance hierarchy. A template on a type matches
//! entries of that type and of every type assignable to it. Types that were
//! never registered are introduced as root types on first write.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use gridspace_core::{Result, SpaceError};

/// Declared shape of an entry type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Type name
    pub name: String,
    /// Parent type, if any
    pub super_type: Option<String>,
    /// Entries of this type may be consumed in FIFO order
    pub fifo: bool,
    /// Field whose value derives the uid
    pub id_property: Option<String>,
    /// Field used to route the entry to a partition
    pub routing_property: Option<String>,
    /// Fields with an equality index
    pub indexes: Vec<String>,
}

impl TypeDescriptor {
    /// Root type with no properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_type: None,
            fifo: false,
            id_property: None,
            routing_property: None,
            indexes: Vec::new(),
        }
    }

    /// Set the parent type
    pub fn extends(mut self, super_type: impl Into<String>) -> Self {
        self.super_type = Some(super_type.into());
        self
    }

    /// Enable FIFO support
    pub fn fifo(mut self) -> Self {
        self.fifo = true;
        self
    }

    /// Set the id property
    pub fn id_property(mut self, field: impl Into<String>) -> Self {
        self.id_property = Some(field.into());
        self
    }

    /// Set the routing property
    pub fn routing_property(mut self, field: impl Into<String>) -> Self {
        self.routing_property = Some(field.into());
        self
    }

    /// Add an equality index
    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }
}

#[derive(Debug, Default)]
struct Registry {
    types: FxHashMap<String, Arc<TypeDescriptor>>,
    children: FxHashMap<String, Vec<String>>,
}

/// All known types of a space
#[derive(Debug, Default)]
pub struct TypeRegistry {
    inner: RwLock<Registry>,
}

impl TypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type
    ///
    /// The parent must already be known. Re-registering an identical
    /// descriptor is a no-op; a different one is rejected.
    pub fn register(&self, descriptor: TypeDescriptor) -> Result<Arc<TypeDescriptor>> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.types.get(&descriptor.name) {
            if **existing == descriptor {
                return Ok(Arc::clone(existing));
            }
            return Err(SpaceError::InvalidOperation(format!(
                "type {} already registered with a different descriptor",
                descriptor.name
            )));
        }
        if let Some(parent) = &descriptor.super_type {
            if !inner.types.contains_key(parent) {
                return Err(SpaceError::InvalidOperation(format!(
                    "super type {} of {} is not registered",
                    parent, descriptor.name
                )));
            }
            let siblings = inner.children.entry(parent.clone()).or_default();
            siblings.push(descriptor.name.clone());
            siblings.sort();
        }
        debug!(type_name = %descriptor.name, super_type = ?descriptor.super_type, "type registered");
        let descriptor = Arc::new(descriptor);
        inner
            .types
            .insert(descriptor.name.clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Descriptor of a known type
    pub fn get(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.inner.read().types.get(name).cloned()
    }

    /// Descriptor of a type, introducing it as a root type if unknown
    pub fn get_or_introduce(&self, name: &str) -> Arc<TypeDescriptor> {
        if let Some(known) = self.get(name) {
            return known;
        }
        let mut inner = self.inner.write();
        let descriptor = inner
            .types
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TypeDescriptor::new(name)));
        Arc::clone(descriptor)
    }

    /// The type and all its descendants, breadth first
    pub fn assignable(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut result = Vec::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if let Some(children) = inner.children.get(&current) {
                queue.extend(children.iter().cloned());
            }
            result.push(current);
        }
        result
    }

    /// Whether entries of `candidate` match templates on `target`
    pub fn is_assignable(&self, candidate: &str, target: &str) -> bool {
        let inner = self.inner.read();
        let mut current = Some(candidate.to_string());
        while let Some(name) = current {
            if name == target {
                return true;
            }
            current = inner.types.get(&name).and_then(|d| d.super_type.clone());
        }
        false
    }

    /// `name` followed by its super types, nearest first
    pub fn ancestors(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut lineage = Vec::new();
        let mut current = Some(name.to_string());
        while let Some(type_name) = current {
            current = inner.types.get(&type_name).and_then(|d| d.super_type.clone());
            lineage.push(type_name);
        }
        lineage
    }

    /// Number of known types
    pub fn len(&self) -> usize {
        self.inner.read().types.len()
    }

    /// Whether no type is known
    pub fn is_empty(&self) -> bool {
        self.inner.read().types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry.register(TypeDescriptor::new("Vehicle")).unwrap();
        registry
            .register(TypeDescriptor::new("Truck").extends("Vehicle"))
            .unwrap();
        registry
            .register(TypeDescriptor::new("Car").extends("Vehicle"))
            .unwrap();
        registry
            .register(TypeDescriptor::new("Van").extends("Truck"))
            .unwrap();
        registry
    }

    #[test]
    fn test_assignable_breadth_first() {
        let registry = hierarchy();
        assert_eq!(
            registry.assignable("Vehicle"),
            vec!["Vehicle", "Car", "Truck", "Van"]
        );
        assert_eq!(registry.assignable("Car"), vec!["Car"]);
    }

    #[test]
    fn test_is_assignable_walks_parents() {
        let registry = hierarchy();
        assert!(registry.is_assignable("Van", "Vehicle"));
        assert!(!registry.is_assignable("Vehicle", "Van"));
        assert!(!registry.is_assignable("Car", "Truck"));
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let registry = hierarchy();
        assert_eq!(registry.ancestors("Van"), vec!["Van", "Truck", "Vehicle"]);
        assert_eq!(registry.ancestors("Unknown"), vec!["Unknown"]);
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let registry = TypeRegistry::new();
        assert!(registry
            .register(TypeDescriptor::new("Child").extends("Missing"))
            .is_err());
    }

    #[test]
    fn test_conflicting_reregistration_rejected() {
        let registry = TypeRegistry::new();
        registry.register(TypeDescriptor::new("Queue").fifo()).unwrap();
        assert!(registry.register(TypeDescriptor::new("Queue").fifo()).is_ok());
        assert!(registry.register(TypeDescriptor::new("Queue")).is_err());
    }

    #[test]
    fn test_introduced_types_are_roots() {
        let registry = TypeRegistry::new();
        let descriptor = registry.get_or_introduce("Order");
        assert!(descriptor.super_type.is_none());
        assert!(!descriptor.fifo);
        assert_eq!(registry.len(), 1);
    }
}
