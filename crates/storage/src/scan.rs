//! Matcher / scan driver
//!
//! Produces the ordered candidate sequence for one search attempt. A scan is
//! single-use: every attempt builds a fresh one.
//!
//! Ordering rules:
//! - by-uid and by-id selectors bypass scanning
//! - predicate selectors visit the template type and every assignable
//!   subtype; with all data resident the subtype list is rotated to a random
//!   start on each non-FIFO search so no subtype starves the others
//! - FIFO searches start at offset 0 and visit candidates in global
//!   insertion order

use rand::Rng;
use std::sync::Arc;

use gridspace_core::{Selector, Template, Uid};

use crate::holder::EntryCell;
use crate::registry::TypeRegistry;
use crate::sharded::EntryStore;

/// One scan candidate
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The entry
    pub cell: Arc<EntryCell>,
    /// The selector is already known to match; no re-match needed
    pub fully_matched: bool,
}

/// Scan settings that come from the space configuration
#[derive(Debug, Clone, Copy)]
pub struct ScanPolicy {
    /// All entries are resident; enables rotation
    pub all_in_cache: bool,
}

/// Single-use candidate sequence
///
/// Holds an open-scan slot on the store until dropped, on every exit path.
#[derive(Debug)]
pub struct Scan<'a> {
    store: &'a EntryStore,
    candidates: std::vec::IntoIter<Candidate>,
    rotation: usize,
}

impl<'a> Scan<'a> {
    fn new(store: &'a EntryStore, candidates: Vec<Candidate>, rotation: usize) -> Self {
        store.scan_opened();
        Self {
            store,
            candidates: candidates.into_iter(),
            rotation,
        }
    }

    /// Subtype offset this scan started at
    pub fn rotation(&self) -> usize {
        self.rotation
    }

    /// Candidates not yet consumed
    pub fn remaining(&self) -> usize {
        self.candidates.len()
    }
}

impl Iterator for Scan<'_> {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        self.candidates.next()
    }
}

impl Drop for Scan<'_> {
    fn drop(&mut self) {
        self.store.scan_closed();
    }
}

/// Builds scans over a store
#[derive(Debug)]
pub struct ScanDriver<'a> {
    store: &'a EntryStore,
    registry: &'a TypeRegistry,
    policy: ScanPolicy,
}

impl<'a> ScanDriver<'a> {
    /// Driver over a store and its registry
    pub fn new(store: &'a EntryStore, registry: &'a TypeRegistry, policy: ScanPolicy) -> Self {
        Self {
            store,
            registry,
            policy,
        }
    }

    /// Fresh scan for a template
    pub fn scan(&self, template: &Template) -> Scan<'a> {
        match &template.selector {
            Selector::ByUid(uid) => Scan::new(self.store, self.direct(uid, None), 0),
            Selector::ById { type_name, id } => {
                let uid = Uid::from_id(type_name, id);
                Scan::new(self.store, self.direct(&uid, Some(type_name.as_str())), 0)
            }
            Selector::ByIds { type_name, ids } => {
                let candidates = ids
                    .iter()
                    .flat_map(|id| {
                        self.direct(&Uid::from_id(type_name, id), Some(type_name.as_str()))
                    })
                    .collect();
                Scan::new(self.store, candidates, 0)
            }
            Selector::Match {
                type_name,
                predicate,
            } => {
                let mut types = self.registry.assignable(type_name);
                let rotation = if self.rotates(template, types.len()) {
                    rand::thread_rng().gen_range(0..types.len())
                } else {
                    0
                };
                types.rotate_left(rotation);

                let mut candidates = Vec::new();
                for name in &types {
                    let Some(shard) = self.store.existing_shard(name) else {
                        continue;
                    };
                    // postings track current content only
                    let cells = if template.historical.is_some() {
                        shard.cells()
                    } else {
                        shard.candidates(predicate)
                    };
                    let fully_matched = predicate.is_empty();
                    candidates.extend(cells.into_iter().map(|cell| Candidate {
                        cell,
                        fully_matched,
                    }));
                }
                if template.is_fifo() {
                    candidates.sort_by_key(|c| c.cell.seq());
                }
                Scan::new(self.store, candidates, rotation)
            }
        }
    }

    fn rotates(&self, template: &Template, type_count: usize) -> bool {
        self.policy.all_in_cache && !template.is_fifo() && type_count > 1
    }

    fn direct(&self, uid: &Uid, type_name: Option<&str>) -> Vec<Candidate> {
        let Some(cell) = self.store.get(uid) else {
            return Vec::new();
        };
        if let Some(target) = type_name {
            if !self.registry.is_assignable(cell.type_name(), target) {
                return Vec::new();
            }
        }
        vec![Candidate {
            cell,
            fully_matched: true,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::EntryHolder;
    use crate::registry::TypeDescriptor;
    use gridspace_concurrency::EntryLockState;
    use gridspace_core::{EntryData, EntryPacket, Modifiers, Predicate, LEASE_FOREVER};
    use std::collections::BTreeSet;

    fn setup() -> (EntryStore, TypeRegistry) {
        let registry = TypeRegistry::new();
        registry.register(TypeDescriptor::new("Vehicle")).unwrap();
        registry
            .register(TypeDescriptor::new("Car").extends("Vehicle"))
            .unwrap();
        registry
            .register(TypeDescriptor::new("Truck").extends("Vehicle"))
            .unwrap();
        (EntryStore::new(), registry)
    }

    fn put(store: &EntryStore, uid: &str, type_name: &str) {
        let packet = EntryPacket::new(type_name).with_field("wheels", 4);
        let data = EntryData::from_packet(Uid::new(uid), &packet, LEASE_FOREVER);
        let shard = store.shard(type_name, &[]);
        store
            .insert(EntryHolder::new(data, EntryLockState::new(), false), &shard)
            .unwrap();
    }

    fn uids(scan: Scan<'_>) -> Vec<String> {
        scan.map(|c| c.cell.uid().as_str().to_string()).collect()
    }

    #[test]
    fn test_by_uid_bypasses_scan() {
        let (store, registry) = setup();
        put(&store, "a", "Car");
        let driver = ScanDriver::new(&store, &registry, ScanPolicy { all_in_cache: true });
        let t = Template::read(Selector::ByUid(Uid::new("a")));
        let found: Vec<Candidate> = driver.scan(&t).collect();
        assert_eq!(found.len(), 1);
        assert!(found[0].fully_matched);
        let t = Template::read(Selector::ByUid(Uid::new("missing")));
        assert_eq!(driver.scan(&t).count(), 0);
    }

    #[test]
    fn test_subtypes_included() {
        let (store, registry) = setup();
        put(&store, "c1", "Car");
        put(&store, "t1", "Truck");
        put(&store, "v1", "Vehicle");
        let driver = ScanDriver::new(&store, &registry, ScanPolicy { all_in_cache: true });
        let found: BTreeSet<String> = uids(driver.scan(&Template::read(Selector::all_of("Vehicle"))))
            .into_iter()
            .collect();
        assert_eq!(found.len(), 3);
        assert_eq!(uids(driver.scan(&Template::read(Selector::all_of("Car")))), vec!["c1"]);
    }

    #[test]
    fn test_fifo_scan_is_insertion_ordered() {
        let (store, registry) = setup();
        for (uid, type_name) in [("1", "Truck"), ("2", "Car"), ("3", "Vehicle"), ("4", "Car")] {
            put(&store, uid, type_name);
        }
        let driver = ScanDriver::new(&store, &registry, ScanPolicy { all_in_cache: true });
        let t = Template::take(Selector::all_of("Vehicle")).with_modifiers(Modifiers::new().fifo());
        for _ in 0..10 {
            let scan = driver.scan(&t);
            assert_eq!(scan.rotation(), 0);
            assert_eq!(uids(scan), vec!["1", "2", "3", "4"]);
        }
    }

    #[test]
    fn test_rotation_disabled_without_all_in_cache() {
        let (store, registry) = setup();
        put(&store, "c1", "Car");
        let driver = ScanDriver::new(&store, &registry, ScanPolicy { all_in_cache: false });
        for _ in 0..10 {
            assert_eq!(driver.scan(&Template::read(Selector::all_of("Vehicle"))).rotation(), 0);
        }
    }

    #[test]
    fn test_rotation_offsets_stay_in_range() {
        let (store, registry) = setup();
        let driver = ScanDriver::new(&store, &registry, ScanPolicy { all_in_cache: true });
        let t = Template::read(Selector::all_of("Vehicle"));
        let offsets: BTreeSet<usize> = (0..200).map(|_| driver.scan(&t).rotation()).collect();
        assert!(offsets.iter().all(|o| *o < 3));
        assert!(offsets.len() > 1);
    }

    #[test]
    fn test_scan_releases_slot_on_every_exit() {
        let (store, registry) = setup();
        put(&store, "a", "Car");
        put(&store, "b", "Car");
        let driver = ScanDriver::new(&store, &registry, ScanPolicy { all_in_cache: true });
        {
            let mut scan = driver.scan(&Template::read(Selector::all_of("Car")));
            assert_eq!(store.open_scans(), 1);
            let _first = scan.next();
        }
        assert_eq!(store.open_scans(), 0);
        let _ = driver.scan(&Template::read(Selector::all_of("Car"))).count();
        assert_eq!(store.open_scans(), 0);
    }

    #[test]
    fn test_predicate_candidates_need_rematch() {
        let (store, registry) = setup();
        put(&store, "a", "Car");
        let driver = ScanDriver::new(&store, &registry, ScanPolicy { all_in_cache: true });
        let t = Template::read(Selector::matching("Car", Predicate::all().eq("wheels", 4)));
        let found: Vec<Candidate> = driver.scan(&t).collect();
        assert_eq!(found.len(), 1);
        assert!(!found[0].fully_matched);
    }
}
