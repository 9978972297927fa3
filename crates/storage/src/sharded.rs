//! Sharded entry store
//!
//! Uid map plus one shard per concrete type.
//!
//! # Design
//!
//! - DashMap by uid: O(1) by-uid/by-id lookups, sharded writes
//! - DashMap by type name: each [`TypeShard`] keeps its entries in insertion
//!   order (FIFO order) and optional equality indexes
//! - Entry locks are never taken while a DashMap guard or a shard index lock
//!   is held; the order is always entry lock first, then map/index
//!
//! # Thread Safety
//!
//! Index postings and the uid map are changed only by a thread holding the
//! entry lock of the affected cell.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use gridspace_core::{Predicate, Uid, Value};

use crate::holder::{EntryCell, EntryGuard, EntryHolder};

type Postings = FxHashMap<Value, BTreeSet<u64>>;

/// Entries of one concrete type
#[derive(Debug)]
pub struct TypeShard {
    type_name: String,
    indexed_fields: Vec<String>,
    entries: RwLock<BTreeMap<u64, Arc<EntryCell>>>,
    equality: RwLock<FxHashMap<String, Postings>>,
}

impl TypeShard {
    fn new(type_name: &str, indexed_fields: &[String]) -> Self {
        Self {
            type_name: type_name.to_string(),
            indexed_fields: indexed_fields.to_vec(),
            entries: RwLock::new(BTreeMap::new()),
            equality: RwLock::new(FxHashMap::default()),
        }
    }

    /// Concrete type of the shard
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Indexed fields
    pub fn indexed_fields(&self) -> &[String] {
        &self.indexed_fields
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the shard holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All cells in insertion order
    pub fn cells(&self) -> Vec<Arc<EntryCell>> {
        self.entries.read().values().cloned().collect()
    }

    /// Cells posted under `field == value`, in insertion order
    ///
    /// Postings cover both current and pending-commit content, so callers
    /// must re-match what they get.
    pub fn lookup(&self, field: &str, value: &Value) -> Vec<Arc<EntryCell>> {
        let seqs: Vec<u64> = self
            .equality
            .read()
            .get(field)
            .and_then(|postings| postings.get(value))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let entries = self.entries.read();
        seqs.iter().filter_map(|seq| entries.get(seq).cloned()).collect()
    }

    /// Candidates for a predicate, narrowed by an equality index when one
    /// covers a condition
    pub fn candidates(&self, predicate: &Predicate) -> Vec<Arc<EntryCell>> {
        match predicate.equality_on(&self.indexed_fields) {
            Some(condition) => self.lookup(&condition.field, &condition.value),
            None => self.cells(),
        }
    }

    fn insert(&self, cell: &Arc<EntryCell>) {
        self.entries.write().insert(cell.seq(), Arc::clone(cell));
    }

    fn remove(&self, cell: &EntryCell, holder: &mut EntryHolder) {
        self.entries.write().remove(&cell.seq());
        self.unpost(cell.seq(), &std::mem::take(&mut holder.postings));
    }

    /// Bring the equality postings of `cell` in line with its content
    pub(crate) fn repost(&self, cell: &EntryCell, holder: &mut EntryHolder) {
        if self.indexed_fields.is_empty() {
            return;
        }
        let mut wanted: Vec<(String, Value)> = Vec::new();
        if !holder.deleted {
            let sources = std::iter::once(&holder.data).chain(holder.shadow.iter());
            for data in sources {
                for field in &self.indexed_fields {
                    if let Some(value) = data.get(field) {
                        let posting = (field.clone(), value.clone());
                        if !wanted.contains(&posting) {
                            wanted.push(posting);
                        }
                    }
                }
            }
        }
        if wanted == holder.postings {
            return;
        }
        let stale: Vec<(String, Value)> = holder
            .postings
            .iter()
            .filter(|p| !wanted.contains(p))
            .cloned()
            .collect();
        self.unpost(cell.seq(), &stale);
        let mut equality = self.equality.write();
        for (field, value) in &wanted {
            equality
                .entry(field.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(cell.seq());
        }
        holder.postings = wanted;
    }

    fn unpost(&self, seq: u64, postings: &[(String, Value)]) {
        if postings.is_empty() {
            return;
        }
        let mut equality = self.equality.write();
        for (field, value) in postings {
            if let Some(by_value) = equality.get_mut(field) {
                if let Some(seqs) = by_value.get_mut(value) {
                    seqs.remove(&seq);
                    if seqs.is_empty() {
                        by_value.remove(value);
                    }
                }
            }
        }
    }
}

/// Result of [`EntryStore::insert_with`]
#[derive(Debug)]
pub enum Inserted<T> {
    /// The new cell is resident
    Linked(Arc<EntryCell>, T),
    /// Another cell already holds the uid
    Clash(Arc<EntryCell>),
}

/// All resident entries of a space
#[derive(Debug, Default)]
pub struct EntryStore {
    cells: DashMap<Uid, Arc<EntryCell>>,
    shards: DashMap<String, Arc<TypeShard>>,
    next_seq: AtomicU64,
    open_scans: AtomicUsize,
}

impl EntryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Shards
    // ========================================================================

    /// Shard of a concrete type, created with the given indexes on first use
    pub fn shard(&self, type_name: &str, indexed_fields: &[String]) -> Arc<TypeShard> {
        if let Some(shard) = self.shards.get(type_name) {
            return Arc::clone(shard.value());
        }
        let shard = self
            .shards
            .entry(type_name.to_string())
            .or_insert_with(|| Arc::new(TypeShard::new(type_name, indexed_fields)));
        Arc::clone(shard.value())
    }

    /// Existing shard of a type
    pub fn existing_shard(&self, type_name: &str) -> Option<Arc<TypeShard>> {
        self.shards.get(type_name).map(|s| Arc::clone(s.value()))
    }

    // ========================================================================
    // Get/Insert/Remove
    // ========================================================================

    /// Cell of a uid
    pub fn get(&self, uid: &Uid) -> Option<Arc<EntryCell>> {
        self.cells.get(uid).map(|c| Arc::clone(c.value()))
    }

    /// Whether a uid is resident
    pub fn contains(&self, uid: &Uid) -> bool {
        self.cells.contains_key(uid)
    }

    /// Insert a new entry
    ///
    /// The new cell is locked while it becomes reachable, so nobody observes
    /// it before it is indexed. Returns the resident cell on a uid clash.
    pub fn insert(
        &self,
        holder: EntryHolder,
        shard: &Arc<TypeShard>,
    ) -> Result<Arc<EntryCell>, Arc<EntryCell>> {
        match self.insert_with(holder, shard, |_| Ok::<(), Infallible>(())) {
            Ok(Inserted::Linked(cell, ())) => Ok(cell),
            Ok(Inserted::Clash(resident)) => Err(resident),
            Err(never) => match never {},
        }
    }

    /// Insert a new entry and run `finish` on it before anyone can lock it
    ///
    /// `finish` runs under the new cell's entry lock once the cell is
    /// linked. If it fails the cell is unlinked again (marked deleted, so a
    /// thread already queued on the lock skips it) and the error returned.
    pub fn insert_with<T, E>(
        &self,
        holder: EntryHolder,
        shard: &Arc<TypeShard>,
        finish: impl FnOnce(&mut EntryGuard<'_>) -> Result<T, E>,
    ) -> Result<Inserted<T>, E> {
        let uid = holder.data.uid.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let cell = Arc::new(EntryCell::new(holder, seq, Arc::downgrade(shard)));
        let mut guard = cell.lock();
        match self.cells.entry(uid) {
            Entry::Occupied(existing) => return Ok(Inserted::Clash(Arc::clone(existing.get()))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&cell));
            }
        }
        shard.insert(&cell);
        guard.republish();
        match finish(&mut guard) {
            Ok(value) => {
                drop(guard);
                Ok(Inserted::Linked(cell, value))
            }
            Err(err) => {
                guard.deleted = true;
                self.remove(&mut guard);
                Err(err)
            }
        }
    }

    /// Unlink a locked cell from the uid map and its shard
    ///
    /// The holder must already be marked deleted. Only removes the map slot
    /// if it still points at this cell.
    pub fn remove(&self, guard: &mut EntryGuard<'_>) {
        let cell = guard.cell();
        self.cells
            .remove_if(cell.uid(), |_, current| std::ptr::eq(current.as_ref(), cell));
        if let Some(shard) = self.existing_shard(cell.type_name()) {
            shard.remove(cell, guard);
        }
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether nothing is resident
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Next insertion sequence number that will be handed out
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) + 1
    }

    // ========================================================================
    // Scans
    // ========================================================================

    pub(crate) fn scan_opened(&self) {
        self.open_scans.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn scan_closed(&self) {
        self.open_scans.fetch_sub(1, Ordering::SeqCst);
    }

    /// Scans currently holding candidates
    pub fn open_scans(&self) -> usize {
        self.open_scans.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridspace_concurrency::EntryLockState;
    use gridspace_core::{EntryData, EntryPacket, LEASE_FOREVER};
    use std::thread;

    fn holder(uid: &str, colour: &str) -> EntryHolder {
        let packet = EntryPacket::new("Car").with_field("colour", colour);
        let data = EntryData::from_packet(Uid::new(uid), &packet, LEASE_FOREVER);
        EntryHolder::new(data, EntryLockState::new(), false)
    }

    fn indexed_store() -> (EntryStore, Arc<TypeShard>) {
        let store = EntryStore::new();
        let shard = store.shard("Car", &["colour".to_string()]);
        (store, shard)
    }

    #[test]
    fn test_insert_and_get() {
        let (store, shard) = indexed_store();
        let cell = store.insert(holder("a", "red"), &shard).unwrap();
        assert_eq!(cell.uid(), &Uid::new("a"));
        assert!(store.contains(&Uid::new("a")));
        assert_eq!(store.len(), 1);
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_insert_clash_returns_resident() {
        let (store, shard) = indexed_store();
        let first = store.insert(holder("a", "red"), &shard).unwrap();
        let clash = store.insert(holder("a", "blue"), &shard).unwrap_err();
        assert!(Arc::ptr_eq(&first, &clash));
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_insertion_order_is_fifo_order() {
        let (store, shard) = indexed_store();
        for uid in ["c", "a", "b"] {
            store.insert(holder(uid, "red"), &shard).unwrap();
        }
        let order: Vec<String> = shard
            .cells()
            .iter()
            .map(|c| c.uid().as_str().to_string())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_equality_index_follows_updates() {
        let (store, shard) = indexed_store();
        let cell = store.insert(holder("a", "red"), &shard).unwrap();
        assert_eq!(shard.lookup("colour", &Value::from("red")).len(), 1);

        {
            let mut guard = cell.lock();
            guard.shadow = Some(guard.data.clone());
            guard.data.fields.insert("colour".into(), Value::from("blue"));
        }
        // pending update: both values posted
        assert_eq!(shard.lookup("colour", &Value::from("red")).len(), 1);
        assert_eq!(shard.lookup("colour", &Value::from("blue")).len(), 1);

        {
            let mut guard = cell.lock();
            guard.shadow = None;
        }
        assert!(shard.lookup("colour", &Value::from("red")).is_empty());
        assert_eq!(shard.lookup("colour", &Value::from("blue")).len(), 1);
    }

    #[test]
    fn test_remove_unlinks_everything() {
        let (store, shard) = indexed_store();
        let cell = store.insert(holder("a", "red"), &shard).unwrap();
        {
            let mut guard = cell.lock();
            guard.deleted = true;
            store.remove(&mut guard);
        }
        assert!(!store.contains(&Uid::new("a")));
        assert!(shard.is_empty());
        assert!(shard.lookup("colour", &Value::from("red")).is_empty());
    }

    #[test]
    fn test_failed_finish_unlinks_cell() {
        let (store, shard) = indexed_store();
        let result = store.insert_with(holder("a", "red"), &shard, |guard| {
            assert_eq!(guard.data.uid, Uid::new("a"));
            Err::<(), &str>("refused")
        });
        assert_eq!(result.unwrap_err(), "refused");
        assert!(!store.contains(&Uid::new("a")));
        assert!(shard.is_empty());
        assert!(shard.lookup("colour", &Value::from("red")).is_empty());

        match store.insert_with(holder("a", "red"), &shard, |_| Ok::<u32, ()>(7)) {
            Ok(Inserted::Linked(cell, 7)) => assert_eq!(cell.uid(), &Uid::new("a")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_concurrent_inserts_same_uid_one_wins() {
        let (store, shard) = indexed_store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let shard = Arc::clone(&shard);
                thread::spawn(move || store.insert(holder("same", "red"), &shard).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(shard.len(), 1);
    }
}
