//! MVCC, FIFO, leases, persistence hand-off, filters and async delivery

use gridspace_core::local::{ManualClock, MemoryPersistence, RecordingReplication};
use gridspace_core::{
    EntryData, EntryPacket, FilterContext, Modifiers, OperationFilter, OperationKind, Result,
    Selector, SpaceConfig, SpaceError, Template, UpdateSource, Uid, Value, LEASE_FOREVER,
};
use gridspace_engine::{Collaborators, SpaceEngine};
use gridspace_storage::TypeDescriptor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

fn build(config: SpaceConfig, collaborators: Collaborators) -> Arc<SpaceEngine> {
    build_filtered(config, collaborators, Vec::new())
}

fn build_filtered(
    config: SpaceConfig,
    collaborators: Collaborators,
    filters: Vec<Arc<dyn OperationFilter>>,
) -> Arc<SpaceEngine> {
    let engine = SpaceEngine::with_collaborators(config, collaborators, filters).unwrap();
    engine
        .register_type(TypeDescriptor::new("Item").id_property("id"))
        .unwrap();
    engine
        .register_type(TypeDescriptor::new("Job").id_property("id").fifo())
        .unwrap();
    Arc::new(engine)
}

fn item(id: i64, v: i64) -> EntryPacket {
    EntryPacket::new("Item").with_field("id", id).with_field("v", v)
}

fn by_id(id: i64) -> Selector {
    Selector::by_id("Item", id)
}

fn mvcc_config() -> SpaceConfig {
    SpaceConfig {
        mvcc_enabled: true,
        ..SpaceConfig::default()
    }
}

fn update(engine: &SpaceEngine, packet: EntryPacket) {
    engine
        .update(
            packet,
            None,
            None,
            Modifiers::new(),
            UpdateSource::Local,
            Duration::ZERO,
        )
        .unwrap();
}

// ============================================================================
// MVCC
// ============================================================================

#[test]
fn test_historical_read_sees_pinned_generation() {
    let engine = build(mvcc_config(), Collaborators::default());
    engine.write(item(1, 1), None, None, Modifiers::new()).unwrap();
    let pinned = engine.generation_state().unwrap();
    update(&engine, item(1, 2));

    let then = engine
        .read(Template::read(by_id(1)).at_snapshot(pinned.clone()))
        .unwrap()
        .unwrap();
    assert_eq!(then.get("v"), Some(&Value::from(1)));

    let now = engine.read(Template::read(by_id(1))).unwrap().unwrap();
    assert_eq!(now.get("v"), Some(&Value::from(2)));
}

#[test]
fn test_taken_entry_stays_visible_to_older_snapshots() {
    let engine = build(mvcc_config(), Collaborators::default());
    engine.write(item(1, 1), None, None, Modifiers::new()).unwrap();
    let pinned = engine.generation_state().unwrap();
    engine.take(Template::take(by_id(1))).unwrap().unwrap();

    assert!(engine.read(Template::read(by_id(1))).unwrap().is_none());
    assert!(engine
        .read(Template::read(by_id(1)).at_snapshot(pinned))
        .unwrap()
        .is_some());

    // the uid is free again for a new write
    engine.write(item(1, 3), None, None, Modifiers::new()).unwrap();
    let fresh = engine.read(Template::read(by_id(1))).unwrap().unwrap();
    assert_eq!(fresh.get("v"), Some(&Value::from(3)));
}

#[test]
fn test_historical_mutation_is_rejected() {
    let engine = build(mvcc_config(), Collaborators::default());
    engine.write(item(1, 1), None, None, Modifiers::new()).unwrap();
    let pinned = engine.generation_state().unwrap();
    let err = engine
        .take(Template::take(by_id(1)).at_snapshot(pinned))
        .unwrap_err();
    assert!(matches!(err, SpaceError::MvccModifyConflict { .. }));
}

#[test]
fn test_mvcc_read_committed_ignores_dirty_generation() {
    let engine = build(mvcc_config(), Collaborators::default());
    engine.write(item(1, 1), None, None, Modifiers::new()).unwrap();
    let xtn = engine.begin(true);
    engine
        .update(
            item(1, 2),
            Some(xtn),
            None,
            Modifiers::new(),
            UpdateSource::Local,
            Duration::ZERO,
        )
        .unwrap();

    let committed = engine
        .read(Template::read(by_id(1)).with_modifiers(Modifiers::new().read_committed()))
        .unwrap()
        .unwrap();
    assert_eq!(committed.get("v"), Some(&Value::from(1)));
    engine.commit(xtn).unwrap();

    let pinned = engine.generation_state().unwrap();
    let after = engine
        .read(Template::read(by_id(1)).at_snapshot(pinned))
        .unwrap()
        .unwrap();
    assert_eq!(after.get("v"), Some(&Value::from(2)));
}

#[test]
fn test_unsupported_combinations() {
    let plain = build(SpaceConfig::default(), Collaborators::default());
    assert!(matches!(
        plain.generation_state(),
        Err(SpaceError::Unsupported(_))
    ));

    let mvcc = build(mvcc_config(), Collaborators::default());
    let err = mvcc
        .write(item(1, 1), None, None, Modifiers::new().backup_only())
        .unwrap_err();
    assert!(matches!(err, SpaceError::Unsupported(_)));
}

// ============================================================================
// FIFO
// ============================================================================

#[test]
fn test_fifo_take_follows_insertion_order() {
    let engine = build(SpaceConfig::default(), Collaborators::default());
    for id in [3, 1, 2] {
        engine
            .write(
                EntryPacket::new("Job").with_field("id", id),
                None,
                None,
                Modifiers::new(),
            )
            .unwrap();
    }
    let fifo_take = || {
        engine
            .take(Template::take(Selector::all_of("Job")).with_modifiers(Modifiers::new().fifo()))
            .unwrap()
            .unwrap()
            .get("id")
            .cloned()
    };
    assert_eq!(fifo_take(), Some(Value::from(3)));
    assert_eq!(fifo_take(), Some(Value::from(1)));
    assert_eq!(fifo_take(), Some(Value::from(2)));
}

#[test]
fn test_fifo_order_survives_transactional_writes() {
    let engine = build(SpaceConfig::default(), Collaborators::default());
    let xtn = engine.begin(true);
    for id in 0..3 {
        engine
            .write(
                EntryPacket::new("Job").with_field("id", id),
                Some(xtn),
                None,
                Modifiers::new(),
            )
            .unwrap();
    }
    engine.commit(xtn).unwrap();

    let taken = engine
        .take_multiple(
            Template::take(Selector::all_of("Job")).with_modifiers(Modifiers::new().fifo()),
            10,
        )
        .unwrap();
    let ids: Vec<Value> = taken.iter().filter_map(|e| e.get("id").cloned()).collect();
    assert_eq!(ids, vec![Value::from(0), Value::from(1), Value::from(2)]);
}

// ============================================================================
// Leases
// ============================================================================

#[test]
fn test_expired_entry_is_not_returned() {
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = build(
        SpaceConfig::default(),
        Collaborators {
            leases: clock.clone(),
            ..Collaborators::default()
        },
    );
    engine
        .write(
            item(1, 1),
            None,
            Some(Duration::from_millis(100)),
            Modifiers::new(),
        )
        .unwrap();
    assert!(engine.read(Template::read(by_id(1))).unwrap().is_some());

    clock.advance(Duration::from_millis(200));
    assert!(engine.read(Template::read(by_id(1))).unwrap().is_none());
    assert_eq!(engine.stats().entries, 0);
}

#[test]
fn test_update_with_preserve_lease_keeps_expiration() {
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = build(
        SpaceConfig::default(),
        Collaborators {
            leases: clock.clone(),
            ..Collaborators::default()
        },
    );
    let written = engine
        .write(
            item(1, 1),
            None,
            Some(Duration::from_millis(500)),
            Modifiers::new(),
        )
        .unwrap();
    let updated = engine
        .update(
            item(1, 2),
            None,
            None,
            Modifiers::new().preserve_lease(),
            UpdateSource::Local,
            Duration::ZERO,
        )
        .unwrap()
        .unwrap();
    assert_eq!(updated.entry.expiration, written.expiration);

    let forever = engine
        .update(
            item(1, 3),
            None,
            None,
            Modifiers::new(),
            UpdateSource::Local,
            Duration::ZERO,
        )
        .unwrap()
        .unwrap();
    assert_eq!(forever.entry.expiration, LEASE_FOREVER);
}

// ============================================================================
// Persistence and replication
// ============================================================================

#[test]
fn test_persistence_follows_committed_state() {
    let persistence = Arc::new(MemoryPersistence::new());
    let engine = build(
        SpaceConfig::default(),
        Collaborators {
            persistence: persistence.clone(),
            ..Collaborators::default()
        },
    );
    let uid = engine
        .write(item(1, 1), None, None, Modifiers::new())
        .unwrap()
        .uid;
    assert!(persistence.stored(&uid).is_some());

    let xtn = engine.begin(true);
    let second = engine
        .write(item(2, 2), Some(xtn), None, Modifiers::new())
        .unwrap()
        .uid;
    engine
        .take(Template::take(by_id(1)).with_xtn(xtn))
        .unwrap();
    assert!(persistence.stored(&second).is_none());
    assert!(persistence.stored(&uid).is_some());

    engine.commit(xtn).unwrap();
    assert!(persistence.stored(&second).is_some());
    assert!(persistence.stored(&uid).is_none());
}

#[test]
fn test_transient_entries_are_not_persisted() {
    let persistence = Arc::new(MemoryPersistence::new());
    let engine = build(
        SpaceConfig::default(),
        Collaborators {
            persistence: persistence.clone(),
            ..Collaborators::default()
        },
    );
    engine
        .write(item(1, 1).transient(), None, None, Modifiers::new())
        .unwrap();
    assert!(persistence.is_empty());
    assert_eq!(engine.stats().entries, 1);
}

#[test]
fn test_failed_persistence_rejects_write() {
    let persistence = Arc::new(MemoryPersistence::new());
    let engine = build(
        SpaceConfig::default(),
        Collaborators {
            persistence: persistence.clone(),
            ..Collaborators::default()
        },
    );
    persistence.fail_writes(true);
    let err = engine
        .write(item(1, 1), None, None, Modifiers::new())
        .unwrap_err();
    assert!(matches!(err, SpaceError::Storage { .. }));
    assert_eq!(engine.stats().entries, 0);
}

#[test]
fn test_replication_refusal_undoes_persistence() {
    let persistence = Arc::new(MemoryPersistence::new());
    let replication = Arc::new(RecordingReplication::with_level(1));
    let engine = build(
        SpaceConfig::default(),
        Collaborators {
            persistence: persistence.clone(),
            replication: replication.clone(),
            ..Collaborators::default()
        },
    );
    let written = engine
        .write(item(1, 1), None, None, Modifiers::new())
        .unwrap();
    assert_eq!(written.replication_level, 1);

    replication.reject(true);
    let err = engine
        .write(item(2, 2), None, None, Modifiers::new())
        .unwrap_err();
    assert!(matches!(err, SpaceError::Replication { .. }));
    assert_eq!(persistence.len(), 1);
    assert!(engine.read(Template::read(by_id(2))).unwrap().is_none());
}

#[test]
fn test_missing_entry_is_loaded_from_persistence() {
    let persistence = Arc::new(MemoryPersistence::new());
    let uid = Uid::from_id("Item", &Value::from(5));
    let stored = EntryData::from_packet(uid.clone(), &item(5, 50), LEASE_FOREVER);
    gridspace_core::EntryPersistence::put(persistence.as_ref(), &stored).unwrap();

    let engine = build(
        SpaceConfig {
            all_in_cache: false,
            ..SpaceConfig::default()
        },
        Collaborators {
            persistence: persistence.clone(),
            ..Collaborators::default()
        },
    );
    let found = engine.read(Template::read(by_id(5))).unwrap().unwrap();
    assert_eq!(found.uid, uid);
    assert_eq!(engine.stats().entries, 1);
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Default)]
struct NoTakes {
    after_reads: AtomicUsize,
}

impl OperationFilter for NoTakes {
    fn before(&self, op: OperationKind, _ctx: &FilterContext<'_>) -> Result<()> {
        if op.is_take() {
            return Err(SpaceError::FilterRejected {
                operation: op.to_string(),
                reason: "takes are disabled".into(),
            });
        }
        Ok(())
    }

    fn after(&self, op: OperationKind, ctx: &FilterContext<'_>) -> Result<()> {
        if op == OperationKind::Read && ctx.entry.is_some() {
            self.after_reads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn test_filters_reject_and_observe() {
    let filter = Arc::new(NoTakes::default());
    let engine = build_filtered(
        SpaceConfig::default(),
        Collaborators::default(),
        vec![filter.clone()],
    );
    engine.write(item(1, 1), None, None, Modifiers::new()).unwrap();

    let err = engine.take(Template::take(by_id(1))).unwrap_err();
    assert!(matches!(err, SpaceError::FilterRejected { .. }));
    assert!(engine.read(Template::read(by_id(1))).unwrap().is_some());
    assert_eq!(filter.after_reads.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Asynchronous delivery
// ============================================================================

#[tokio::test]
async fn test_submit_async_resolves_on_write() {
    let engine = build(SpaceConfig::default(), Collaborators::default());
    let future = engine.submit_async(
        Template::take(Selector::all_of("Item")).with_timeout(Duration::from_secs(5)),
    );
    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            engine.write(item(1, 1), None, None, Modifiers::new()).unwrap();
        })
    };
    let taken = future.await.unwrap().unwrap();
    assert_eq!(taken.entry.get("id"), Some(&Value::from(1)));
    writer.join().unwrap();
}

#[test]
fn test_callback_delivery_after_reaper_timeout() {
    let engine = build(SpaceConfig::default(), Collaborators::default());
    let (tx, rx) = mpsc::channel();
    engine.submit_with_callback(
        Template::read(Selector::all_of("Item")).with_timeout(Duration::from_millis(30)),
        move |result| {
            let _ = tx.send(result);
        },
    );
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Ok(None)));
    assert_eq!(engine.stats().pending_templates, 0);
}
