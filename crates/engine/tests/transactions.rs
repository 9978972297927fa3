//! Transactions: isolation, blocking, termination

use gridspace_core::local::RecordingReplication;
use gridspace_core::{
    EntryPacket, Modifiers, Mutation, ReplicationSink, Selector, SpaceConfig, SpaceError, Template,
    UpdateSource, Uid, Value,
};
use gridspace_engine::{Collaborators, SpaceEngine};
use gridspace_storage::TypeDescriptor;
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

fn engine() -> Arc<SpaceEngine> {
    engine_with(Collaborators::default())
}

fn engine_with(collaborators: Collaborators) -> Arc<SpaceEngine> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let engine =
        SpaceEngine::with_collaborators(SpaceConfig::default(), collaborators, Vec::new()).unwrap();
    engine
        .register_type(TypeDescriptor::new("Account").id_property("id"))
        .unwrap();
    Arc::new(engine)
}

fn account(id: i64, balance: i64) -> EntryPacket {
    EntryPacket::new("Account")
        .with_field("id", id)
        .with_field("balance", balance)
}

fn by_id(id: i64) -> Selector {
    Selector::by_id("Account", id)
}

fn write(engine: &SpaceEngine, packet: EntryPacket, xtn: Option<gridspace_core::XtnId>) -> Uid {
    engine.write(packet, xtn, None, Modifiers::new()).unwrap().uid
}

fn update(engine: &SpaceEngine, packet: EntryPacket, xtn: gridspace_core::XtnId) {
    engine
        .update(
            packet,
            Some(xtn),
            None,
            Modifiers::new(),
            UpdateSource::Local,
            Duration::ZERO,
        )
        .unwrap();
}

fn balance(engine: &SpaceEngine, template: Template) -> Option<Value> {
    engine
        .read(template)
        .unwrap()
        .and_then(|entry| entry.get("balance").cloned())
}

fn wait_for_pending(engine: &SpaceEngine, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.stats().pending_templates < count {
        assert!(Instant::now() < deadline, "template never registered");
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Commit / abort
// ============================================================================

#[test]
fn test_uncommitted_write_conflicts_then_commit_publishes() {
    let engine = engine();
    let xtn = engine.begin(true);
    write(&engine, account(1, 10), Some(xtn));

    let err = engine.read(Template::read(by_id(1))).unwrap_err();
    assert!(matches!(err, SpaceError::Timeout { waited_ms: 0, .. }));

    // the writer sees its own entry
    assert_eq!(
        balance(&engine, Template::read(by_id(1)).with_xtn(xtn)),
        Some(Value::from(10))
    );

    engine.commit(xtn).unwrap();
    assert_eq!(balance(&engine, Template::read(by_id(1))), Some(Value::from(10)));
    assert_eq!(engine.stats().commits, 1);
    assert!(engine.active_transactions().is_empty());
}

#[test]
fn test_abort_discards_write() {
    let engine = engine();
    let xtn = engine.begin(true);
    write(&engine, account(1, 10), Some(xtn));
    engine.abort(xtn).unwrap();

    assert!(engine.read(Template::read(by_id(1))).unwrap().is_none());
    assert_eq!(engine.stats().entries, 0);
    assert_eq!(engine.stats().aborts, 1);
}

#[test]
fn test_abort_restores_updated_content() {
    let engine = engine();
    write(&engine, account(1, 10), None);
    let xtn = engine.begin(true);
    update(&engine, account(1, 99), xtn);
    engine.abort(xtn).unwrap();

    let entry = engine.read(Template::read(by_id(1))).unwrap().unwrap();
    assert_eq!(entry.get("balance"), Some(&Value::from(10)));
    assert_eq!(entry.version, 1);
}

#[test]
fn test_terminated_transaction_is_unknown() {
    let engine = engine();
    let xtn = engine.begin(true);
    engine.commit(xtn).unwrap();
    assert!(matches!(
        engine.commit(xtn),
        Err(SpaceError::UnknownTransaction { .. })
    ));
    let err = engine
        .write(account(1, 1), Some(xtn), None, Modifiers::new())
        .unwrap_err();
    assert!(matches!(err, SpaceError::UnknownTransaction { .. }));
}

// ============================================================================
// Isolation modifiers
// ============================================================================

#[test]
fn test_read_committed_sees_last_committed_content() {
    let engine = engine();
    write(&engine, account(1, 10), None);
    let xtn = engine.begin(true);
    update(&engine, account(1, 99), xtn);

    let committed = Template::read(by_id(1)).with_modifiers(Modifiers::new().read_committed());
    assert_eq!(balance(&engine, committed), Some(Value::from(10)));

    let dirty = Template::read(by_id(1)).with_modifiers(Modifiers::new().dirty_read());
    assert_eq!(balance(&engine, dirty), Some(Value::from(99)));

    engine.commit(xtn).unwrap();
    assert_eq!(balance(&engine, Template::read(by_id(1))), Some(Value::from(99)));
}

#[test]
fn test_transactional_read_lock_blocks_take() {
    let engine = engine();
    write(&engine, account(1, 10), None);
    let reader = engine.begin(true);
    assert!(engine
        .read(Template::read(by_id(1)).with_xtn(reader))
        .unwrap()
        .is_some());

    let err = engine.take(Template::take(by_id(1))).unwrap_err();
    assert!(matches!(err, SpaceError::Timeout { .. }));

    engine.commit(reader).unwrap();
    assert!(engine.take(Template::take(by_id(1))).unwrap().is_some());
}

#[test]
fn test_exclusive_read_lock_blocks_other_transactions() {
    let engine = engine();
    write(&engine, account(1, 10), None);
    let holder = engine.begin(true);
    let exclusive = Template::read(by_id(1))
        .with_xtn(holder)
        .with_modifiers(Modifiers::new().exclusive_read_lock());
    assert!(engine.read(exclusive).unwrap().is_some());

    let other = engine.begin(true);
    let err = engine
        .take(Template::take(by_id(1)).with_xtn(other))
        .unwrap_err();
    assert!(matches!(err, SpaceError::Timeout { .. }));

    engine.abort(holder).unwrap();
    assert!(engine
        .take(Template::take(by_id(1)).with_xtn(other))
        .unwrap()
        .is_some());
    engine.commit(other).unwrap();
    assert!(engine.read(Template::read(by_id(1))).unwrap().is_none());
}

// ============================================================================
// Blocking and wake-up
// ============================================================================

#[test]
fn test_blocked_take_wakes_on_abort() {
    let engine = engine();
    write(&engine, account(1, 10), None);
    let xtn = engine.begin(true);
    assert!(engine
        .take(Template::take(by_id(1)).with_xtn(xtn))
        .unwrap()
        .is_some());

    let waiter = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            engine.take(Template::take(by_id(1)).with_timeout(Duration::from_secs(5)))
        })
    };
    wait_for_pending(&engine, 1);
    engine.abort(xtn).unwrap();

    let taken = waiter.join().unwrap().unwrap().unwrap();
    assert_eq!(taken.get("balance"), Some(&Value::from(10)));
}

#[test]
fn test_blocked_take_by_uid_gives_up_when_entry_is_taken() {
    let engine = engine();
    let uid = write(&engine, account(1, 10), None);
    let xtn = engine.begin(true);
    engine
        .take(Template::take(Selector::ByUid(uid.clone())).with_xtn(xtn))
        .unwrap();

    let started = Instant::now();
    let waiter = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            engine.take(Template::take(Selector::ByUid(uid)).with_timeout(Duration::from_secs(5)))
        })
    };
    wait_for_pending(&engine, 1);
    engine.commit(xtn).unwrap();

    assert!(waiter.join().unwrap().unwrap().is_none());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_blocked_take_times_out_on_held_lock() {
    let engine = engine();
    write(&engine, account(1, 10), None);
    let xtn = engine.begin(true);
    engine
        .take(Template::take(by_id(1)).with_xtn(xtn))
        .unwrap();

    let err = engine
        .take(Template::take(by_id(1)).with_timeout(Duration::from_millis(40)))
        .unwrap_err();
    match err {
        SpaceError::Timeout { uid, waited_ms } => {
            assert!(uid.is_some());
            assert!(waited_ms >= 30);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(engine.stats().pending_templates, 0);
    engine.abort(xtn).unwrap();
}

#[test]
fn test_termination_cancels_pending_templates_of_the_transaction() {
    let engine = engine();
    write(&engine, account(1, 10), None);
    let holder = engine.begin(true);
    engine
        .take(Template::take(by_id(1)).with_xtn(holder))
        .unwrap();

    let blocked = engine.begin(true);
    let completion = engine.submit(
        Template::take(by_id(1))
            .with_xtn(blocked)
            .with_timeout(Duration::from_secs(5)),
    );
    assert!(!completion.is_complete());
    engine.abort(blocked).unwrap();

    let err = completion.wait().unwrap_err();
    assert!(matches!(err, SpaceError::TransactionNotActive { .. }));
    engine.abort(holder).unwrap();
}

// ============================================================================
// Write after take
// ============================================================================

#[test]
fn test_write_after_take_in_same_transaction_becomes_update() {
    let engine = engine();
    write(&engine, account(1, 10), None);
    let xtn = engine.begin(true);
    engine
        .take(Template::take(by_id(1)).with_xtn(xtn))
        .unwrap()
        .unwrap();

    let written = engine
        .write(account(1, 20), Some(xtn), None, Modifiers::new())
        .unwrap();
    assert!(written.fused_update);
    assert_eq!(written.version, 2);

    engine.commit(xtn).unwrap();
    let entry = engine.read(Template::read(by_id(1))).unwrap().unwrap();
    assert_eq!(entry.get("balance"), Some(&Value::from(20)));
}

// ============================================================================
// Two-phase commit and replication
// ============================================================================

#[test]
fn test_prepare_replicates_once_and_commit_reports_its_level() {
    let replication = Arc::new(RecordingReplication::with_level(2));
    let engine = engine_with(Collaborators {
        replication: replication.clone(),
        ..Collaborators::default()
    });
    let xtn = engine.begin(false);
    write(&engine, account(1, 10), Some(xtn));
    write(&engine, account(2, 20), Some(xtn));

    assert_eq!(engine.prepare(xtn).unwrap(), 2);
    assert_eq!(engine.commit(xtn).unwrap(), 2);

    let submitted = replication.submitted();
    assert_eq!(submitted.len(), 1);
    match &submitted[0] {
        Mutation::Transaction { mutations, .. } => assert_eq!(mutations.len(), 2),
        other => panic!("expected a transaction bundle, got {other:?}"),
    }
}

#[test]
fn test_failed_prepare_leaves_abort_as_the_only_way_out() {
    let replication = Arc::new(RecordingReplication::with_level(1));
    let engine = engine_with(Collaborators {
        replication: replication.clone(),
        ..Collaborators::default()
    });
    let xtn = engine.begin(false);
    write(&engine, account(1, 10), Some(xtn));

    replication.reject(true);
    assert!(matches!(
        engine.prepare(xtn),
        Err(SpaceError::Replication { .. })
    ));
    assert!(matches!(
        engine.commit(xtn),
        Err(SpaceError::TransactionNotActive { .. })
    ));
    engine.abort(xtn).unwrap();
    assert!(engine.read(Template::read(by_id(1))).unwrap().is_none());
}

#[test]
fn test_prepared_take_rolled_back_after_concurrent_read_restores_entry() {
    let engine = engine();
    write(&engine, account(1, 10), None);
    let xtn = engine.begin(true);
    engine
        .take(Template::take(by_id(1)).with_xtn(xtn))
        .unwrap()
        .unwrap();
    engine.prepare(xtn).unwrap();

    // a prepared single-participant take reads as committed
    assert!(engine.read(Template::read(by_id(1))).unwrap().is_none());

    engine.abort(xtn).unwrap();
    assert_eq!(balance(&engine, Template::read(by_id(1))), Some(Value::from(10)));
    assert_eq!(engine.stats().entries, 1);
}

/// Holds every non-transactional update until released
struct GatedReplication {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl ReplicationSink for GatedReplication {
    fn submit(&self, mutation: &Mutation) -> gridspace_core::Result<u32> {
        if matches!(mutation, Mutation::Update { .. }) {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
        }
        Ok(1)
    }
}

#[test]
fn test_slow_replication_does_not_stall_other_commits() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let engine = engine_with(Collaborators {
        replication: Arc::new(GatedReplication {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }),
        ..Collaborators::default()
    });
    write(&engine, account(1, 10), None);
    write(&engine, account(2, 20), None);
    let xtn = engine.begin(true);
    update(&engine, account(2, 25), xtn);

    let updater = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            engine
                .update(
                    account(1, 99),
                    None,
                    None,
                    Modifiers::new(),
                    UpdateSource::Local,
                    Duration::ZERO,
                )
                .unwrap();
        })
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let committer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let _ = done_tx.send(engine.commit(xtn));
        })
    };
    let committed = done_rx.recv_timeout(Duration::from_secs(2));
    release_tx.send(()).unwrap();
    updater.join().unwrap();
    committer.join().unwrap();

    assert!(committed.expect("commit stalled behind replication").is_ok());
    assert_eq!(balance(&engine, Template::read(by_id(1))), Some(Value::from(99)));
    assert_eq!(balance(&engine, Template::read(by_id(2))), Some(Value::from(25)));
}

#[test]
fn test_read_only_transaction_replicates_nothing() {
    let replication = Arc::new(RecordingReplication::with_level(1));
    let engine = engine_with(Collaborators {
        replication: replication.clone(),
        ..Collaborators::default()
    });
    write(&engine, account(1, 10), None);
    let xtn = engine.begin(true);
    engine
        .read(Template::read(by_id(1)).with_xtn(xtn))
        .unwrap();
    assert_eq!(engine.commit(xtn).unwrap(), 0);
    // only the non-transactional write
    assert_eq!(replication.submitted().len(), 1);
}
