//! Property tests over operation sequences

use gridspace::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Step {
    Update(i64),
    Increment(i64),
    Upsert(i64),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (-100i64..100).prop_map(Step::Update),
        (-10i64..10).prop_map(Step::Increment),
        (-100i64..100).prop_map(Step::Upsert),
    ]
}

fn space() -> GridSpace {
    GridSpace::builder()
        .register_type(TypeDescriptor::new("Cell").id_property("id"))
        .open()
        .unwrap()
}

fn cell(n: i64) -> EntryPacket {
    EntryPacket::new("Cell").with_field("id", 1).with_field("n", n)
}

fn selector() -> Selector {
    Selector::by_id("Cell", 1)
}

fn n_of(entry: &EntryData) -> i64 {
    match entry.get("n") {
        Some(Value::Int(n)) => *n,
        other => panic!("unexpected n {:?}", other),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_versions_advance_by_one(steps in prop::collection::vec(step_strategy(), 1..20)) {
        let space = space();
        space.write(cell(0)).unwrap();
        let mut expected_n = 0i64;

        let run = |step: Step| -> Result<u64> {
            Ok(match step {
                Step::Update(n) => space.update(cell(n))?.entry.version,
                Step::Increment(by) => space
                    .change(selector(), ChangeSet::new().increment("n", by))?
                    .map(|r| r.entry.version)
                    .unwrap_or(0),
                Step::Upsert(n) => space.update_or_write(cell(n))?.version(),
            })
        };

        for (i, step) in steps.into_iter().enumerate() {
            expected_n = match step {
                Step::Update(n) | Step::Upsert(n) => n,
                Step::Increment(by) => expected_n + by,
            };
            let version = run(step).unwrap();
            prop_assert_eq!(version, i as u64 + 2);
        }
        let entry = space.read(selector()).unwrap().unwrap();
        prop_assert_eq!(n_of(&entry), expected_n);
    }

    #[test]
    fn prop_abort_restores_committed_content(
        initial in -100i64..100,
        updates in prop::collection::vec(-100i64..100, 1..10),
    ) {
        let space = space();
        space.write(cell(initial)).unwrap();

        let txn = space.begin();
        for n in &updates {
            txn.update(cell(*n)).unwrap();
        }
        let own = txn.read(selector()).unwrap().unwrap();
        prop_assert_eq!(n_of(&own), *updates.last().unwrap());
        txn.abort().unwrap();

        let entry = space.read(selector()).unwrap().unwrap();
        prop_assert_eq!(n_of(&entry), initial);
        prop_assert_eq!(entry.version, 1);
    }

    #[test]
    fn prop_commit_keeps_last_update(
        updates in prop::collection::vec(-100i64..100, 1..10),
    ) {
        let space = space();
        space.write(cell(0)).unwrap();

        let txn = space.begin();
        for n in &updates {
            txn.update(cell(*n)).unwrap();
        }
        txn.commit().unwrap();

        let entry = space.read(selector()).unwrap().unwrap();
        prop_assert_eq!(n_of(&entry), *updates.last().unwrap());
        prop_assert_eq!(entry.version, 1 + updates.len() as u64);
    }

    #[test]
    fn prop_failed_change_leaves_entry_untouched(
        initial in -100i64..100,
        by in -10i64..10,
    ) {
        let space = space();
        space
            .write(cell(initial).with_field("label", "text"))
            .unwrap();

        // the second mutator fails, so the first must not stick either
        let err = space
            .change(
                selector(),
                ChangeSet::new().increment("n", by).increment("label", 1),
            )
            .unwrap_err();
        prop_assert!(matches!(err, Error::ConstraintViolation(_)));

        let entry = space.read(selector()).unwrap().unwrap();
        prop_assert_eq!(n_of(&entry), initial);
        prop_assert_eq!(entry.version, 1);
    }

    #[test]
    fn prop_take_then_write_restarts_versions(rounds in 1usize..6) {
        let space = space();
        for round in 0..rounds {
            let written = space.write(cell(round as i64)).unwrap();
            prop_assert_eq!(written.version, 1);
            let taken = space.take(selector()).unwrap().unwrap();
            prop_assert_eq!(n_of(&taken), round as i64);
        }
        prop_assert!(space.read(selector()).unwrap().is_none());
    }
}
