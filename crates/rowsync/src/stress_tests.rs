//! Randomized operation sequences against a table with an attached engine.
//!
//! A shadow model tracks which rows are committed and what each holds, so the
//! exact number of backend calls every operation should cause is known.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::{
    field_accessors, Column, MemoryBackend, PersistOp, RecordSchema, RowId, SyncEngine,
    SyncError, SyncHandle, TabularSource, Value,
};

#[derive(Debug, Clone, Default)]
struct Item {
    label: Option<String>,
}

type Handle = SyncHandle<Item, Arc<MemoryBackend<Item>>>;

const LABELS: [Option<&str>; 4] = [None, Some("red"), Some("green"), Some("blue")];

fn label(rng: &mut fastrand::Rng) -> Value {
    Value::from(LABELS[rng.usize(..LABELS.len())])
}

struct Harness {
    source: TabularSource,
    handle: Handle,
    backend: Arc<MemoryBackend<Item>>,
    committed: BTreeMap<RowId, Value>,
    pending: Option<RowId>,
    expected: [usize; 3],
}

impl Harness {
    fn new() -> Self {
        let (get, set) = field_accessors!(Item, label);
        let schema = RecordSchema::builder("items")
            .field("label", get, set)
            .build()
            .unwrap();
        let mut source = TabularSource::new(
            "items",
            vec![Column::persisted("label"), Column::transient("checked")],
        )
        .unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let handle = SyncEngine::builder(schema, Arc::clone(&backend))
            .attach(&mut source)
            .unwrap();

        Self {
            source,
            handle,
            backend,
            committed: BTreeMap::new(),
            pending: None,
            expected: [0; 3],
        }
    }

    fn expect_call(&mut self, op: PersistOp) {
        let slot = match op {
            PersistOp::Insert => 0,
            PersistOp::Update => 1,
            PersistOp::Delete => 2,
        };
        self.expected[slot] += 1;
    }

    fn pick_committed(&self, rng: &mut fastrand::Rng) -> Option<RowId> {
        if self.committed.is_empty() {
            return None;
        }
        self.committed.keys().nth(rng.usize(..self.committed.len())).copied()
    }

    fn step(&mut self, rng: &mut fastrand::Rng) {
        let staged = self.pending;
        match rng.u8(..7) {
            0 => match staged {
                Some(pending) => {
                    let err = self.source.new_row().unwrap_err();
                    assert!(
                        matches!(err, SyncError::ConcurrentStaging { pending: p, .. } if p == pending)
                    );
                }
                None => self.pending = Some(self.source.new_row().unwrap()),
            },
            1 => {
                if let Some(row) = self.pending {
                    self.source.set_field(row, "label", label(rng)).unwrap();
                }
            }
            2 => {
                if let Some(row) = self.pending.take() {
                    self.source.commit_row(row).unwrap();
                    let value = self.source.get_field(row, "label").unwrap().clone();
                    self.committed.insert(row, value);
                    self.expect_call(PersistOp::Insert);
                }
            }
            3 => {
                if let Some(row) = self.pick_committed(rng) {
                    let proposed = label(rng);
                    let current = &self.committed[&row];
                    if current.differs_from(&proposed) {
                        self.expect_call(PersistOp::Update);
                    }
                    self.source.set_field(row, "label", proposed.clone()).unwrap();
                    self.committed.insert(row, proposed);
                }
            }
            4 => {
                if let Some(row) = self.pick_committed(rng) {
                    self.source.remove_row(row).unwrap();
                    self.committed.remove(&row);
                    self.expect_call(PersistOp::Delete);
                }
            }
            5 => {
                if let Some(row) = self.pending.take() {
                    self.source.remove_row(row).unwrap();
                }
            }
            _ => {
                if let Some(row) = self.pick_committed(rng) {
                    self.source
                        .set_field(row, "checked", Value::Bool(rng.bool()))
                        .unwrap();
                }
                if rng.u8(..10) == 0 {
                    self.source.accept_changes().unwrap();
                }
            }
        }
    }

    fn check(&self) {
        let engine = self.handle.lock().unwrap();

        let live: HashSet<RowId> = self.source.rows().collect();
        let members: Vec<RowId> = engine.collection().rows().collect();
        let member_set: HashSet<RowId> = members.iter().copied().collect();
        assert_eq!(member_set.len(), members.len(), "duplicate instance");
        assert_eq!(live, member_set, "rows and instances diverged");

        for instance in engine.collection().iter() {
            let in_table = self.source.get_field(instance.row(), "label").unwrap();
            let on_record = Value::from(instance.record().label.clone());
            assert_eq!(in_table, &on_record, "field mirror diverged for {}", instance.row());
        }

        assert_eq!(engine.pending().map(|p| p.row()), self.pending);

        let actual = [
            self.backend.count(PersistOp::Insert),
            self.backend.count(PersistOp::Update),
            self.backend.count(PersistOp::Delete),
        ];
        assert_eq!(actual, self.expected, "backend call counts");
    }
}

#[test]
fn stress_random_sequences_keep_rows_and_instances_in_step() {
    for seed in 0..32 {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut harness = Harness::new();

        for _ in 0..400 {
            harness.step(&mut rng);
            harness.check();
        }
    }
}

#[test]
fn stress_repeated_identical_writes_never_update() {
    let mut harness = Harness::new();
    let row = harness.source.new_row().unwrap();
    harness.source.set_field(row, "label", Value::from("red")).unwrap();
    harness.source.commit_row(row).unwrap();

    for _ in 0..1_000 {
        harness.source.set_field(row, "label", Value::from("red")).unwrap();
    }

    assert_eq!(harness.backend.count(PersistOp::Insert), 1);
    assert_eq!(harness.backend.count(PersistOp::Update), 0);
}
