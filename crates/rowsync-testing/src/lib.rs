//! Testing utilities for rowsync.
//!
//! - [`Contact`] and [`contact_schema`]: a small record type with one
//!   normalizing setter, used across the test suites
//! - [`FlakyBackend`]: a journaling backend that fails on demand
//! - [`assert_bijection`]: checks the row ↔ instance mapping of an engine
//! - [`Fixture`]: a table, an attached engine and its backend in one value

use anyhow::{bail, Result};
use rowsync_core::{
    field_accessors, Column, MemoryBackend, PersistOp, PersistenceBackend, RecordSchema, RowId,
    RowState, SyncConfig, SyncEngine, SyncHandle, SyncResult, TabularSource, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ============================================================================
// Contact record
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub age: Option<i64>,
}

impl Contact {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }
}

/// Schema for [`Contact`]: `id` (key), `name`, `email`, `age`.
///
/// `email` is trimmed and lowercased by its setter, so writing
/// `" Bob@Example.COM"` leaves `"bob@example.com"` on the record.
pub fn contact_schema() -> RecordSchema<Contact> {
    let (get_id, set_id) = field_accessors!(Contact, id);
    let (get_name, set_name) = field_accessors!(Contact, name);
    let (get_age, set_age) = field_accessors!(Contact, age);

    RecordSchema::builder("contacts")
        .key("id", get_id, set_id)
        .field("name", get_name, set_name)
        .field(
            "email",
            |c| Value::from(c.email.clone()),
            |c, v| {
                let email: Option<String> = v.into_typed()?;
                c.email = email.map(|e| e.trim().to_lowercase());
                Ok(())
            },
        )
        .field("age", get_age, set_age)
        .build()
        .expect("contact schema has unique fields")
}

/// Columns matching [`contact_schema`] plus a display-only `selected` column.
pub fn contacts_table() -> TabularSource {
    TabularSource::new(
        "contacts",
        vec![
            Column::persisted("id"),
            Column::persisted("name"),
            Column::persisted("email"),
            Column::persisted("age"),
            Column::transient("selected"),
        ],
    )
    .expect("contacts table has unique columns")
}

// ============================================================================
// FlakyBackend
// ============================================================================

/// Journals successful calls like [`MemoryBackend`] and fails the next call of
/// an armed kind.
pub struct FlakyBackend<R> {
    journal: MemoryBackend<R>,
    armed: Mutex<HashSet<PersistOp>>,
}

impl<R: Clone> FlakyBackend<R> {
    pub fn new() -> Self {
        Self {
            journal: MemoryBackend::new(),
            armed: Mutex::new(HashSet::new()),
        }
    }

    /// Make the next `op` call fail.
    pub fn fail_next(&self, op: PersistOp) {
        self.armed.lock().unwrap().insert(op);
    }

    pub fn journal(&self) -> &MemoryBackend<R> {
        &self.journal
    }

    fn check(&self, op: PersistOp) -> Result<()> {
        if self.armed.lock().unwrap().remove(&op) {
            bail!("simulated {op} failure");
        }
        Ok(())
    }
}

impl<R: Clone> Default for FlakyBackend<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone + Send> PersistenceBackend<R> for FlakyBackend<R> {
    fn insert(&self, record: &R) -> Result<()> {
        self.check(PersistOp::Insert)?;
        self.journal.insert(record)
    }

    fn update(&self, record: &R) -> Result<()> {
        self.check(PersistOp::Update)?;
        self.journal.update(record)
    }

    fn delete(&self, record: &R) -> Result<()> {
        self.check(PersistOp::Delete)?;
        self.journal.delete(record)
    }
}

// ============================================================================
// Assertions
// ============================================================================

/// Panics unless every live row of `source` has exactly one instance in the
/// engine's collection and every instance points at a live row. A pending
/// instance, if any, must belong to a staged row.
pub fn assert_bijection<R, B>(source: &TabularSource, handle: &SyncHandle<R, B>) {
    let engine = handle.lock().expect("engine lock poisoned");

    let live: Vec<RowId> = source.rows().collect();
    let members: Vec<RowId> = engine.collection().rows().collect();

    let unique: HashSet<RowId> = members.iter().copied().collect();
    assert_eq!(
        unique.len(),
        members.len(),
        "collection holds two instances for one row: {members:?}"
    );

    let live_set: HashSet<RowId> = live.iter().copied().collect();
    assert_eq!(
        live_set, unique,
        "live rows {live:?} do not match collection rows {members:?}"
    );

    if let Some(pending) = engine.pending() {
        assert_eq!(
            source.row_state(pending.row()),
            Some(RowState::Detached),
            "pending instance for {} is not bound to a staged row",
            pending.row()
        );
    }
}

// ============================================================================
// Fixture
// ============================================================================

/// A contacts table with an engine attached over a shared backend.
pub struct Fixture<B = MemoryBackend<Contact>> {
    pub source: TabularSource,
    pub handle: SyncHandle<Contact, Arc<B>>,
    pub backend: Arc<B>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_contacts(Vec::new())
    }

    pub fn with_contacts(contacts: Vec<Contact>) -> Self {
        Self::build(MemoryBackend::new(), contacts, SyncConfig::default())
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> Fixture<B>
where
    B: PersistenceBackend<Contact> + Sync + 'static,
{
    pub fn build(backend: B, contacts: Vec<Contact>, config: SyncConfig) -> Self {
        let mut source = contacts_table();
        let backend = Arc::new(backend);
        let handle = SyncEngine::builder(contact_schema(), Arc::clone(&backend))
            .with_records(contacts)
            .with_config(config)
            .attach(&mut source)
            .expect("contact schema covers every persisted column");
        Self {
            source,
            handle,
            backend,
        }
    }

    /// Stage a row, set `name` and commit it.
    pub fn commit_contact(&mut self, name: &str) -> SyncResult<RowId> {
        let row = self.source.new_row()?;
        self.source.set_field(row, "id", Value::Uuid(Uuid::new_v4()))?;
        self.source.set_field(row, "name", Value::from(name))?;
        self.source.commit_row(row)?;
        Ok(row)
    }

    /// The record currently mirroring `row`.
    pub fn contact(&self, row: RowId) -> Option<Contact> {
        let engine = self.handle.lock().ok()?;
        engine.collection().find_by_row(row).map(|i| i.record().clone())
    }

    pub fn members(&self) -> usize {
        self.handle
            .with(|engine| engine.collection().len())
            .expect("engine lock poisoned")
    }

    pub fn assert_bijection(&self) {
        assert_bijection(&self.source, &self.handle);
    }
}
