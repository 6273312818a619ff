//! The synchronization engine.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::backend::{PersistOp, PersistenceBackend};
use crate::collection::{Instance, ModelCollection};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::schema::RecordSchema;
use crate::source::{
    Column, Reaction, RowAction, RowId, RowState, TableEvent, TableListener, TabularSource,
};
use crate::value::Value;

/// Keeps a [`ModelCollection`] and a [`PersistenceBackend`] in step with the
/// rows of one [`TabularSource`].
///
/// Committed rows and collection members are kept in a one-to-one mapping
/// after every event. A staged row gets a pending instance that joins the
/// collection, and reaches the backend, only when the row is committed.
///
/// Field changes are written through only when the proposed value differs
/// from what the record already holds. That comparison is what stops a
/// setter that writes its own normalized value back into the table from
/// producing another update.
pub struct SyncEngine<R, B> {
    schema: Arc<RecordSchema<R>>,
    backend: B,
    collection: ModelCollection<R>,
    pending: Option<Instance<R>>,
    config: SyncConfig,
}

impl<R, B> SyncEngine<R, B> {
    pub fn collection(&self) -> &ModelCollection<R> {
        &self.collection
    }

    /// The instance of the currently staged row, if any.
    pub fn pending(&self) -> Option<&Instance<R>> {
        self.pending.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn schema(&self) -> &RecordSchema<R> {
        &self.schema
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

impl<R, B> SyncEngine<R, B>
where
    R: Default + Send + 'static,
    B: PersistenceBackend<R> + 'static,
{
    pub fn builder(
        schema: impl Into<Arc<RecordSchema<R>>>,
        backend: B,
    ) -> SyncEngineBuilder<R, B> {
        SyncEngineBuilder {
            schema: schema.into(),
            backend,
            initial: Vec::new(),
            config: SyncConfig::default(),
        }
    }

    fn on_new_row_staged(&mut self, row: RowId) -> SyncResult<()> {
        if let Some(pending) = &self.pending {
            return Err(SyncError::ConcurrentStaging {
                pending: pending.row(),
                staged: row,
            });
        }

        self.pending = Some(Instance::new(row, R::default()));
        debug!(row = %row, "created pending instance");
        Ok(())
    }

    fn on_field_changed(
        &mut self,
        row: RowId,
        state: RowState,
        column: &Column,
        proposed: &Value,
    ) -> SyncResult<Reaction> {
        let instance = if state == RowState::Detached {
            match self.pending.as_mut() {
                Some(pending) if pending.row() == row => pending,
                _ => {
                    return Err(SyncError::OrphanRow {
                        row,
                        event: "field change",
                    })
                }
            }
        } else {
            self.collection
                .find_by_row_mut(row)
                .ok_or(SyncError::OrphanRow {
                    row,
                    event: "field change",
                })?
        };

        let Some(accessor) = self.schema.accessor(column.name()) else {
            trace!(row = %row, column = column.name(), "column not mapped on record");
            return Ok(Reaction::none());
        };

        let old = accessor.get(instance.record());
        accessor
            .set(instance.record_mut(), proposed.clone())
            .map_err(|source| SyncError::Field {
                column: column.name().to_string(),
                source,
            })?;

        let mut reaction = Reaction::none();
        if self.config.echo_normalized {
            let accepted = accessor.get(instance.record());
            if accepted.differs_from(proposed) {
                trace!(
                    row = %row,
                    column = column.name(),
                    value = %accepted,
                    "echoing normalized value"
                );
                reaction.echo(row, column.name(), accepted);
            }
        }

        if state == RowState::Detached || !column.is_persisted() {
            return Ok(reaction);
        }

        if !old.differs_from(proposed) {
            trace!(row = %row, column = column.name(), "value unchanged, skipping update");
            return Ok(reaction);
        }

        debug!(
            row = %row,
            column = column.name(),
            old = %old,
            new = %proposed,
            "persisting field change"
        );
        self.backend
            .update(instance.record())
            .map_err(|source| SyncError::Persistence {
                op: PersistOp::Update,
                row,
                source,
            })?;

        Ok(reaction)
    }

    fn on_row_committed(&mut self, row: RowId, action: RowAction) -> SyncResult<()> {
        if action != RowAction::Add {
            trace!(row = %row, ?action, "ignoring commit action");
            return Ok(());
        }

        if self.collection.contains_row(row) {
            return Err(SyncError::DuplicateInstance(row));
        }

        let instance = match self.pending.take() {
            Some(pending) if pending.row() == row => pending,
            other => {
                self.pending = other;
                return Err(SyncError::OrphanRow {
                    row,
                    event: "row commit",
                });
            }
        };

        let members = self.collection.len() + 1;
        let added = self.collection.add(instance)?;
        debug!(row = %row, members, "promoted pending instance");

        self.backend
            .insert(added.record())
            .map_err(|source| SyncError::Persistence {
                op: PersistOp::Insert,
                row,
                source,
            })
    }

    fn on_row_removed(&mut self, row: RowId) -> SyncResult<()> {
        if self.pending.as_ref().is_some_and(|p| p.row() == row) {
            self.pending = None;
            debug!(row = %row, "discarded pending instance");
            return Ok(());
        }

        let Some(removed) = self.collection.remove_by_row(row) else {
            debug!(row = %row, "no instance for removed row");
            return Ok(());
        };

        debug!(row = %row, members = self.collection.len(), "evicted instance");
        self.backend
            .delete(removed.record())
            .map_err(|source| SyncError::Persistence {
                op: PersistOp::Delete,
                row,
                source,
            })
    }
}

impl<R, B> TableListener for SyncEngine<R, B>
where
    R: Default + Send + 'static,
    B: PersistenceBackend<R> + 'static,
{
    fn on_event(&mut self, event: &TableEvent<'_>) -> SyncResult<Reaction> {
        match *event {
            TableEvent::NewRowStaged { row } => {
                self.on_new_row_staged(row).map(|_| Reaction::none())
            }
            TableEvent::FieldChanged {
                row,
                state,
                column,
                proposed,
            } => self.on_field_changed(row, state, column, proposed),
            TableEvent::RowCommitted { row, action } => {
                self.on_row_committed(row, action).map(|_| Reaction::none())
            }
            TableEvent::RowRemoved { row, .. } => {
                self.on_row_removed(row).map(|_| Reaction::none())
            }
        }
    }
}

/// Wires an engine to a source.
pub struct SyncEngineBuilder<R, B> {
    schema: Arc<RecordSchema<R>>,
    backend: B,
    initial: Vec<R>,
    config: SyncConfig,
}

impl<R, B> SyncEngineBuilder<R, B>
where
    R: Default + Send + 'static,
    B: PersistenceBackend<R> + 'static,
{
    /// Records that already exist in the backend. Each is loaded into the
    /// source as an unchanged row when the engine attaches.
    pub fn with_records(mut self, records: impl IntoIterator<Item = R>) -> Self {
        self.initial.extend(records);
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the schema against the source, load the initial records and
    /// subscribe. The engine stays subscribed for the source's lifetime.
    pub fn attach(self, source: &mut TabularSource) -> SyncResult<SyncHandle<R, B>> {
        let schema = self.schema;

        for column in source.columns() {
            let mapped = schema
                .accessor(column.name())
                .is_some_and(|accessor| accessor.is_persisted());
            if column.is_persisted() && !mapped {
                return Err(SyncError::UnmappedColumn(column.name().to_string()));
            }
        }

        source.set_max_echo_depth(self.config.max_echo_depth);

        let mut collection = ModelCollection::new();
        for record in self.initial {
            let values: Vec<(String, Value)> = source
                .columns()
                .iter()
                .filter_map(|column| {
                    schema
                        .accessor(column.name())
                        .map(|accessor| (column.name().to_string(), accessor.get(&record)))
                })
                .collect();
            let row = source.load_row(values)?;
            collection.add(Instance::new(row, record))?;
        }

        debug!(table = source.name(), loaded = collection.len(), "attaching sync engine");

        let engine = SyncEngine {
            schema,
            backend: self.backend,
            collection,
            pending: None,
            config: self.config,
        };
        let handle = SyncHandle {
            inner: Arc::new(Mutex::new(engine)),
        };
        source.subscribe(handle.inner.clone());
        Ok(handle)
    }
}

/// Shared handle to an attached engine.
///
/// The source locks the same mutex around every event, so holding the guard
/// returned by [`lock`](SyncHandle::lock) while mutating the source deadlocks.
pub struct SyncHandle<R, B> {
    inner: Arc<Mutex<SyncEngine<R, B>>>,
}

impl<R, B> Clone for SyncHandle<R, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, B> SyncHandle<R, B> {
    pub fn lock(&self) -> SyncResult<MutexGuard<'_, SyncEngine<R, B>>> {
        self.inner.lock().map_err(|_| SyncError::ListenerPoisoned)
    }

    /// Run `f` against the engine under its lock.
    pub fn with<T>(&self, f: impl FnOnce(&SyncEngine<R, B>) -> T) -> SyncResult<T> {
        Ok(f(&*self.lock()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::field_accessors;
    use crate::source::Column;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Note {
        id: i64,
        title: String,
    }

    fn schema() -> RecordSchema<Note> {
        let (get_id, set_id) = field_accessors!(Note, id);
        RecordSchema::builder("notes")
            .key("id", get_id, set_id)
            .field(
                "title",
                |n| Value::from(n.title.clone()),
                |n, v| {
                    n.title = v.into_typed::<Option<String>>()?.unwrap_or_default();
                    Ok(())
                },
            )
            .build()
            .unwrap()
    }

    fn notes_table() -> TabularSource {
        TabularSource::new(
            "notes",
            vec![
                Column::persisted("id"),
                Column::persisted("title"),
                Column::transient("preview"),
            ],
        )
        .unwrap()
    }

    type Handle = SyncHandle<Note, Arc<MemoryBackend<Note>>>;

    fn attach(
        source: &mut TabularSource,
        initial: Vec<Note>,
    ) -> (Handle, Arc<MemoryBackend<Note>>) {
        let backend = Arc::new(MemoryBackend::new());
        let handle = SyncEngine::builder(schema(), Arc::clone(&backend))
            .with_records(initial)
            .attach(source)
            .unwrap();
        (handle, backend)
    }

    #[test]
    fn attach_loads_initial_records_as_unchanged_rows() {
        let mut source = notes_table();
        let (handle, backend) = attach(
            &mut source,
            vec![
                Note { id: 1, title: "a".into() },
                Note { id: 2, title: "b".into() },
            ],
        );

        let rows: Vec<RowId> = source.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(source.row_state(rows[0]), Some(RowState::Unchanged));
        assert_eq!(source.get_field(rows[1], "title").unwrap(), &Value::from("b"));

        let engine = handle.lock().unwrap();
        assert_eq!(engine.collection().rows().collect::<Vec<_>>(), rows);
        assert_eq!(backend.total(), 0);
    }

    #[test]
    fn attach_rejects_unmapped_persisted_columns() {
        let mut source = TabularSource::new(
            "notes",
            vec![Column::persisted("id"), Column::persisted("body")],
        )
        .unwrap();

        let result = SyncEngine::builder(schema(), MemoryBackend::new()).attach(&mut source);
        assert!(matches!(result, Err(SyncError::UnmappedColumn(c)) if c == "body"));
    }

    #[test]
    fn attach_applies_config_and_keeps_the_schema() {
        let mut source = notes_table();
        let handle = SyncEngine::builder(schema(), MemoryBackend::new())
            .with_config(SyncConfig::new().with_max_echo_depth(2))
            .attach(&mut source)
            .unwrap();

        let engine = handle.lock().unwrap();
        assert_eq!(engine.config().max_echo_depth, 2);
        assert_eq!(engine.schema().table(), "notes");
        assert_eq!(engine.schema().key_column(), Some("id"));
    }

    #[test]
    fn row_staged_before_attach_cannot_be_committed() {
        let mut source = notes_table();
        let early = source.new_row().unwrap();
        let (handle, backend) = attach(&mut source, vec![]);

        let err = source.commit_row(early).unwrap_err();

        assert!(matches!(err, SyncError::OrphanRow { event: "row commit", .. }));
        assert_eq!(source.row_state(early), Some(RowState::Detached));
        assert_eq!(source.rows().count(), 0);
        assert!(handle.lock().unwrap().collection().is_empty());
        assert_eq!(backend.total(), 0);

        source.remove_row(early).unwrap();
        assert_eq!(source.row_state(early), None);
    }

    #[derive(Debug, Clone, Default)]
    struct Gauge {
        score: Option<f64>,
    }

    #[test]
    fn nan_write_updates_once_and_settles() {
        let (get, set) = field_accessors!(Gauge, score);
        let schema = RecordSchema::builder("gauges").field("score", get, set).build().unwrap();
        let mut source = TabularSource::new("gauges", vec![Column::persisted("score")]).unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let _handle = SyncEngine::builder(schema, Arc::clone(&backend))
            .with_records(vec![Gauge { score: Some(1.0) }])
            .attach(&mut source)
            .unwrap();
        let row = source.rows().next().unwrap();

        source.set_field(row, "score", Value::Float(f64::NAN)).unwrap();
        source.set_field(row, "score", Value::Float(f64::NAN)).unwrap();

        assert_eq!(backend.count(PersistOp::Update), 1);
        assert!(backend.records(PersistOp::Update)[0].score.is_some_and(f64::is_nan));
    }

    #[test]
    fn transient_columns_never_reach_the_backend() {
        let mut source = notes_table();
        let (_handle, backend) = attach(&mut source, vec![Note { id: 1, title: "a".into() }]);
        let row = source.rows().next().unwrap();

        source.set_field(row, "preview", Value::from("a…")).unwrap();

        assert_eq!(backend.total(), 0);
    }

    #[test]
    fn commit_without_pending_instance_is_an_orphan() {
        let mut engine = SyncEngine {
            schema: Arc::new(schema()),
            backend: MemoryBackend::new(),
            collection: ModelCollection::new(),
            pending: None,
            config: SyncConfig::default(),
        };

        let err = engine
            .on_event(&TableEvent::RowCommitted {
                row: RowId::from_raw(4),
                action: RowAction::Add,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::OrphanRow { event: "row commit", .. }));
    }

    #[test]
    fn commit_of_a_different_row_keeps_the_pending_instance() {
        let mut engine = SyncEngine {
            schema: Arc::new(schema()),
            backend: MemoryBackend::new(),
            collection: ModelCollection::new(),
            pending: Some(Instance::new(RowId::from_raw(1), Note::default())),
            config: SyncConfig::default(),
        };

        let result = engine.on_event(&TableEvent::RowCommitted {
            row: RowId::from_raw(2),
            action: RowAction::Add,
        });

        assert!(result.is_err());
        assert_eq!(engine.pending().map(Instance::row), Some(RowId::from_raw(1)));
        assert!(engine.collection().is_empty());
    }

    #[test]
    fn removal_of_unknown_row_is_tolerated() {
        let mut engine = SyncEngine {
            schema: Arc::new(schema()),
            backend: MemoryBackend::new(),
            collection: ModelCollection::new(),
            pending: None,
            config: SyncConfig::default(),
        };

        let reaction = engine
            .on_event(&TableEvent::RowRemoved {
                row: RowId::from_raw(9),
                prior: RowState::Deleted,
            })
            .unwrap();

        assert!(reaction.is_empty());
        assert_eq!(engine.backend().total(), 0);
    }

    #[test]
    fn field_change_for_unknown_committed_row_is_an_orphan() {
        let mut engine = SyncEngine {
            schema: Arc::new(schema()),
            backend: MemoryBackend::new(),
            collection: ModelCollection::new(),
            pending: None,
            config: SyncConfig::default(),
        };
        let column = Column::persisted("title");
        let proposed = Value::from("x");

        let err = engine
            .on_event(&TableEvent::FieldChanged {
                row: RowId::from_raw(3),
                state: RowState::Modified,
                column: &column,
                proposed: &proposed,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::OrphanRow { event: "field change", .. }));
    }

    #[test]
    fn accept_events_do_not_write() {
        let mut source = notes_table();
        let (_handle, backend) = attach(&mut source, vec![]);
        let row = source.new_row().unwrap();
        source.set_field(row, "id", Value::Int(5)).unwrap();
        source.commit_row(row).unwrap();
        backend.clear();

        source.accept_changes().unwrap();

        assert_eq!(backend.total(), 0);
    }

    #[test]
    fn rejected_value_surfaces_as_field_error() {
        let mut source = notes_table();
        let (_handle, backend) = attach(&mut source, vec![Note { id: 1, title: "a".into() }]);
        let row = source.rows().next().unwrap();

        let err = source.set_field(row, "id", Value::from("one")).unwrap_err();

        assert!(matches!(err, SyncError::Field { column, .. } if column == "id"));
        assert_eq!(backend.total(), 0);
        assert_eq!(source.get_field(row, "id").unwrap(), &Value::Int(1));
    }
}
