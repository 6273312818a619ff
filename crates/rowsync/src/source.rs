//! The tabular source and its event contract.
//!
//! [`TabularSource`] owns rows and columns. Every mutation is announced to the
//! subscribed [`TableListener`]s synchronously, before (field changes) or right
//! after (commits, removals) the source applies it:
//!
//! ```text
//! new_row()      ─► NewRowStaged { row }                 row is Detached
//! set_field()    ─► FieldChanged { row, column, .. }     value stored after
//! commit_row()   ─► RowCommitted { row, Add }            row is Added
//! remove_row()   ─► RowRemoved { row, prior }            row is Deleted/dropped
//! ```
//!
//! A listener never gets `&mut` access to the source. If handling an event
//! requires writing back into the table, the listener returns the write as a
//! [`FieldEcho`] and the source applies it as an ordinary `set_field`, which
//! fires `FieldChanged` again. Echo chains are cut off at `max_echo_depth`.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use crate::error::{SyncError, SyncResult};
use crate::value::Value;

pub const DEFAULT_MAX_ECHO_DEPTH: usize = 8;

/// Opaque row handle. Identity is the handle, never the row's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(u64);

impl RowId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    /// Staged, not yet part of the table.
    Detached,
    /// Committed since the last `accept_changes`.
    Added,
    Unchanged,
    Modified,
    /// Removed; kept until `accept_changes` purges it.
    Deleted,
}

impl RowState {
    /// Committed and not deleted.
    pub fn is_live(self) -> bool {
        matches!(self, RowState::Added | RowState::Unchanged | RowState::Modified)
    }
}

impl fmt::Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RowState::Detached => "detached",
            RowState::Added => "added",
            RowState::Unchanged => "unchanged",
            RowState::Modified => "modified",
            RowState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    name: String,
    persisted: bool,
}

impl Column {
    /// A column whose writes must reach the persistence backend.
    pub fn persisted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persisted: true,
        }
    }

    /// A display-only column.
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persisted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }
}

#[derive(Debug, Clone)]
struct Row {
    state: RowState,
    values: Vec<Value>,
}

/// What a committed row event means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    /// A staged row was added to the table.
    Add,
    /// Pending changes on the row were accepted.
    Accept,
}

/// A mutation announced by the source.
#[derive(Debug, Clone, Copy)]
pub enum TableEvent<'a> {
    NewRowStaged {
        row: RowId,
    },
    FieldChanged {
        row: RowId,
        state: RowState,
        column: &'a Column,
        proposed: &'a Value,
    },
    RowCommitted {
        row: RowId,
        action: RowAction,
    },
    RowRemoved {
        row: RowId,
        prior: RowState,
    },
}

impl TableEvent<'_> {
    pub fn row(&self) -> RowId {
        match self {
            TableEvent::NewRowStaged { row }
            | TableEvent::FieldChanged { row, .. }
            | TableEvent::RowCommitted { row, .. }
            | TableEvent::RowRemoved { row, .. } => *row,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TableEvent::NewRowStaged { .. } => "new_row_staged",
            TableEvent::FieldChanged { .. } => "field_changed",
            TableEvent::RowCommitted { .. } => "row_committed",
            TableEvent::RowRemoved { .. } => "row_removed",
        }
    }
}

/// A write a listener wants made back into the table.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEcho {
    pub row: RowId,
    pub column: String,
    pub value: Value,
}

/// A listener's answer to an event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reaction {
    echoes: SmallVec<[FieldEcho; 1]>,
}

impl Reaction {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn echo(&mut self, row: RowId, column: impl Into<String>, value: Value) {
        self.echoes.push(FieldEcho {
            row,
            column: column.into(),
            value,
        });
    }

    pub fn echoes(&self) -> &[FieldEcho] {
        &self.echoes
    }

    pub fn is_empty(&self) -> bool {
        self.echoes.is_empty()
    }
}

/// Receives every event a [`TabularSource`] emits.
///
/// An error aborts the mutation that triggered the event and is returned to
/// whoever called the source.
pub trait TableListener: Send {
    fn on_event(&mut self, event: &TableEvent<'_>) -> SyncResult<Reaction>;
}

/// How listeners are held by the source.
pub type SharedListener = Arc<Mutex<dyn TableListener>>;

/// A mutable, row-oriented table that announces its mutations.
pub struct TabularSource {
    name: String,
    columns: Vec<Column>,
    column_index: HashMap<String, usize>,
    rows: HashMap<RowId, Row>,
    // Committed rows in table order, deleted ones included until accepted.
    order: Vec<RowId>,
    next_id: u64,
    listeners: Vec<SharedListener>,
    max_echo_depth: usize,
}

impl TabularSource {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> SyncResult<Self> {
        let mut column_index = HashMap::with_capacity(columns.len());
        for (pos, column) in columns.iter().enumerate() {
            if column_index.insert(column.name.clone(), pos).is_some() {
                return Err(SyncError::DuplicateColumn(column.name.clone()));
            }
        }

        Ok(Self {
            name: name.into(),
            columns,
            column_index,
            rows: HashMap::new(),
            order: Vec::new(),
            next_id: 1,
            listeners: Vec::new(),
            max_echo_depth: DEFAULT_MAX_ECHO_DEPTH,
        })
    }

    pub fn with_max_echo_depth(mut self, depth: usize) -> Self {
        self.max_echo_depth = depth;
        self
    }

    pub fn set_max_echo_depth(&mut self, depth: usize) {
        self.max_echo_depth = depth;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.column_index.get(name).map(|&pos| &self.columns[pos])
    }

    /// Register a listener. Listeners stay subscribed for the source's lifetime.
    pub fn subscribe(&mut self, listener: SharedListener) {
        self.listeners.push(listener);
    }

    /// State of a row, `None` once it has been dropped or purged.
    pub fn row_state(&self, row: RowId) -> Option<RowState> {
        self.rows.get(&row).map(|r| r.state)
    }

    /// Live (committed, not deleted) rows in table order.
    pub fn rows(&self) -> impl Iterator<Item = RowId> + '_ {
        self.order
            .iter()
            .copied()
            .filter(|id| self.rows.get(id).is_some_and(|r| r.state.is_live()))
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.rows().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_field(&self, row: RowId, column: &str) -> SyncResult<&Value> {
        let pos = self.column_pos(column)?;
        let row = self.rows.get(&row).ok_or(SyncError::UnknownRow(row))?;
        Ok(&row.values[pos])
    }

    /// Add an already persisted row without announcing it.
    ///
    /// Columns not named in `values` start out null.
    pub fn load_row<I, S>(&mut self, values: I) -> SyncResult<RowId>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        let mut row = Row {
            state: RowState::Unchanged,
            values: vec![Value::Null; self.columns.len()],
        };
        for (column, value) in values {
            let pos = self.column_pos(column.as_ref())?;
            row.values[pos] = value;
        }

        let id = self.allocate_id();
        self.rows.insert(id, row);
        self.order.push(id);
        Ok(id)
    }

    /// Stage a new, empty row. It stays Detached until [`commit_row`].
    ///
    /// [`commit_row`]: TabularSource::commit_row
    pub fn new_row(&mut self) -> SyncResult<RowId> {
        let id = self.allocate_id();
        self.rows.insert(
            id,
            Row {
                state: RowState::Detached,
                values: vec![Value::Null; self.columns.len()],
            },
        );

        if let Err(e) = self.emit(&TableEvent::NewRowStaged { row: id }) {
            self.rows.remove(&id);
            return Err(e);
        }

        debug!(table = %self.name, row = %id, "staged new row");
        Ok(id)
    }

    /// Propose a value for one field.
    ///
    /// Listeners see the proposed value first; it is stored only if every
    /// listener accepts it. Echoes returned by listeners are applied next.
    pub fn set_field(&mut self, row: RowId, column: &str, value: Value) -> SyncResult<()> {
        let pos = self.column_pos(column)?;
        self.set_field_at(row, pos, value, 0)
    }

    fn set_field_at(
        &mut self,
        row: RowId,
        pos: usize,
        value: Value,
        depth: usize,
    ) -> SyncResult<()> {
        if depth > self.max_echo_depth {
            return Err(SyncError::EchoLimitExceeded {
                row,
                column: self.columns[pos].name.clone(),
                depth,
            });
        }

        let state = self.rows.get(&row).ok_or(SyncError::UnknownRow(row))?.state;
        if state == RowState::Deleted {
            return Err(SyncError::InvalidRowState {
                row,
                state,
                operation: "set a field on",
            });
        }

        let reaction = self.emit(&TableEvent::FieldChanged {
            row,
            state,
            column: &self.columns[pos],
            proposed: &value,
        })?;

        if let Some(stored) = self.rows.get_mut(&row) {
            stored.values[pos] = value;
            if stored.state == RowState::Unchanged {
                stored.state = RowState::Modified;
            }
        }

        for echo in reaction.echoes {
            trace!(row = %echo.row, column = %echo.column, depth = depth + 1, "applying echo");
            let echo_pos = self.column_pos(&echo.column)?;
            self.set_field_at(echo.row, echo_pos, echo.value, depth + 1)?;
        }

        Ok(())
    }

    /// Finalize a staged row into the table.
    ///
    /// If a listener rejects the commit the row stays staged.
    pub fn commit_row(&mut self, row: RowId) -> SyncResult<()> {
        let stored = self.rows.get_mut(&row).ok_or(SyncError::UnknownRow(row))?;
        if stored.state != RowState::Detached {
            return Err(SyncError::InvalidRowState {
                row,
                state: stored.state,
                operation: "commit",
            });
        }
        stored.state = RowState::Added;
        self.order.push(row);

        let result = self.emit(&TableEvent::RowCommitted {
            row,
            action: RowAction::Add,
        });

        // Only a backend failure leaves the row committed: the instance was
        // already promoted by then.
        if let Err(e) = result {
            if !matches!(e, SyncError::Persistence { .. }) {
                if let Some(stored) = self.rows.get_mut(&row) {
                    stored.state = RowState::Detached;
                }
                self.order.retain(|id| *id != row);
            }
            return Err(e);
        }

        debug!(table = %self.name, row = %row, "committed row");
        Ok(())
    }

    /// Remove a row. A staged row is dropped outright; a committed row is
    /// marked Deleted.
    pub fn remove_row(&mut self, row: RowId) -> SyncResult<()> {
        let prior = self.rows.get(&row).ok_or(SyncError::UnknownRow(row))?.state;
        match prior {
            RowState::Deleted => {
                return Err(SyncError::InvalidRowState {
                    row,
                    state: prior,
                    operation: "remove",
                })
            }
            RowState::Detached => {
                self.rows.remove(&row);
            }
            _ => {
                if let Some(stored) = self.rows.get_mut(&row) {
                    stored.state = RowState::Deleted;
                }
            }
        }

        debug!(table = %self.name, row = %row, prior = %prior, "removed row");
        self.emit(&TableEvent::RowRemoved { row, prior })?;
        Ok(())
    }

    /// Mark every Added/Modified row Unchanged and purge Deleted rows.
    pub fn accept_changes(&mut self) -> SyncResult<()> {
        let mut accepted = Vec::new();
        for id in &self.order {
            if let Some(row) = self.rows.get_mut(id) {
                if matches!(row.state, RowState::Added | RowState::Modified) {
                    row.state = RowState::Unchanged;
                    accepted.push(*id);
                }
            }
        }

        self.rows.retain(|_, row| row.state != RowState::Deleted);
        self.order.retain(|id| self.rows.contains_key(id));

        for row in accepted {
            self.emit(&TableEvent::RowCommitted {
                row,
                action: RowAction::Accept,
            })?;
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> RowId {
        let id = RowId(self.next_id);
        self.next_id += 1;
        id
    }

    fn column_pos(&self, name: &str) -> SyncResult<usize> {
        self.column_index
            .get(name)
            .copied()
            .ok_or_else(|| SyncError::UnknownColumn(name.to_string()))
    }

    fn emit(&self, event: &TableEvent<'_>) -> SyncResult<Reaction> {
        let mut merged = Reaction::none();
        for listener in &self.listeners {
            let mut guard = listener.lock().map_err(|_| SyncError::ListenerPoisoned)?;
            let reaction = guard.on_event(event)?;
            merged.echoes.extend(reaction.echoes);
        }
        Ok(merged)
    }
}

impl fmt::Debug for TabularSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabularSource")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("rows", &self.rows.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
