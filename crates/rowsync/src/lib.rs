//! # rowsync
//!
//! Keeps a mutable, row-oriented table synchronized with a live collection of
//! typed records and with a persistence backend, without feedback loops and
//! with exactly one backend write per actual change.
//!
//! ## Core Concepts
//!
//! - [`TabularSource`] = the table (rows, columns, mutation events)
//! - [`ModelCollection`] = the records that mirror committed rows
//! - [`PersistenceBackend`] = where durable writes go
//! - [`SyncEngine`] = the listener that keeps the three consistent
//!
//! ## Architecture
//!
//! ```text
//! caller (grid edit, import, ...)
//!     │
//!     ▼ new_row / set_field / commit_row / remove_row
//! TabularSource ─────────────────────────────────┐
//!     │                                          │
//!     ▼ TableEvent (synchronous)                 │
//! SyncEngine.on_event()                          │
//!     │                                          │
//!     ├─► NewRowStaged  ─► pending instance      │
//!     │                                          │
//!     ├─► FieldChanged  ─► set field on record   │
//!     │                    └─► update() if the   │
//!     │                        value changed     │
//!     │                                          │
//!     ├─► RowCommitted  ─► promote pending       │
//!     │                    └─► insert()          │
//!     │                                          │
//!     └─► RowRemoved    ─► evict instance        │
//!                          └─► delete()          │
//!                                                │
//!              FieldEcho (normalized value) ─────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Bijection** - every committed, non-deleted row has exactly one
//!    instance in the collection and every instance maps back to its row
//! 2. **One pending instance** - staging a second row while one is pending
//!    fails with [`SyncError::ConcurrentStaging`]
//! 3. **No pre-commit writes** - field changes on a staged row never reach
//!    the backend; the commit produces exactly one insert
//! 4. **No redundant writes** - setting a persisted field to the value it
//!    already holds never calls `update`
//! 5. **Tolerated removal** - removing a row with no instance is a no-op
//!
//! ## Guarantees
//!
//! - **Synchronous**: every handler runs inside the call that mutated the table
//! - **No rollback**: a failed backend write leaves in-memory state as the
//!   handler produced it; the error goes back to the caller
//! - **No retries**: backend failures are surfaced once
//!
//! ## Example
//!
//! ```ignore
//! use rowsync_core::{
//!     field_accessors, Column, MemoryBackend, RecordSchema, SyncEngine, TabularSource, Value,
//! };
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Default)]
//! struct Contact {
//!     id: i64,
//!     name: String,
//! }
//!
//! let (get_id, set_id) = field_accessors!(Contact, id);
//! let (get_name, set_name) = field_accessors!(Contact, name);
//! let schema = RecordSchema::builder("contacts")
//!     .key("id", get_id, set_id)
//!     .field("name", get_name, set_name)
//!     .build()?;
//!
//! let mut table = TabularSource::new(
//!     "contacts",
//!     vec![Column::persisted("id"), Column::persisted("name")],
//! )?;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let handle = SyncEngine::builder(schema, Arc::clone(&backend)).attach(&mut table)?;
//!
//! let row = table.new_row()?;
//! table.set_field(row, "id", Value::Int(1))?;
//! table.set_field(row, "name", Value::from("Alice"))?;
//! table.commit_row(row)?;                          // one insert
//!
//! table.set_field(row, "name", Value::from("Bob"))?;  // one update
//! table.set_field(row, "name", Value::from("Bob"))?;  // nothing
//!
//! assert_eq!(handle.lock()?.collection().len(), 1);
//! ```

// Core modules
mod backend;
mod collection;
mod config;
mod engine;
mod error;
mod schema;
mod schema_macro;
mod source;
mod value;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export source types (the table and its event contract)
pub use source::{
    Column, FieldEcho, Reaction, RowAction, RowId, RowState, SharedListener, TableEvent,
    TableListener, TabularSource, DEFAULT_MAX_ECHO_DEPTH,
};

// Re-export model types
pub use collection::{Instance, ModelCollection};
pub use schema::{FieldAccessor, Getter, RecordSchema, RecordSchemaBuilder, Setter};
pub use value::{FromValue, Value};

// Re-export engine types (primary entry point)
pub use engine::{SyncEngine, SyncEngineBuilder, SyncHandle};

// Re-export persistence types
pub use backend::{MemoryBackend, PersistOp, PersistenceBackend};

// Re-export configuration
pub use config::SyncConfig;

// Re-export error types
pub use error::{FieldError, SyncError, SyncResult};
