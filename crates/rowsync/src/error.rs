//! Error types.

use thiserror::Error;

use crate::backend::PersistOp;
use crate::source::{RowId, RowState};

/// Everything that can go wrong while the source dispatches a mutation or the
/// engine handles one.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A row was staged while another staged row's instance is still pending.
    #[error("cannot stage {staged}: instance for staged {pending} is still pending")]
    ConcurrentStaging { pending: RowId, staged: RowId },

    /// An event referenced a row that has no instance where one is required.
    #[error("{event} for {row} has no matching model instance")]
    OrphanRow { row: RowId, event: &'static str },

    /// The persistence backend rejected a write.
    #[error("{op} failed for {row}: {source}")]
    Persistence {
        op: PersistOp,
        row: RowId,
        #[source]
        source: anyhow::Error,
    },

    /// A field mutator refused the proposed value.
    #[error("column {column}: {source}")]
    Field {
        column: String,
        #[source]
        source: FieldError,
    },

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("unknown row: {0}")]
    UnknownRow(RowId),

    /// The row is in a state that does not allow the operation.
    #[error("cannot {operation} {row} in state {state}")]
    InvalidRowState {
        row: RowId,
        state: RowState,
        operation: &'static str,
    },

    #[error("duplicate column: {0}")]
    DuplicateColumn(String),

    /// A second instance was added for a row that already has one.
    #[error("{0} already has a model instance")]
    DuplicateInstance(RowId),

    /// A persisted source column has no persisted field in the record schema.
    #[error("persisted column {0} has no persisted field in the record schema")]
    UnmappedColumn(String),

    /// Echoed writes did not converge.
    #[error("echo depth {depth} exceeded while writing {column} on {row}")]
    EchoLimitExceeded {
        row: RowId,
        column: String,
        depth: usize,
    },

    /// A listener panicked while holding its lock.
    #[error("table listener lock poisoned")]
    ListenerPoisoned,
}

/// Errors raised by typed field conversion and by record mutators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("value {value} out of range for {target}")]
    OutOfRange { value: String, target: &'static str },

    /// Domain validation in a hand-written mutator.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Result type alias for source and engine operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
