//! The persistence capability the engine writes through.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Which backend operation a call or failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for PersistOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            PersistOp::Insert => "insert",
            PersistOp::Update => "update",
            PersistOp::Delete => "delete",
        })
    }
}

/// Durable storage for records of type `R`.
///
/// Each call receives the full current state of one record. Failures are not
/// retried by the engine; they come back to whoever mutated the table.
pub trait PersistenceBackend<R>: Send {
    fn insert(&self, record: &R) -> Result<()>;

    fn update(&self, record: &R) -> Result<()>;

    fn delete(&self, record: &R) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Arc<B> blanket: lets tests keep a handle on the backend for assertions
// ---------------------------------------------------------------------------

impl<R, B> PersistenceBackend<R> for Arc<B>
where
    B: PersistenceBackend<R> + Sync + ?Sized,
{
    fn insert(&self, record: &R) -> Result<()> {
        (**self).insert(record)
    }

    fn update(&self, record: &R) -> Result<()> {
        (**self).update(record)
    }

    fn delete(&self, record: &R) -> Result<()> {
        (**self).delete(record)
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend (tests and demos, no database required)
// ---------------------------------------------------------------------------

/// In-memory journal of every call, in call order. Thread-safe.
pub struct MemoryBackend<R> {
    calls: Mutex<Vec<(PersistOp, R)>>,
}

impl<R: Clone> MemoryBackend<R> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every recorded call with a copy of the record as it was passed.
    pub fn calls(&self) -> Vec<(PersistOp, R)> {
        self.journal().clone()
    }

    /// Records passed to one kind of call.
    pub fn records(&self, op: PersistOp) -> Vec<R> {
        self.journal()
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn count(&self, op: PersistOp) -> usize {
        self.journal().iter().filter(|(o, _)| *o == op).count()
    }

    pub fn total(&self) -> usize {
        self.journal().len()
    }

    pub fn clear(&self) {
        self.journal().clear();
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Vec<(PersistOp, R)>> {
        // The journal is append-only; a panic mid-push cannot leave it torn.
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record(&self, op: PersistOp, record: &R) -> Result<()> {
        self.journal().push((op, record.clone()));
        Ok(())
    }
}

impl<R: Clone> Default for MemoryBackend<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone + Send> PersistenceBackend<R> for MemoryBackend<R> {
    fn insert(&self, record: &R) -> Result<()> {
        self.record(PersistOp::Insert, record)
    }

    fn update(&self, record: &R) -> Result<()> {
        self.record(PersistOp::Update, record)
    }

    fn delete(&self, record: &R) -> Result<()> {
        self.record(PersistOp::Delete, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_keeps_call_order() {
        let backend = MemoryBackend::new();
        backend.insert(&"a").unwrap();
        backend.update(&"a2").unwrap();
        backend.delete(&"a2").unwrap();

        assert_eq!(
            backend.calls(),
            vec![
                (PersistOp::Insert, "a"),
                (PersistOp::Update, "a2"),
                (PersistOp::Delete, "a2"),
            ]
        );
        assert_eq!(backend.count(PersistOp::Update), 1);
        assert_eq!(backend.records(PersistOp::Delete), vec!["a2"]);
    }

    #[test]
    fn shared_backend_sees_calls_through_arc() {
        let backend = Arc::new(MemoryBackend::new());
        let shared: Arc<MemoryBackend<i32>> = Arc::clone(&backend);

        PersistenceBackend::insert(&shared, &1).unwrap();

        assert_eq!(backend.total(), 1);
        backend.clear();
        assert_eq!(backend.total(), 0);
    }
}
