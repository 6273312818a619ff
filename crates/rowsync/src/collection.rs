//! The live model collection.

use std::collections::HashMap;

use crate::error::{SyncError, SyncResult};
use crate::source::RowId;

/// One record bound to the row it mirrors.
///
/// The row handle is a lookup key only; the source owns the row.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance<R> {
    row: RowId,
    record: R,
}

impl<R> Instance<R> {
    pub fn new(row: RowId, record: R) -> Self {
        Self { row, record }
    }

    pub fn row(&self) -> RowId {
        self.row
    }

    pub fn record(&self) -> &R {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut R {
        &mut self.record
    }

    pub fn into_record(self) -> R {
        self.record
    }
}

/// Ordered instances, at most one per row, with a row → position index.
#[derive(Debug, Clone)]
pub struct ModelCollection<R> {
    items: Vec<Instance<R>>,
    index: HashMap<RowId, usize>,
}

impl<R> Default for ModelCollection<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> ModelCollection<R> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an instance. Fails if its row already has one.
    pub fn add(&mut self, instance: Instance<R>) -> SyncResult<&Instance<R>> {
        if self.index.contains_key(&instance.row) {
            return Err(SyncError::DuplicateInstance(instance.row));
        }
        let pos = self.items.len();
        self.index.insert(instance.row, pos);
        self.items.push(instance);
        Ok(&self.items[pos])
    }

    pub fn contains_row(&self, row: RowId) -> bool {
        self.index.contains_key(&row)
    }

    pub fn find_by_row(&self, row: RowId) -> Option<&Instance<R>> {
        self.index.get(&row).map(|&pos| &self.items[pos])
    }

    pub(crate) fn find_by_row_mut(&mut self, row: RowId) -> Option<&mut Instance<R>> {
        let pos = *self.index.get(&row)?;
        self.items.get_mut(pos)
    }

    pub fn find<P>(&self, mut predicate: P) -> Option<&Instance<R>>
    where
        P: FnMut(&Instance<R>) -> bool,
    {
        self.items.iter().find(|i| predicate(i))
    }

    pub fn remove_by_row(&mut self, row: RowId) -> Option<Instance<R>> {
        let pos = self.index.remove(&row)?;
        let removed = self.items.remove(pos);
        self.reindex_from(pos);
        Some(removed)
    }

    /// Remove the first instance matching `predicate`.
    pub fn remove_where<P>(&mut self, mut predicate: P) -> Option<Instance<R>>
    where
        P: FnMut(&Instance<R>) -> bool,
    {
        let pos = self.items.iter().position(|i| predicate(i))?;
        let removed = self.items.remove(pos);
        self.index.remove(&removed.row);
        self.reindex_from(pos);
        Some(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance<R>> {
        self.items.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.items.iter().map(|i| &i.record)
    }

    pub fn rows(&self) -> impl Iterator<Item = RowId> + '_ {
        self.items.iter().map(|i| i.row)
    }

    fn reindex_from(&mut self, start: usize) {
        for (pos, item) in self.items.iter().enumerate().skip(start) {
            self.index.insert(item.row, pos);
        }
    }
}
