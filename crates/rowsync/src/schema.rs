//! Per-type field accessors.
//!
//! A [`RecordSchema`] is built once, when a record type is registered with the
//! engine, and maps column names to getter/setter function pointers. It is the
//! only way the engine reads or writes a record's fields.

use std::collections::HashMap;
use std::fmt;

use crate::error::{FieldError, SyncError, SyncResult};
use crate::value::Value;

/// Reads one field.
pub type Getter<R> = fn(&R) -> Value;

/// Writes one field. May normalize the value or reject it.
pub type Setter<R> = fn(&mut R, Value) -> Result<(), FieldError>;

pub struct FieldAccessor<R> {
    name: String,
    persisted: bool,
    get: Getter<R>,
    set: Setter<R>,
}

impl<R> FieldAccessor<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn get(&self, record: &R) -> Value {
        (self.get)(record)
    }

    pub fn set(&self, record: &mut R, value: Value) -> Result<(), FieldError> {
        (self.set)(record, value)
    }
}

impl<R> fmt::Debug for FieldAccessor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessor")
            .field("name", &self.name)
            .field("persisted", &self.persisted)
            .finish()
    }
}

/// Capability table for one record type.
#[derive(Debug)]
pub struct RecordSchema<R> {
    table: String,
    key: Option<usize>,
    fields: Vec<FieldAccessor<R>>,
    index: HashMap<String, usize>,
}

impl<R> RecordSchema<R> {
    pub fn builder(table: impl Into<String>) -> RecordSchemaBuilder<R> {
        RecordSchemaBuilder {
            table: table.into(),
            key: None,
            fields: Vec::new(),
        }
    }

    /// Name of the durable table records of this type live in.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key_column(&self) -> Option<&str> {
        self.key.map(|pos| self.fields[pos].name.as_str())
    }

    pub fn accessor(&self, column: &str) -> Option<&FieldAccessor<R>> {
        self.index.get(column).map(|&pos| &self.fields[pos])
    }

    pub fn fields(&self) -> &[FieldAccessor<R>] {
        &self.fields
    }

    pub fn persisted_fields(&self) -> impl Iterator<Item = &FieldAccessor<R>> {
        self.fields.iter().filter(|f| f.persisted)
    }

    pub fn get(&self, record: &R, column: &str) -> SyncResult<Value> {
        let accessor = self
            .accessor(column)
            .ok_or_else(|| SyncError::UnknownColumn(column.to_string()))?;
        Ok(accessor.get(record))
    }

    pub fn set(&self, record: &mut R, column: &str, value: Value) -> SyncResult<()> {
        let accessor = self
            .accessor(column)
            .ok_or_else(|| SyncError::UnknownColumn(column.to_string()))?;
        accessor
            .set(record, value)
            .map_err(|source| SyncError::Field {
                column: column.to_string(),
                source,
            })
    }

    /// The full persisted state of a record, in registration order.
    pub fn snapshot(&self, record: &R) -> Vec<(&str, Value)> {
        self.persisted_fields()
            .map(|f| (f.name.as_str(), f.get(record)))
            .collect()
    }

    /// Every mapped field as a flat JSON object.
    pub fn to_json(&self, record: &R) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), serde_json::Value::from(&f.get(record))))
            .collect();
        serde_json::Value::Object(map)
    }
}

pub struct RecordSchemaBuilder<R> {
    table: String,
    key: Option<usize>,
    fields: Vec<FieldAccessor<R>>,
}

impl<R> RecordSchemaBuilder<R> {
    /// The persisted field that identifies a record in the backend.
    pub fn key(mut self, name: impl Into<String>, get: Getter<R>, set: Setter<R>) -> Self {
        self.key = Some(self.fields.len());
        self.push(name.into(), true, get, set)
    }

    /// A persisted field.
    pub fn field(self, name: impl Into<String>, get: Getter<R>, set: Setter<R>) -> Self {
        self.push(name.into(), true, get, set)
    }

    /// A field mirrored on the record but never written to the backend.
    pub fn transient(self, name: impl Into<String>, get: Getter<R>, set: Setter<R>) -> Self {
        self.push(name.into(), false, get, set)
    }

    fn push(mut self, name: String, persisted: bool, get: Getter<R>, set: Setter<R>) -> Self {
        self.fields.push(FieldAccessor {
            name,
            persisted,
            get,
            set,
        });
        self
    }

    pub fn build(self) -> SyncResult<RecordSchema<R>> {
        let mut index = HashMap::with_capacity(self.fields.len());
        for (pos, field) in self.fields.iter().enumerate() {
            if index.insert(field.name.clone(), pos).is_some() {
                return Err(SyncError::DuplicateColumn(field.name.clone()));
            }
        }

        Ok(RecordSchema {
            table: self.table,
            key: self.key,
            fields: self.fields,
            index,
        })
    }
}
