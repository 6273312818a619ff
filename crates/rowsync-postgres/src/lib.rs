//! PostgreSQL persistence backend for rowsync.
//!
//! [`PgBackend`] implements [`PersistenceBackend`] for any record type that
//! has a [`RecordSchema`] with a key column. Statements are generated from the
//! schema on every call:
//!
//! - **insert**: every persisted field
//! - **update**: every persisted field except the key, matched on the key
//! - **delete**: matched on the key
//!
//! # Runtime
//!
//! The engine calls its backend synchronously from inside a table mutation.
//! `PgBackend` owns a current-thread tokio runtime and blocks on each query,
//! so it must not be used from within another tokio runtime.
//!
//! # Database Schema
//!
//! The table is expected to exist with one column per persisted field, named
//! exactly as the schema names them. For the contacts schema used in tests:
//!
//! ```sql
//! CREATE TABLE contacts (
//!     id UUID PRIMARY KEY,
//!     name TEXT NOT NULL,
//!     email TEXT,
//!     age BIGINT
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use rowsync_postgres::{PgBackend, PgConfig};
//!
//! let config = PgConfig::from_env()?;
//! let backend = PgBackend::connect(&config, contact_schema())?;
//!
//! let handle = SyncEngine::builder(contact_schema(), backend).attach(&mut table)?;
//! ```

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rowsync_core::{PersistOp, PersistenceBackend, RecordSchema, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Connection settings for [`PgBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl PgConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Read `ROWSYNC_DATABASE_URL` (falling back to `DATABASE_URL`) and the
    /// optional `ROWSYNC_MAX_CONNECTIONS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("ROWSYNC_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .context("ROWSYNC_DATABASE_URL or DATABASE_URL must be set")?;

        let mut config = Self::new(database_url);
        if let Some(raw) = lookup("ROWSYNC_MAX_CONNECTIONS") {
            config.max_connections = raw
                .parse()
                .with_context(|| format!("ROWSYNC_MAX_CONNECTIONS is not a number: {raw}"))?;
        }
        Ok(config)
    }
}

/// PostgreSQL backend driven by a [`RecordSchema`].
pub struct PgBackend<R> {
    pool: PgPool,
    runtime: Runtime,
    schema: Arc<RecordSchema<R>>,
}

impl<R> PgBackend<R> {
    /// Connect a pool and build the runtime that drives it.
    ///
    /// Fails if the schema has no key column.
    pub fn connect(config: &PgConfig, schema: impl Into<Arc<RecordSchema<R>>>) -> Result<Self> {
        let schema = schema.into();
        if schema.key_column().is_none() {
            bail!("schema for table {} has no key column", schema.table());
        }

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building postgres runtime")?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&config.database_url),
            )
            .context("connecting to postgres")?;

        debug!(table = schema.table(), "connected postgres backend");
        Ok(Self {
            pool,
            runtime,
            schema,
        })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run an async block against the pool on the backend's runtime.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn key_column(&self) -> Result<&str> {
        self.schema
            .key_column()
            .ok_or_else(|| anyhow!("schema for table {} has no key column", self.schema.table()))
    }

    fn execute(&self, op: PersistOp, statement: &Statement) -> Result<u64> {
        let query = statement
            .params
            .iter()
            .fold(sqlx::query(&statement.sql), bind);
        let result = self
            .runtime
            .block_on(query.execute(&self.pool))
            .with_context(|| format!("{op} into {}", self.schema.table()))?;

        let affected = result.rows_affected();
        debug!(table = self.schema.table(), %op, affected, "executed statement");
        Ok(affected)
    }
}

impl<R: 'static> PersistenceBackend<R> for PgBackend<R> {
    fn insert(&self, record: &R) -> Result<()> {
        let statement = insert_statement(self.schema.table(), &self.schema.snapshot(record));
        self.execute(PersistOp::Insert, &statement)?;
        Ok(())
    }

    fn update(&self, record: &R) -> Result<()> {
        let key = self.key_column()?;
        let Some(statement) =
            update_statement(self.schema.table(), key, &self.schema.snapshot(record))?
        else {
            return Ok(());
        };
        if self.execute(PersistOp::Update, &statement)? == 0 {
            warn!(table = self.schema.table(), "update matched no rows");
        }
        Ok(())
    }

    fn delete(&self, record: &R) -> Result<()> {
        let key = self.key_column()?;
        let statement = delete_statement(self.schema.table(), key, &self.schema.snapshot(record))?;
        if self.execute(PersistOp::Delete, &statement)? == 0 {
            warn!(table = self.schema.table(), "delete matched no rows");
        }
        Ok(())
    }
}

// ============================================================================
// Statement building
// ============================================================================

/// SQL text plus the positional parameters it refers to. Null values are
/// written into the text as `NULL` and never appear in `params`.
#[derive(Debug, Clone, PartialEq)]
struct Statement {
    sql: String,
    params: Vec<Value>,
}

impl Statement {
    fn new() -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    /// Placeholder text for `value`, registering it as a parameter.
    fn placeholder(&mut self, value: &Value) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        self.params.push(value.clone());
        format!("${}", self.params.len())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn key_value<'a>(key: &str, fields: &'a [(&str, Value)]) -> Result<&'a Value> {
    let value = fields
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value)
        .ok_or_else(|| anyhow!("key column {key} is not a persisted field"))?;
    if value.is_null() {
        bail!("record has no value for key column {key}");
    }
    Ok(value)
}

fn insert_statement(table: &str, fields: &[(&str, Value)]) -> Statement {
    let mut statement = Statement::new();
    let columns: Vec<String> = fields.iter().map(|(name, _)| quote_ident(name)).collect();
    let values: Vec<String> = fields
        .iter()
        .map(|(_, value)| statement.placeholder(value))
        .collect();

    statement.sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        columns.join(", "),
        values.join(", ")
    );
    statement
}

/// `None` when the record has no persisted field besides its key.
fn update_statement(
    table: &str,
    key: &str,
    fields: &[(&str, Value)],
) -> Result<Option<Statement>> {
    let key_value = key_value(key, fields)?;

    let mut statement = Statement::new();
    let assignments: Vec<String> = fields
        .iter()
        .filter(|(name, _)| *name != key)
        .map(|(name, value)| format!("{} = {}", quote_ident(name), statement.placeholder(value)))
        .collect();
    if assignments.is_empty() {
        return Ok(None);
    }

    let key_placeholder = statement.placeholder(key_value);
    statement.sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        quote_ident(table),
        assignments.join(", "),
        quote_ident(key),
        key_placeholder
    );
    Ok(Some(statement))
}

fn delete_statement(table: &str, key: &str, fields: &[(&str, Value)]) -> Result<Statement> {
    let key_value = key_value(key, fields)?;

    let mut statement = Statement::new();
    let key_placeholder = statement.placeholder(key_value);
    statement.sql = format!(
        "DELETE FROM {} WHERE {} = {}",
        quote_ident(table),
        quote_ident(key),
        key_placeholder
    );
    Ok(statement)
}

fn bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.as_str()),
        Value::Uuid(u) => query.bind(*u),
        Value::Timestamp(t) => query.bind(*t),
        // Statement::placeholder keeps nulls out of the parameter list.
        Value::Null => query.bind(Option::<String>::None),
    }
}
