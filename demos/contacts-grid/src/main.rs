//! # Contacts Grid Example
//!
//! Drives a contacts table the way an editable grid would: load existing
//! records, add a row, edit cells, delete a row. Every backend call is
//! journaled and printed at the end.
//!
//! Run with `RUST_LOG=rowsync_core=debug` to see each handler decision.

use std::sync::Arc;

use anyhow::Result;
use rowsync_core::{MemoryBackend, SyncEngine, Value};
use rowsync_testing::{contact_schema, contacts_table, Contact};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    // ========================================================================
    // Wire the grid to a backend
    // ========================================================================

    let schema = Arc::new(contact_schema());
    let backend = Arc::new(MemoryBackend::new());
    let mut grid = contacts_table();

    let existing = vec![
        Contact::new("Ada").with_email("ada@example.com"),
        Contact::new("Grace"),
    ];
    let handle = SyncEngine::builder(Arc::clone(&schema), Arc::clone(&backend))
        .with_records(existing)
        .attach(&mut grid)?;

    info!(rows = grid.len(), "grid loaded");

    // ========================================================================
    // Edit session
    // ========================================================================

    // New row: nothing is written until the row is committed.
    let linus = grid.new_row()?;
    grid.set_field(linus, "id", Value::Uuid(Uuid::new_v4()))?;
    grid.set_field(linus, "name", Value::from("Linus"))?;
    grid.set_field(linus, "email", Value::from("  Linus@Example.ORG"))?;
    grid.commit_row(linus)?;

    // The email setter normalizes; the grid shows the stored value.
    info!(email = %grid.get_field(linus, "email")?, "normalized email echoed back");

    // Existing row: one update, then a no-op for the same value.
    let grace = grid.rows().nth(1).unwrap_or(linus);
    grid.set_field(grace, "age", Value::Int(85))?;
    grid.set_field(grace, "age", Value::Int(85))?;

    // Checkbox column is display-only.
    grid.set_field(grace, "selected", Value::Bool(true))?;

    // Delete the first loaded row.
    let first = grid.rows().next();
    if let Some(ada) = first {
        grid.remove_row(ada)?;
    }
    grid.accept_changes()?;

    // ========================================================================
    // Report
    // ========================================================================

    info!(
        rows = grid.len(),
        members = handle.with(|engine| engine.collection().len())?,
        "session finished"
    );

    println!("backend journal:");
    for (op, record) in backend.calls() {
        println!("  {op:<6} {}", schema.to_json(&record));
    }

    Ok(())
}
