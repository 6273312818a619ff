//! Normalizing setters that write back through the table, and backend
//! failures surfacing to the caller.

use rowsync_core::{PersistOp, RowState, SyncConfig, SyncError, Value};
use rowsync_testing::{Contact, Fixture, FlakyBackend};

fn mixed_case_email() -> Value {
    Value::from("  Bob@Example.COM ")
}

// ============================================================================
// Echoed writes
// ============================================================================

#[test]
fn normalized_value_is_echoed_without_a_second_update() {
    let mut fx = Fixture::new();
    let row = fx.commit_contact("Bob").unwrap();

    fx.source.set_field(row, "email", mixed_case_email()).unwrap();

    assert_eq!(
        fx.source.get_field(row, "email").unwrap(),
        &Value::from("bob@example.com")
    );
    let updates = fx.backend.records(PersistOp::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].email.as_deref(), Some("bob@example.com"));
    fx.assert_bijection();
}

#[test]
fn echo_on_a_staged_row_stays_local() {
    let mut fx = Fixture::new();
    let row = fx.source.new_row().unwrap();

    fx.source.set_field(row, "email", mixed_case_email()).unwrap();
    assert_eq!(fx.backend.total(), 0);
    assert_eq!(
        fx.source.get_field(row, "email").unwrap(),
        &Value::from("bob@example.com")
    );

    fx.source.commit_row(row).unwrap();
    let inserted = &fx.backend.records(PersistOp::Insert)[0];
    assert_eq!(inserted.email.as_deref(), Some("bob@example.com"));
    assert_eq!(fx.backend.total(), 1);
}

#[test]
fn echo_can_be_disabled() {
    let config = SyncConfig::new().with_echo_normalized(false);
    let mut fx = Fixture::build(FlakyBackend::new(), Vec::new(), config);
    let row = fx.commit_contact("Bob").unwrap();

    fx.source.set_field(row, "email", mixed_case_email()).unwrap();

    assert_eq!(fx.source.get_field(row, "email").unwrap(), &mixed_case_email());
    assert_eq!(
        fx.contact(row).unwrap().email.as_deref(),
        Some("bob@example.com")
    );
    assert_eq!(fx.backend.journal().count(PersistOp::Update), 1);
}

#[test]
fn rewriting_an_already_normalized_value_is_a_no_op() {
    let mut fx = Fixture::with_contacts(vec![Contact::new("Bob").with_email("bob@example.com")]);
    let row = fx.source.rows().next().unwrap();

    fx.source.set_field(row, "email", Value::from("bob@example.com")).unwrap();

    assert_eq!(fx.backend.total(), 0);
    assert_eq!(fx.source.row_state(row), Some(RowState::Modified));
}

// ============================================================================
// Backend failures
// ============================================================================

fn flaky() -> Fixture<FlakyBackend<Contact>> {
    Fixture::build(FlakyBackend::new(), Vec::new(), SyncConfig::default())
}

#[test]
fn failed_insert_keeps_the_promoted_instance() {
    let mut fx = flaky();
    fx.backend.fail_next(PersistOp::Insert);

    let err = fx.commit_contact("Alice").unwrap_err();

    assert!(matches!(err, SyncError::Persistence { op: PersistOp::Insert, .. }));
    assert_eq!(fx.members(), 1);
    assert_eq!(fx.backend.journal().total(), 0);
    fx.assert_bijection();
}

#[test]
fn failed_update_leaves_the_record_ahead_of_the_table() {
    let mut fx = flaky();
    let row = fx.commit_contact("Alice").unwrap();
    fx.backend.fail_next(PersistOp::Update);

    let err = fx.source.set_field(row, "name", Value::from("Bob")).unwrap_err();

    assert!(err.to_string().contains("simulated update failure"));
    assert_eq!(fx.contact(row).unwrap().name, "Bob");
    assert_eq!(fx.source.get_field(row, "name").unwrap(), &Value::from("Alice"));
    assert_eq!(fx.backend.journal().count(PersistOp::Update), 0);
    fx.assert_bijection();
}

#[test]
fn failed_delete_still_evicts_the_instance() {
    let mut fx = flaky();
    let row = fx.commit_contact("Alice").unwrap();
    fx.backend.fail_next(PersistOp::Delete);

    let err = fx.source.remove_row(row).unwrap_err();

    assert!(matches!(err, SyncError::Persistence { op: PersistOp::Delete, .. }));
    assert!(fx.contact(row).is_none());
    assert_eq!(fx.source.row_state(row), Some(RowState::Deleted));
    fx.assert_bijection();
}

#[test]
fn failures_are_not_retried() {
    let mut fx = flaky();
    let row = fx.commit_contact("Alice").unwrap();
    fx.backend.fail_next(PersistOp::Update);

    let _ = fx.source.set_field(row, "age", Value::Int(31));
    fx.source.set_field(row, "age", Value::Int(32)).unwrap();

    let updates = fx.backend.journal().records(PersistOp::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].age, Some(32));
}
