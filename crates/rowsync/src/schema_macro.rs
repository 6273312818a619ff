//! Macros for reducing schema boilerplate.

/// Generate the getter/setter pair for a plain struct field.
///
/// The field type must convert into [`Value`](crate::Value) with `From` and
/// back with [`FromValue`](crate::FromValue). Fields that need normalization
/// or validation get hand-written accessors instead.
///
/// # Example
///
/// ```ignore
/// use rowsync_core::{field_accessors, RecordSchema};
///
/// #[derive(Default)]
/// struct Contact {
///     id: Uuid,
///     name: String,
///     email: Option<String>,
/// }
///
/// let (get_id, set_id) = field_accessors!(Contact, id);
/// let (get_email, set_email) = field_accessors!(Contact, email);
///
/// let schema = RecordSchema::builder("contacts")
///     .key("id", get_id, set_id)
///     .field("email", get_email, set_email)
///     .build()?;
/// ```
#[macro_export]
macro_rules! field_accessors {
    ($record:ty, $field:ident) => {
        (
            (|record: &$record| -> $crate::Value {
                $crate::Value::from(record.$field.clone())
            }) as $crate::Getter<$record>,
            (|record: &mut $record,
              value: $crate::Value|
             -> ::std::result::Result<(), $crate::FieldError> {
                record.$field = $crate::FromValue::from_value(value)?;
                ::std::result::Result::Ok(())
            }) as $crate::Setter<$record>,
        )
    };
}
