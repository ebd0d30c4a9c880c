//! Wire <-> storage conversion for structured fields
//!
//! On the wire, structured fields (demographics, triage data, image
//! references, analysis results, prescriptions) are native JSON. In storage
//! they are JSON text. A string arriving on the wire is taken to be storage
//! form already and is kept as-is, so clients may send either shape.
//!
//! The conversion is lossy for strings whose text is itself a JSON document:
//! `"42"`, `"null"` or `"[1]"` sent as strings come back as the number, null
//! or array they spell. Any other string, and every non-string value,
//! comes back unchanged.

use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{StoredRecord, SyncEntity};

/// Convert one structured value to storage form.
pub fn to_storage(value: Value) -> Result<Value> {
    match value {
        Value::Null | Value::String(_) => Ok(value),
        other => Ok(Value::String(serde_json::to_string(&other)?)),
    }
}

/// Convert one stored value back to wire form.
///
/// Text that is not a JSON document is returned unchanged.
pub fn to_wire(value: Value) -> Value {
    match value {
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(text),
        },
        other => other,
    }
}

/// Normalize the named structured fields of a wire record in place.
pub fn normalize_record(record: &mut Map<String, Value>, fields: &[&str]) -> Result<()> {
    for field in fields {
        if let Some(value) = record.get_mut(*field) {
            *value = to_storage(value.take())?;
        }
    }
    Ok(())
}

/// Denormalize the named structured fields of a stored record in place.
pub fn denormalize_record(record: &mut Map<String, Value>, fields: &[&str]) {
    for field in fields {
        if let Some(value) = record.get_mut(*field) {
            *value = to_wire(value.take());
        }
    }
}

/// Wire form of a stored record, bookkeeping timestamps included.
pub fn wire_record<E: SyncEntity>(stored: &StoredRecord<E>) -> Result<Value> {
    let mut value = serde_json::to_value(stored)?;
    if let Value::Object(map) = &mut value {
        denormalize_record(map, E::STRUCTURED_FIELDS);
    }
    Ok(value)
}
