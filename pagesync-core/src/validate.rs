//! Inbound event validation.
//!
//! Raw JSON goes through [`parse_event`] / [`parse_event_value`], which check
//! each required field before typed decoding so the caller gets a precise
//! [`ValidationError`] instead of a generic decode failure. [`validate`] runs
//! the checks that apply to an already-typed event (locally built ones too).

use chrono::DateTime;
use serde_json::Value;

use crate::error::ValidationError;
use crate::event::{EventKind, EventVersion, RealtimeEvent};

/// Envelope fields that must be present and non-null.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "id",
    "type",
    "pageName",
    "userId",
    "timestamp",
    "version",
    "data",
];

/// Parse and validate a raw JSON event.
pub fn parse_event(text: &str) -> Result<RealtimeEvent, ValidationError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    parse_event_value(value)
}

/// Validate an already-parsed JSON value and decode it into an event.
pub fn parse_event_value(value: Value) -> Result<RealtimeEvent, ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ValidationError::Malformed("event must be a JSON object".to_string()))?;

    for field in REQUIRED_FIELDS {
        match obj.get(field) {
            None | Some(Value::Null) => return Err(ValidationError::MissingField(field)),
            Some(_) => {}
        }
    }

    for field in ["id", "pageName", "userId"] {
        if !obj[field].is_string() {
            return Err(ValidationError::InvalidField {
                field,
                reason: "must be a string".to_string(),
            });
        }
    }

    let type_name = obj["type"].as_str().ok_or_else(|| ValidationError::InvalidField {
        field: "type",
        reason: "must be a string".to_string(),
    })?;
    if EventKind::parse(type_name).is_none() {
        return Err(ValidationError::UnknownType(type_name.to_string()));
    }

    match &obj["timestamp"] {
        Value::String(ts) => {
            DateTime::parse_from_rfc3339(ts)
                .map_err(|_| ValidationError::InvalidTimestamp(ts.clone()))?;
        }
        other => return Err(ValidationError::InvalidTimestamp(other.to_string())),
    }

    match &obj["version"] {
        Value::String(_) => {}
        Value::Number(n) if n.is_u64() => {}
        _ => {
            return Err(ValidationError::InvalidField {
                field: "version",
                reason: "must be a string or a non-negative integer".to_string(),
            })
        }
    }

    let event: RealtimeEvent =
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    validate(&event)?;
    Ok(event)
}

/// Check a typed event: identity fields present and `data` carrying the
/// per-kind minimum (every element, for batched envelopes).
pub fn validate(event: &RealtimeEvent) -> Result<(), ValidationError> {
    if event.id.trim().is_empty() {
        return Err(ValidationError::EmptyField("id"));
    }
    if event.page_name.trim().is_empty() {
        return Err(ValidationError::EmptyField("pageName"));
    }
    if event.user_id.trim().is_empty() {
        return Err(ValidationError::EmptyField("userId"));
    }
    if let EventVersion::Text(text) = &event.version {
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyField("version"));
        }
    }
    event.payload()?;
    Ok(())
}
