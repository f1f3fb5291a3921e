//! Error taxonomy shared by the client and the server.
//!
//! - [`ValidationError`]: malformed event shape, rejected before any side effect
//! - [`ConflictError`]: stale version, nothing written, caller must refetch
//! - [`AuthorizationError`]: missing identity or insufficient role
//! - [`InvariantViolation`]: a bulk reorder that doesn't match the active set
//!
//! Transport failures live with the client (`pagesync_collab::channel`).

use thiserror::Error;

use crate::event::EventKind;
use crate::item::PositionedItem;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("timestamp `{0}` is not a valid RFC 3339 instant")]
    InvalidTimestamp(String),
    #[error("invalid `{kind}` data: {reason}")]
    InvalidData { kind: EventKind, reason: String },
    #[error("malformed event: {0}")]
    Malformed(String),
}

/// A write carried a version that no longer matches storage.
///
/// Carries the stored item as it is now, so the caller can re-apply its
/// intent on top of fresh state.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "version conflict on item `{}`: expected version {}, stored version {}",
    .current.id,
    .expected_version,
    .current.version
)]
pub struct ConflictError {
    pub current: Box<PositionedItem>,
    pub expected_version: u64,
}

impl ConflictError {
    pub fn new(current: PositionedItem, expected_version: u64) -> Self {
        Self {
            current: Box::new(current),
            expected_version,
        }
    }

    /// Version currently stored for the item.
    pub fn current_version(&self) -> u64 {
        self.current.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("an authenticated identity is required")]
    Unauthenticated,
    #[error("user `{user_id}` is not an administrator")]
    NotAdmin { user_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("ids not active in group {group}: {ids:?}")]
    ForeignIds { group: String, ids: Vec<String> },
    #[error("active ids missing from ordering of group {group}: {ids:?}")]
    MissingIds { group: String, ids: Vec<String> },
    #[error("ids listed more than once for group {group}: {ids:?}")]
    DuplicateIds { group: String, ids: Vec<String> },
    #[error("group {group} order is not contiguous: {orders:?}")]
    NonContiguous { group: String, orders: Vec<u32> },
}
