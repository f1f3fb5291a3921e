//! # pagesync-core: shared model for page synchronization
//!
//! Everything both ends of the realtime channel agree on:
//!
//! - [`event`]: the `RealtimeEvent` envelope and its closed set of kinds
//! - [`validate`]: shape checks applied before acting on any event
//! - [`sanitize`]: markup scrubbing for every string inside `data`
//! - [`item`]: positioned components and navigation entries
//! - [`mutation`]: structural mutation requests and their replies
//! - [`identity`]: the identity collaborator seen by the server
//! - [`error`]: validation, conflict, authorization and invariant errors
//!
//! The client and the server call the same [`validate()`] and
//! [`sanitize()`] on every event, whether self-originated or received.

pub mod error;
pub mod event;
pub mod identity;
pub mod item;
pub mod mutation;
pub mod sanitize;
pub mod validate;

pub use error::{AuthorizationError, ConflictError, InvariantViolation, ValidationError};
pub use event::{
    ComponentAdd, ComponentDelete, ComponentMove, ContentChange, EventKind, EventPayload,
    EventVersion, NavChangeType, NavUpdate, PresencePayload, RealtimeEvent,
};
pub use identity::{require_admin, require_user, IdentityProvider, StaticIdentity};
pub use item::{is_contiguous, GroupKey, ItemKind, PositionedItem};
pub use mutation::{MoveTarget, MutationReply, MutationRequest, RejectReason};
pub use sanitize::{sanitize, sanitize_str, sanitize_value};
pub use validate::{parse_event, parse_event_value, validate};
