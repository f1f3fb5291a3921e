//! Identity collaborator.
//!
//! The engine never authenticates anyone itself; it asks an
//! [`IdentityProvider`] who is acting and whether they are an admin.

use crate::error::AuthorizationError;

pub trait IdentityProvider: Send + Sync {
    /// Acting user, `None` when unauthenticated.
    fn current_user_id(&self) -> Option<String>;
    fn is_admin(&self, user_id: &str) -> bool;
}

/// Resolve the acting user or fail with `Unauthenticated`.
pub fn require_user(identity: &dyn IdentityProvider) -> Result<String, AuthorizationError> {
    match identity.current_user_id() {
        Some(user) if !user.trim().is_empty() => Ok(user),
        _ => Err(AuthorizationError::Unauthenticated),
    }
}

/// Resolve the acting user and require the admin capability.
pub fn require_admin(identity: &dyn IdentityProvider) -> Result<String, AuthorizationError> {
    let user = require_user(identity)?;
    if identity.is_admin(&user) {
        Ok(user)
    } else {
        Err(AuthorizationError::NotAdmin { user_id: user })
    }
}

/// Fixed identity, resolved once per connection or request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticIdentity {
    user_id: Option<String>,
    admin: bool,
}

impl StaticIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            admin: true,
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn is_admin(&self, user_id: &str) -> bool {
        self.admin && self.user_id.as_deref() == Some(user_id)
    }
}
