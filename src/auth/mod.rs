//! Session authentication: roles, token issuance and session cookies.

pub mod cookies;
pub mod role;
pub mod tokens;

pub use role::Role;
pub use tokens::{AccessClaims, RefreshToken, SessionTokens, TokenError, TokenIssuer};

use uuid::Uuid;

/// The authenticated caller of a request.
///
/// Inserted into request extensions by the auth middleware; handlers take it
/// as an extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
    pub claims: AccessClaims,
}

impl Identity {
    /// Whether this caller may act on `user_id`'s data.
    pub fn may_act_for(&self, user_id: Uuid) -> bool {
        self.role.is_elevated() || self.user_id == user_id
    }
}
