//! Authentication helpers
//!
//! Binds a role to a connection at join time using shared-secret equality.
//! The role decided here is stored in the registration; later frames cannot
//! change it.

use thiserror::Error;

use crate::config::AuthConfig;
use crate::registry::Role;
use crate::server::protocol::{DecodeError, JoinRequest};

/// Why a connection could not join.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("malformed join request: {0}")]
    Malformed(String),

    #[error("unauthorized: secret mismatch")]
    Unauthorized,

    #[error("unauthorized: admin access is not configured on this server")]
    AdminDisabled,

    #[error("join timed out")]
    Timeout,

    #[error("connection closed before join")]
    Closed,
}

impl JoinError {
    /// Whether the client should get an error envelope before the close.
    pub fn should_reply(&self) -> bool {
        !matches!(self, JoinError::Timeout | JoinError::Closed)
    }
}

impl From<DecodeError> for JoinError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Malformed(message) => JoinError::Malformed(message),
            DecodeError::Unknown(kind) => {
                JoinError::Malformed(format!("expected a join request, got '{}'", kind))
            }
        }
    }
}

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Decide the role for a join request.
///
/// - `is_admin: true` needs `client_secret` equal to the admin secret; with
///   no admin secret configured, admin joins are refused outright.
/// - Everyone else joins as a voter, checked against the join secret when
///   one is configured.
pub fn authorize_join(auth: &AuthConfig, request: &JoinRequest) -> Result<Role, JoinError> {
    let provided = request.client_secret.as_deref();

    if request.is_admin {
        let Some(expected) = auth.admin_secret.as_deref() else {
            return Err(JoinError::AdminDisabled);
        };
        return match provided {
            Some(provided) if timing_safe_eq(expected, provided) => Ok(Role::Admin),
            _ => Err(JoinError::Unauthorized),
        };
    }

    match auth.join_secret.as_deref() {
        None => Ok(Role::Voter),
        Some(expected) => match provided {
            Some(provided) if timing_safe_eq(expected, provided) => Ok(Role::Voter),
            _ => Err(JoinError::Unauthorized),
        },
    }
}
