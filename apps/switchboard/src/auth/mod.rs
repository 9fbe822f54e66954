//! Session validation against the external authentication service.
//!
//! The gateway never creates or destroys sessions; it only asks whether one
//! is valid and who it belongs to.

pub mod hub;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use hub::HttpAuthService;
pub use memory::StaticAuthService;

/// Identity behind a valid session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub context_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Unknown, expired or invalidated session.
    #[error("invalid session")]
    Invalid,
    /// The authentication service could not be reached.
    #[error("authentication service unavailable: {0}")]
    Unavailable(String),
}

/// Abstraction over the authentication collaborator.
///
/// Backed by an HTTP service in production and a static table in tests.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate(&self, session_id: &str) -> Result<SessionInfo, AuthError>;
}
