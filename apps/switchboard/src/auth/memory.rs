use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{AuthError, AuthService, SessionInfo};

/// In-process session table, seeded from `STATIC_SESSIONS` or by tests.
#[derive(Default)]
pub struct StaticAuthService {
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl StaticAuthService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `sid:user:context` triples separated by commas. Entries with a
    /// missing field are skipped.
    pub fn from_list(list: &str) -> Self {
        let service = Self::new();
        for entry in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut parts = entry.splitn(3, ':').map(str::trim);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(sid), Some(user), Some(ctx))
                    if !sid.is_empty() && !user.is_empty() && !ctx.is_empty() =>
                {
                    service.insert(sid, user, ctx);
                }
                _ => tracing::warn!(%entry, "ignoring malformed static session"),
            }
        }
        service
    }

    pub fn insert(&self, session_id: &str, user_id: &str, context_id: &str) {
        self.sessions.write().insert(
            session_id.to_string(),
            SessionInfo {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                context_id: context_id.to_string(),
            },
        );
    }

    /// Simulate external invalidation.
    pub fn invalidate(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuthService for StaticAuthService {
    async fn validate(&self, session_id: &str) -> Result<SessionInfo, AuthError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or(AuthError::Invalid)
    }
}
