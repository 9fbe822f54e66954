//! HTTP client for the external authentication service, with a short-lived
//! cache of positive validations.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{AuthError, AuthService, SessionInfo};

pub struct HttpAuthService {
    base_url: String,
    http: reqwest::Client,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, (SessionInfo, Instant)>>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    user_id: String,
    context_id: String,
}

impl HttpAuthService {
    /// `cache_ttl` of zero disables caching.
    pub fn new(base_url: &str, cache_ttl: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            cache_ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn cached(&self, session_id: &str) -> Option<SessionInfo> {
        let cache = self.cache.read().await;
        let (info, fetched_at) = cache.get(session_id)?;
        (fetched_at.elapsed() < self.cache_ttl).then(|| info.clone())
    }

    async fn fetch(&self, session_id: &str) -> Result<SessionInfo, AuthError> {
        let url = format!("{}/sessions/{}", self.base_url, session_id);
        let resp = self.http.get(&url).send().await.map_err(|e| {
            tracing::error!(?e, "session validation request failed");
            AuthError::Unavailable(e.to_string())
        })?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE => {
                return Err(AuthError::Invalid);
            }
            other => {
                tracing::warn!(status = %other, "authentication service error");
                return Err(AuthError::Unavailable(format!("status {other}")));
            }
        }

        let body: SessionResponse = resp.json().await.map_err(|e| {
            tracing::error!(?e, "session validation parse failed");
            AuthError::Unavailable("invalid response body".into())
        })?;

        Ok(SessionInfo {
            session_id: session_id.to_string(),
            user_id: body.user_id,
            context_id: body.context_id,
        })
    }
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn validate(&self, session_id: &str) -> Result<SessionInfo, AuthError> {
        if session_id.is_empty() {
            return Err(AuthError::Invalid);
        }
        if let Some(info) = self.cached(session_id).await {
            return Ok(info);
        }

        let result = self.fetch(session_id).await;
        let mut cache = self.cache.write().await;
        match &result {
            Ok(info) if !self.cache_ttl.is_zero() => {
                cache.insert(session_id.to_string(), (info.clone(), Instant::now()));
            }
            Err(AuthError::Invalid) => {
                cache.remove(session_id);
            }
            _ => {}
        }
        cache.retain(|_, (_, at)| at.elapsed() < self.cache_ttl);
        result
    }
}
