use std::sync::Arc;
use std::time::Duration;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use lumen_engine::Engine;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ApiError;

/// Header carrying the authenticated caller, set by the gateway in front of this service
pub const USER_HEADER: &str = "x-user-id";

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Engine,
}

impl AppState {
    pub fn new(config: Config, engine: Engine) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.engine.config.notifier.keepalive_secs.max(1))
    }
}

/// Caller identity taken from [`USER_HEADER`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(UserId)
            .ok_or(ApiError::Unauthorized)
    }
}
