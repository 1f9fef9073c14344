//! Connection identity
//!
//! `ClientInfo` describes one live socket. It is built at handshake and never
//! changes for the lifetime of the connection.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ratelimit::RateLimitScope;

/// Identity of one live socket
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    /// Unique connection ID (UUID v4)
    pub connection_id: String,
    /// Authenticated user
    pub user_id: String,
    /// Login session the token was issued for
    pub session_id: String,
    /// Remote address
    pub source_ip: String,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
}

impl ClientInfo {
    /// Create identity for a freshly upgraded socket
    pub fn new(user_id: String, session_id: String, source_ip: String, user_agent: String) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            session_id,
            source_ip,
            user_agent,
            connected_at: Utc::now(),
        }
    }

    /// Key used for admission control under the given scope
    pub fn rate_limit_key(&self, scope: RateLimitScope) -> &str {
        match scope {
            RateLimitScope::Connection => &self.connection_id,
            RateLimitScope::User => &self.user_id,
        }
    }
}
