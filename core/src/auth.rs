//! Resolves the local user id before any signaling happens

use async_trait::async_trait;
use std::sync::Arc;

use crate::api::ApiClient;
use crate::error::Result;

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Id of the signed-in user, or `None` without a session.
    async fn current_user_id(&self) -> Result<Option<String>>;
}

/// Fixed identity, for loopback setups and tests.
#[derive(Debug, Clone)]
pub struct StaticAuth {
    user_id: Option<String>,
}

impl StaticAuth {
    pub fn signed_in(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
        }
    }

    pub fn signed_out() -> Self {
        Self { user_id: None }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_user_id(&self) -> Result<Option<String>> {
        Ok(self.user_id.clone())
    }
}

/// Asks the backend's auth endpoint who the bearer token belongs to.
pub struct RestAuth {
    api: Arc<ApiClient>,
}

impl RestAuth {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl AuthProvider for RestAuth {
    async fn current_user_id(&self) -> Result<Option<String>> {
        Ok(self.api.get_user().await?.map(|u| u.id))
    }
}
