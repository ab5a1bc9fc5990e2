use anyhow::{Error, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::{clients::lookup::LookupClient, models::user::UserRecord};

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `Ok(None)` when the user does not exist.
    async fn get_user(&self, user_id: &str, correlation_id: &str)
    -> Result<Option<UserRecord>, Error>;
}

pub struct UserServiceClient {
    lookup: LookupClient,
}

impl UserServiceClient {
    pub fn new(lookup: LookupClient) -> Self {
        info!(base_url = %lookup.base_url(), "User service client initialized");

        Self { lookup }
    }
}

#[async_trait]
impl UserDirectory for UserServiceClient {
    async fn get_user(
        &self,
        user_id: &str,
        correlation_id: &str,
    ) -> Result<Option<UserRecord>, Error> {
        debug!(user_id, correlation_id, "Fetching user");

        self.lookup
            .get_optional(&format!("/api/v1/users/{}", user_id), correlation_id)
            .await
    }
}
