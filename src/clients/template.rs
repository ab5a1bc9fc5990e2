use anyhow::{Error, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::{clients::lookup::LookupClient, models::template::Template};

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// `Ok(None)` when no template exists under `code`.
    async fn get_template(&self, code: &str, correlation_id: &str)
    -> Result<Option<Template>, Error>;
}

pub struct TemplateServiceClient {
    lookup: LookupClient,
}

impl TemplateServiceClient {
    pub fn new(lookup: LookupClient) -> Self {
        info!(base_url = %lookup.base_url(), "Template service client initialized");

        Self { lookup }
    }
}

#[async_trait]
impl TemplateStore for TemplateServiceClient {
    async fn get_template(
        &self,
        code: &str,
        correlation_id: &str,
    ) -> Result<Option<Template>, Error> {
        debug!(template_code = code, correlation_id, "Fetching template");

        self.lookup
            .get_optional(&format!("/api/v1/templates/{}", code), correlation_id)
            .await
    }
}
