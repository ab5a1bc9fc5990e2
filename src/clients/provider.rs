use anyhow::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{notification::NotificationEnvelope, template::RenderedContent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReceipt {
    pub provider: String,
    pub message_id: String,
}

/// External send for one channel. Implementations make a single attempt;
/// retries are driven by redelivery.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        envelope: &NotificationEnvelope,
        content: &RenderedContent,
    ) -> Result<ProviderReceipt, Error>;
}
