use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::Client;
use tracing::{debug, info};

use crate::{
    clients::provider::{DeliveryProvider, ProviderReceipt},
    models::{
        fcm::{FcmMessage, FcmNotification, FcmRequest, FcmResponse},
        notification::{DeliveryTarget, NotificationEnvelope},
        template::RenderedContent,
    },
};

const FCM_SCOPES: &[&str] = &["https://www.googleapis.com/auth/firebase.messaging"];

enum AccessToken {
    Static(String),
    Google(Arc<dyn TokenProvider>),
}

pub struct FcmClient {
    http_client: Client,
    base_url: String,
    project_id: String,
    access_token: AccessToken,
}

impl FcmClient {
    /// Authenticates with Google application default credentials.
    pub async fn new(base_url: &str, project_id: &str, timeout: Duration) -> Result<Self, Error> {
        let provider = gcp_auth::provider()
            .await
            .map_err(|e| anyhow!("Failed to load Google credentials: {}", e))?;

        Self::build(base_url, project_id, timeout, AccessToken::Google(provider))
    }

    /// Uses a fixed bearer token, e.g. against an emulator.
    pub fn with_static_token(
        base_url: &str,
        project_id: &str,
        timeout: Duration,
        token: impl Into<String>,
    ) -> Result<Self, Error> {
        Self::build(base_url, project_id, timeout, AccessToken::Static(token.into()))
    }

    fn build(
        base_url: &str,
        project_id: &str,
        timeout: Duration,
        access_token: AccessToken,
    ) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        info!(project_id, "FCM client initialized");

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            access_token,
        })
    }

    async fn bearer_token(&self) -> Result<String, Error> {
        match &self.access_token {
            AccessToken::Static(token) => Ok(token.clone()),
            AccessToken::Google(provider) => {
                let token = provider.token(FCM_SCOPES).await?;
                Ok(token.as_str().to_string())
            }
        }
    }
}

#[async_trait]
impl DeliveryProvider for FcmClient {
    fn name(&self) -> &str {
        "fcm"
    }

    async fn send(
        &self,
        envelope: &NotificationEnvelope,
        content: &RenderedContent,
    ) -> Result<ProviderReceipt, Error> {
        let device_token = match &envelope.target {
            DeliveryTarget::DeviceToken(token) => token,
            other => return Err(anyhow!("FCM cannot deliver to {:?}", other)),
        };

        debug!(
            notification_id = %envelope.notification_id,
            correlation_id = %envelope.correlation_id,
            "Sending FCM push notification"
        );

        let data = HashMap::from([
            (
                "notification_id".to_string(),
                envelope.notification_id.clone(),
            ),
            ("trace_id".to_string(), envelope.correlation_id.clone()),
        ]);

        let request = FcmRequest {
            message: FcmMessage {
                token: device_token.clone(),
                notification: FcmNotification {
                    title: content.subject.clone(),
                    body: content.body.clone(),
                },
                data: Some(data),
            },
        };

        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.base_url, self.project_id
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(self.bearer_token().await?)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("FCM request failed with {}: {}", status, error_text));
        }

        let body: FcmResponse = response.json().await?;
        let message_id = body
            .name
            .unwrap_or_else(|| envelope.notification_id.clone());

        info!(
            notification_id = %envelope.notification_id,
            message_id = %message_id,
            "FCM push notification sent"
        );

        Ok(ProviderReceipt {
            provider: self.name().to_string(),
            message_id,
        })
    }
}
