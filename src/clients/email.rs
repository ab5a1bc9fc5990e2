use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use tracing::{debug, info};

use crate::{
    clients::provider::{DeliveryProvider, ProviderReceipt},
    models::{
        notification::{DeliveryTarget, NotificationEnvelope},
        template::RenderedContent,
    },
};

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

pub struct SmtpEmailClient {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailClient {
    pub fn new(settings: &SmtpSettings) -> Result<Self, Error> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| anyhow!("Invalid sender address '{}': {}", settings.from, e))?;

        let mut transport_builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| anyhow!("Failed to configure SMTP relay: {}", e))?
                .port(settings.port);

        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            transport_builder =
                transport_builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        info!(host = %settings.host, port = settings.port, "SMTP client initialized");

        Ok(Self {
            mailer: transport_builder.build(),
            from,
        })
    }
}

#[async_trait]
impl DeliveryProvider for SmtpEmailClient {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        envelope: &NotificationEnvelope,
        content: &RenderedContent,
    ) -> Result<ProviderReceipt, Error> {
        let address = match &envelope.target {
            DeliveryTarget::EmailAddress(address) => address,
            other => return Err(anyhow!("SMTP cannot deliver to {:?}", other)),
        };

        debug!(
            notification_id = %envelope.notification_id,
            correlation_id = %envelope.correlation_id,
            "Sending email"
        );

        let email = Message::builder()
            .from(self.from.clone())
            .to(address.parse()?)
            .subject(content.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(content.body.clone())?;

        let response = self.mailer.send(email).await?;

        let message_id = response
            .first_line()
            .map(str::to_string)
            .unwrap_or_else(|| envelope.notification_id.clone());

        info!(
            notification_id = %envelope.notification_id,
            message_id = %message_id,
            "Email sent"
        );

        Ok(ProviderReceipt {
            provider: self.name().to_string(),
            message_id,
        })
    }
}
