use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use crate::{models::audit::StatusEvent, status::StatusSink};

const CREATE_AUDIT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_logs (
    id BIGSERIAL PRIMARY KEY,
    notification_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    recorded_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS audit_logs_notification_id_idx ON audit_logs (notification_id);
"#;

const INSERT_AUDIT_LOG: &str = r#"
INSERT INTO audit_logs (
    notification_id,
    user_id,
    channel,
    status,
    attempts,
    error_message,
    metadata,
    recorded_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

/// Appends every status transition to the `audit_logs` table.
pub struct PostgresAuditSink {
    client: Client,
}

impl PostgresAuditSink {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        client
            .batch_execute(CREATE_AUDIT_TABLE)
            .await
            .map_err(|e| anyhow!("Failed to prepare audit table: {}", e))?;

        info!("PostgreSQL connection established");

        Ok(Self { client })
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}

#[async_trait]
impl StatusSink for PostgresAuditSink {
    async fn record(&self, event: &StatusEvent) -> Result<(), Error> {
        let attempts = i32::try_from(event.attempts).unwrap_or(i32::MAX);

        self.client
            .execute(
                INSERT_AUDIT_LOG,
                &[
                    &event.notification_id,
                    &event.user_id,
                    &event.channel.as_str(),
                    &event.status.as_str(),
                    &attempts,
                    &event.error_message,
                    &event.metadata,
                    &event.recorded_at,
                ],
            )
            .await
            .map_err(|e| anyhow!("Database write failed: {}", e))?;

        debug!(
            notification_id = %event.notification_id,
            status = %event.status,
            "Audit log written to database"
        );

        Ok(())
    }
}
