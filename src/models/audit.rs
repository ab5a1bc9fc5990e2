use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::models::{
    notification::Channel,
    status::{NotificationStatus, StatusRecord},
};

/// One status transition, as forwarded to the audit sink.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub notification_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub status: NotificationStatus,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub metadata: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn from_record(record: &StatusRecord) -> Self {
        let metadata = record
            .metadata
            .as_ref()
            .and_then(|m| serde_json::to_value(m).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        Self {
            notification_id: record.notification_id.clone(),
            user_id: record.user_id.clone(),
            channel: record.channel,
            status: record.status,
            attempts: record.attempts,
            error_message: record.error.clone(),
            metadata,
            recorded_at: record.updated_at,
        }
    }
}
