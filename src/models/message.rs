use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope bytes plus failure context, as parked on the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub notification_id: Option<String>,
    pub original_queue: String,
    pub failed_at: DateTime<Utc>,
    pub error: String,
    pub payload: Vec<u8>,
}

impl DeadLetterRecord {
    pub fn new(
        notification_id: Option<String>,
        original_queue: impl Into<String>,
        error: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            notification_id,
            original_queue: original_queue.into(),
            failed_at: Utc::now(),
            error: error.into(),
            payload,
        }
    }
}
