use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::notification::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Retrying,
    Delivered,
    Failed,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Delivered | NotificationStatus::Failed)
    }

    /// Edges of the delivery state machine. PROCESSING may be re-entered when
    /// a message is redelivered before its attempt was settled.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing | Retrying | Delivered | Failed)
                | (Retrying, Processing)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Retrying => "retrying",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
        }
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub notification_id: String,
    pub status: NotificationStatus,
    pub channel: Channel,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,

    #[serde(default)]
    pub attempts: u32,
}

impl StatusRecord {
    pub fn pending(notification_id: String, channel: Channel, user_id: String) -> Self {
        let now = Utc::now();

        Self {
            notification_id,
            status: NotificationStatus::Pending,
            channel,
            user_id,
            created_at: now,
            updated_at: now,
            error: None,
            metadata: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub notification_id: String,
    pub status: NotificationStatus,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl StatusUpdate {
    pub fn new(notification_id: impl Into<String>, status: NotificationStatus) -> Self {
        Self {
            notification_id: notification_id.into(),
            status,
            error: None,
            metadata: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NotificationStatus::*;

    #[test]
    fn terminal_states_never_transition() {
        for next in [Pending, Processing, Retrying, Delivered, Failed] {
            assert!(!Delivered.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn nothing_returns_to_pending() {
        for current in [Pending, Processing, Retrying] {
            assert!(!current.can_transition_to(Pending));
        }
    }

    #[test]
    fn retry_loop_is_allowed() {
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Delivered));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Processing));
    }

    #[test]
    fn outcomes_require_an_attempt() {
        for next in [Retrying, Delivered, Failed] {
            assert!(!Pending.can_transition_to(next));
        }
        assert!(!Retrying.can_transition_to(Delivered));
        assert!(!Retrying.can_transition_to(Failed));
        assert!(!Retrying.can_transition_to(Retrying));
    }

    #[test]
    fn record_omits_empty_optionals() {
        let record = StatusRecord::pending("n1".into(), Channel::Email, "u1".into());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "pending");
        assert_eq!(json["attempts"], 0);
        assert!(json.get("error").is_none());
        assert!(json.get("metadata").is_none());
    }
}
