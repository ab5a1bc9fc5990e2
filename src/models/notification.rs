use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{status::NotificationStatus, template::Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "email", alias = "EMAIL")]
    Email,
    #[serde(rename = "push", alias = "PUSH")]
    Push,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }

    /// Name of the circuit breaker guarding this channel's provider.
    pub fn provider_name(&self) -> &'static str {
        match self {
            Channel::Email => "email-provider",
            Channel::Push => "push-provider",
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "push" => Ok(Channel::Push),
            other => Err(format!("Unknown channel '{}'", other)),
        }
    }
}

fn default_priority() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub request_id: String,
    pub user_id: String,
    #[serde(alias = "notification_type")]
    pub channel: Channel,
    pub template_code: String,

    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeliveryTarget {
    EmailAddress(String),
    DeviceToken(String),
}

impl DeliveryTarget {
    pub fn as_str(&self) -> &str {
        match self {
            DeliveryTarget::EmailAddress(address) => address,
            DeliveryTarget::DeviceToken(token) => token,
        }
    }
}

/// Fully resolved message handed from intake to a channel worker.
///
/// Serialized as JSON on the wire; redeliveries carry the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub notification_id: String,
    pub request_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub template_code: String,
    pub variables: HashMap<String, serde_json::Value>,
    pub priority: i32,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    pub target: DeliveryTarget,
    pub template: Template,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub notification_id: String,
    pub status: NotificationStatus,
    pub duplicate: bool,
    pub correlation_id: String,
}
