use serde::{Deserialize, Serialize};

use crate::models::notification::Channel;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPreferences {
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub push: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,

    #[serde(default, alias = "preferences")]
    pub channels_enabled: ChannelPreferences,

    #[serde(default, alias = "email")]
    pub email_address: Option<String>,

    #[serde(default)]
    pub push_token: Option<String>,
}

impl UserRecord {
    pub fn accepts(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.channels_enabled.email,
            Channel::Push => self.channels_enabled.push,
        }
    }
}
