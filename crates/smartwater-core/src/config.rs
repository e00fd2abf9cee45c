use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_THINGSPEAK_URL: &str = "https://api.thingspeak.com";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5000/api";

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub window_size: u32,
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(15_000),
            window_size: 50,
            request_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub thingspeak_url: String,
    pub backend_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            thingspeak_url: DEFAULT_THINGSPEAK_URL.to_string(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
        }
    }
}

/// The settings record shared by the local settings file and the backend user record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    pub channel_id: String,
    pub read_key: String,
    pub write_key: String,
    #[serde(rename = "wifiSSID")]
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

impl DeviceConfig {
    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            channel_id: self.channel_id.trim().to_string(),
            read_key: self.read_key.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigPatch {
    pub channel_id: Option<String>,
    pub read_key: Option<String>,
    pub write_key: Option<String>,
    #[serde(rename = "wifiSSID")]
    pub wifi_ssid: Option<String>,
    pub wifi_pass: Option<String>,
}

impl DeviceConfigPatch {
    pub fn apply(self, config: &mut DeviceConfig) {
        if let Some(value) = self.channel_id {
            config.channel_id = value;
        }
        if let Some(value) = self.read_key {
            config.read_key = value;
        }
        if let Some(value) = self.write_key {
            config.write_key = value;
        }
        if let Some(value) = self.wifi_ssid {
            config.wifi_ssid = value;
        }
        if let Some(value) = self.wifi_pass {
            config.wifi_pass = value;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    pub channel_id: String,
    pub read_key: String,
}

impl ChannelConfig {
    pub fn new(channel_id: impl Into<String>, read_key: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            read_key: read_key.into(),
        }
    }
}

/// What one poll cycle authenticates with.
///
/// `Channel` reads the upstream service directly with the channel's read key.
/// `Session` reads through the backend proxy, which holds the key server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Channel(ChannelConfig),
    Session { token: String },
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Channel(channel) => {
                !channel.channel_id.trim().is_empty() && !channel.read_key.trim().is_empty()
            }
            Self::Session { token } => !token.trim().is_empty(),
        }
    }

    pub fn is_proxied(&self) -> bool {
        matches!(self, Self::Session { .. })
    }
}

impl From<ChannelConfig> for Credentials {
    fn from(channel: ChannelConfig) -> Self {
        Self::Channel(channel)
    }
}
