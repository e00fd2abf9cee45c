use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Credentials;
use crate::feed::{normalize_feeds, NormalizedSample};
use crate::transport::{FeedTransport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingsOutcome {
    Unconfigured,
    Unauthorized,
    Unreachable,
    Empty,
    Unknown(String),
    Ok(Vec<NormalizedSample>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Ok,
    Unconfigured,
    Unauthorized,
    Unreachable,
    Empty,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BannerAction {
    OpenSettings,
    Login,
    Retry,
}

/// What the presentation layer shows for an outcome: one banner per category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Banner {
    pub kind: OutcomeKind,
    pub message: String,
    pub action: Option<BannerAction>,
}

impl ReadingsOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Unconfigured => OutcomeKind::Unconfigured,
            Self::Unauthorized => OutcomeKind::Unauthorized,
            Self::Unreachable => OutcomeKind::Unreachable,
            Self::Empty => OutcomeKind::Empty,
            Self::Unknown(_) => OutcomeKind::Unknown,
            Self::Ok(_) => OutcomeKind::Ok,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok(_) | Self::Empty)
    }

    pub fn banner(&self) -> Banner {
        let (message, action) = match self {
            Self::Ok(series) => (format!("{} readings", series.len()), None),
            Self::Unconfigured => (
                "Configuration missing: set a channel id and read key".to_string(),
                Some(BannerAction::OpenSettings),
            ),
            Self::Unauthorized => (
                "Unauthorized: please log in again".to_string(),
                Some(BannerAction::Login),
            ),
            Self::Unreachable => (
                "Cannot connect to the data server".to_string(),
                Some(BannerAction::Retry),
            ),
            Self::Empty => ("Connected, but the channel has no data yet".to_string(), None),
            Self::Unknown(raw) => (format!("Error: {raw}"), None),
        };

        Banner {
            kind: self.kind(),
            message,
            action,
        }
    }
}

/// Gates reads behind the credential check and folds every failure into a `ReadingsOutcome`.
pub struct Gateway<T: FeedTransport> {
    transport: T,
    window_size: u32,
}

impl<T: FeedTransport> Gateway<T> {
    pub fn new(transport: T, window_size: u32) -> Self {
        Self {
            transport,
            window_size,
        }
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn request_readings(&self, credentials: &Credentials) -> ReadingsOutcome {
        if !credentials.is_complete() {
            debug!("credentials incomplete, skipping request");
            return ReadingsOutcome::Unconfigured;
        }

        match self
            .transport
            .fetch_feed(credentials, self.window_size)
            .await
        {
            Ok(response) if response.feeds.is_empty() => ReadingsOutcome::Empty,
            Ok(response) => ReadingsOutcome::Ok(normalize_feeds(&response.feeds)),
            Err(err) => {
                let outcome = classify_error(&err, credentials);
                warn!(error = %err, kind = ?outcome.kind(), "readings request failed");
                outcome
            }
        }
    }
}

/// A 400 only means "not configured" when it comes from the backend proxy; a direct upstream
/// 400 says nothing about our stored settings.
pub fn classify_error(err: &TransportError, credentials: &Credentials) -> ReadingsOutcome {
    match err {
        TransportError::Unreachable(_) => ReadingsOutcome::Unreachable,
        TransportError::Status { status: 401, .. } => ReadingsOutcome::Unauthorized,
        TransportError::Status { status: 400, .. } if credentials.is_proxied() => {
            ReadingsOutcome::Unconfigured
        }
        TransportError::Status { status, message } => {
            ReadingsOutcome::Unknown(format!("{status}: {message}"))
        }
        TransportError::Decode(message) | TransportError::Other(message) => {
            ReadingsOutcome::Unknown(message.clone())
        }
    }
}
