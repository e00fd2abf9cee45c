use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{DeviceConfig, DeviceConfigPatch};

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path, err)),
    }
}

fn encode_json<S: Serialize>(path: &Path, value: &S) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|err| StoreError::Parse {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn write_json<S: Serialize>(path: &Path, value: &S) -> Result<(), StoreError> {
    let contents = encode_json(path, value)?;
    if let Some(parent) = parent_dir(path) {
        fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
    }
    fs::write(path, contents).map_err(|err| io_error(path, err))
}

async fn write_json_async<S: Serialize>(path: &Path, value: &S) -> Result<(), StoreError> {
    let contents = encode_json(path, value)?;
    if let Some(parent) = parent_dir(path) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| io_error(parent, err))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|err| io_error(path, err))
}

/// The local settings record, one JSON file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<DeviceConfig, StoreError> {
        let Some(contents) = read_optional(&self.path)? else {
            return Ok(DeviceConfig::default());
        };
        serde_json::from_str(&contents).map_err(|err| StoreError::Parse {
            path: self.path.display().to_string(),
            message: err.to_string(),
        })
    }

    pub fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        write_json(&self.path, config)
    }

    pub fn patch(&self, patch: DeviceConfigPatch) -> Result<DeviceConfig, StoreError> {
        let mut config = self.load()?;
        patch.apply(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

/// A named firmware snippet kept for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCode {
    pub name: String,
    pub code: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub username: String,
    pub token_sha256: String,
    #[serde(default)]
    pub device_config: DeviceConfig,
    #[serde(default)]
    pub saved_codes: Vec<SavedCode>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserFile {
    #[serde(default)]
    users: Vec<UserRecord>,
}

/// Backend users and their device settings. Only the SHA-256 of each bearer token is kept.
#[derive(Debug)]
pub struct UserStore {
    path: PathBuf,
    users: RwLock<Vec<UserRecord>>,
}

impl UserStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let users = match read_optional(&path)? {
            Some(contents) => {
                let file: UserFile =
                    serde_json::from_str(&contents).map_err(|err| StoreError::Parse {
                        path: path.display().to_string(),
                        message: err.to_string(),
                    })?;
                file.users
            }
            None => Vec::new(),
        };

        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the user if needed and replaces its token; the plain token is returned once.
    pub async fn issue_token(&self, username: &str) -> Result<String, StoreError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::Invalid("username cannot be blank".to_string()));
        }

        let token = generate_token();
        let digest = token_digest(&token);

        let mut users = self.users.write().await;
        match users.iter_mut().find(|u| u.username == username) {
            Some(user) => user.token_sha256 = digest,
            None => users.push(UserRecord {
                username: username.to_string(),
                token_sha256: digest,
                device_config: DeviceConfig::default(),
                saved_codes: Vec::new(),
                created_at: Utc::now(),
            }),
        }
        self.persist(&users).await?;
        info!(%username, "issued bearer token");

        Ok(token)
    }

    pub async fn resolve(&self, token: &str) -> Option<String> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        let digest = token_digest(token);
        self.users
            .read()
            .await
            .iter()
            .find(|u| u.token_sha256 == digest)
            .map(|u| u.username.clone())
    }

    pub async fn device_config(&self, username: &str) -> Result<DeviceConfig, StoreError> {
        self.users
            .read()
            .await
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.device_config.clone())
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))
    }

    pub async fn update_device_config(
        &self,
        username: &str,
        patch: DeviceConfigPatch,
    ) -> Result<DeviceConfig, StoreError> {
        let mut users = self.users.write().await;
        let user = users
            .iter_mut()
            .find(|u| u.username == username)
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
        patch.apply(&mut user.device_config);
        let saved = user.device_config.clone();
        self.persist(&users).await?;
        Ok(saved)
    }

    /// Appends a snippet to the user's saved codes, oldest first.
    pub async fn save_code(
        &self,
        username: &str,
        name: &str,
        code: &str,
    ) -> Result<SavedCode, StoreError> {
        let mut users = self.users.write().await;
        let user = users
            .iter_mut()
            .find(|u| u.username == username)
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
        let saved = SavedCode {
            name: name.to_string(),
            code: code.to_string(),
            date: Utc::now(),
        };
        user.saved_codes.push(saved.clone());
        self.persist(&users).await?;
        info!(%username, snippet = %name, "saved code snippet");
        Ok(saved)
    }

    pub async fn saved_codes(&self, username: &str) -> Result<Vec<SavedCode>, StoreError> {
        self.users
            .read()
            .await
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.saved_codes.clone())
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))
    }

    // Called with the write guard held so concurrent updates reach disk in order.
    async fn persist(&self, users: &[UserRecord]) -> Result<(), StoreError> {
        let file = UserFile {
            users: users.to_vec(),
        };
        write_json_async(&self.path, &file).await
    }
}

fn generate_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

pub fn token_digest(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join("")
}
