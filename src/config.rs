use chrono::{DateTime, Utc};
use dirs::home_dir;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::auth::Credentials;
use crate::error::{Error, Result};

/// Persisted form of [`Credentials`].
///
/// Has no password field. Only token material and the identifiers needed
/// to refresh it are written out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub client_id: String,
    pub username: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Credentials> for Config {
    fn from(credentials: &Credentials) -> Self {
        Self {
            client_id: credentials.client_id.clone(),
            username: credentials.username.clone(),
            access_token: credentials.access_token.clone(),
            refresh_token: credentials.refresh_token.clone(),
            expires_at: credentials.expires_at,
        }
    }
}

impl From<Config> for Credentials {
    fn from(config: Config) -> Self {
        Self {
            client_id: config.client_id,
            username: config.username,
            password: None,
            access_token: config.access_token,
            refresh_token: config.refresh_token,
            expires_at: config.expires_at,
        }
    }
}

/// Host-supplied persistence for token material.
///
/// The token manager is the only writer: it saves after every login and
/// refresh and clears the store when the credentials become unusable.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Credentials>>;
    fn save(&self, credentials: &Credentials) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Get the path to the default configuration file (~/.moen.yml)
pub fn get_config_path() -> Result<PathBuf> {
    let home =
        home_dir().ok_or_else(|| Error::Config("Failed to determine home directory".to_string()))?;
    Ok(home.join(".moen.yml"))
}

/// YAML file store, `~/.moen.yml` by default.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn at_default_path() -> Result<Self> {
        Ok(Self::new(get_config_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credentials>> {
        if !self.path.exists() {
            debug!("No configuration file at {}", self.path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Configuration at {} is incomplete ({}). Please log in again.",
                self.path.display(),
                e
            ))
        })?;

        debug!("Loaded configuration for user: {}", config.username);
        Ok(Some(config.into()))
    }

    fn save(&self, credentials: &Credentials) -> Result<()> {
        let config = Config::from(credentials);
        let content = serde_yaml::to_string(&config)?;
        write_atomic(&self.path, &content)?;
        debug!("Saved configuration for user: {}", config.username);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            debug!("Configuration file cleared");
        } else {
            warn!("Configuration file does not exist, nothing to clear");
        }
        Ok(())
    }
}

/// Write to a temp file next to `path`, then rename over it, so readers
/// never see a half-written file. The file is owner-only on unix.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    let tmp_path = dir.join(format!(".moen.yml.tmp.{}", std::process::id()));

    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Store that lives only as long as the process. Useful for hosts that
/// persist elsewhere, and in tests.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    saved: Mutex<Option<Config>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The persisted form as last written.
    pub fn snapshot(&self) -> Option<Config> {
        self.saved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credentials>> {
        Ok(self.snapshot().map(Credentials::from))
    }

    fn save(&self, credentials: &Credentials) -> Result<()> {
        *self
            .saved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Config::from(credentials));
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self
            .saved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}
