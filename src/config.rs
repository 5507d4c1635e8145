//! Configuration types for upload sessions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for an upload session.
///
/// Loaded from TOML; missing keys fall back to [`UploadConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Number of transfers allowed in flight at once.
    pub max_concurrent_uploads: usize,
    /// Maximum number of tasks a session may hold. `None` means unlimited.
    pub max_files: Option<usize>,
    /// HTML-style accept list, e.g. `"image/*,.pdf"`.
    pub accept_pattern: Option<String>,
    /// Largest file accepted, in bytes.
    pub max_file_size_bytes: Option<u64>,
    /// Per-transfer timeout in milliseconds.
    pub upload_timeout_ms: u64,
    /// Whether the caller persists intermediate state. Not used by the session.
    pub enable_auto_save: bool,
    /// Whether removing a succeeded task also deletes the stored file.
    pub remove_stored_on_delete: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 3,
            max_files: None,
            accept_pattern: None,
            max_file_size_bytes: None,
            upload_timeout_ms: 120_000,
            enable_auto_save: false,
            remove_stored_on_delete: false,
        }
    }
}

impl UploadConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of concurrent transfers.
    #[must_use]
    pub const fn with_max_concurrent_uploads(mut self, n: usize) -> Self {
        self.max_concurrent_uploads = n;
        self
    }

    /// Sets the per-session file limit.
    #[must_use]
    pub const fn with_max_files(mut self, max: Option<usize>) -> Self {
        self.max_files = max;
        self
    }

    /// Sets the accept list.
    #[must_use]
    pub fn with_accept_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.accept_pattern = Some(pattern.into());
        self
    }

    /// Sets the largest accepted file size.
    #[must_use]
    pub const fn with_max_file_size(mut self, bytes: Option<u64>) -> Self {
        self.max_file_size_bytes = bytes;
        self
    }

    /// Sets the per-transfer timeout.
    #[must_use]
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Sets whether the caller auto-saves.
    #[must_use]
    pub const fn with_auto_save(mut self, enabled: bool) -> Self {
        self.enable_auto_save = enabled;
        self
    }

    /// Sets whether removing a succeeded task deletes the stored file.
    #[must_use]
    pub const fn with_remove_stored_on_delete(mut self, enabled: bool) -> Self {
        self.remove_stored_on_delete = enabled;
        self
    }

    /// The per-transfer timeout as a [`Duration`].
    #[must_use]
    pub const fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    /// Checks that values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_uploads must be at least 1".to_string(),
            ));
        }
        if self.max_files == Some(0) {
            return Err(Error::InvalidConfig("max_files must be at least 1".to_string()));
        }
        if self.upload_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "upload_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or fails [`validate`](Self::validate).
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Loads the default config file if it exists, otherwise returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Returns `<config dir>/evidence-upload/config.toml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("evidence-upload")
            .join("config.toml")
    }
}
