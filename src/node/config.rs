//! Node configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::UserProfile;

/// Errors loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Channels the lending records live in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channels {
    /// Public book catalogue.
    pub books_public: String,

    /// Book custody records.
    pub books_private: String,

    /// Book inventory counters.
    pub books_inventory: String,

    /// MASTER copies of every loan.
    pub borrow_workflow: String,
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            books_public: "books".to_string(),
            books_private: "books_private".to_string(),
            books_inventory: "books_inventory".to_string(),
            borrow_workflow: "borrow_workflow".to_string(),
        }
    }
}

/// Configuration for a lending node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory for the record snapshot.
    pub data_dir: PathBuf,

    /// Keep records only in memory.
    pub ephemeral: bool,

    pub channels: Channels,

    /// Open loans allowed per borrower, 0 for no limit.
    pub borrow_limit: u32,

    pub max_renew_times: u32,

    /// Loan period, reported to clients.
    pub expired_days: u32,

    /// Known users and their names.
    pub users: Vec<UserProfile>,
}

impl NodeConfig {
    /// Create a config with default lending rules.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ephemeral: false,
            channels: Channels::default(),
            borrow_limit: 3,
            max_renew_times: 2,
            expired_days: 30,
            users: Vec::new(),
        }
    }

    /// Read a TOML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = data_dir;
        self
    }

    /// Keep records only in memory (testing).
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn with_borrow_limit(mut self, limit: u32) -> Self {
        self.borrow_limit = limit;
        self
    }

    pub fn with_max_renew_times(mut self, times: u32) -> Self {
        self.max_renew_times = times;
        self
    }

    pub fn with_channels(mut self, channels: Channels) -> Self {
        self.channels = channels;
        self
    }

    /// Add a known user.
    pub fn with_user(mut self, profile: UserProfile) -> Self {
        self.users.push(profile);
        self
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("org", "booklend", "booklend")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".booklend"));

        Self::new(data_dir)
    }
}
