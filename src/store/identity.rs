//! Identity lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity lookup errors.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("user not found: {0}")]
    NotFound(String),

    #[error("user {0} has no first or last name")]
    Incomplete(String),

    #[error("identity backend error: {0}")]
    Backend(String),
}

/// Profile fields needed to render a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,

    #[serde(default)]
    pub first_name: String,

    #[serde(default)]
    pub last_name: String,
}

impl UserProfile {
    pub fn new(
        username: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    /// Family name followed by given name, no separator.
    pub fn display_name(&self) -> Result<String, IdentityError> {
        if self.first_name.is_empty() || self.last_name.is_empty() {
            return Err(IdentityError::Incomplete(self.username.clone()));
        }
        Ok(format!("{}{}", self.last_name, self.first_name))
    }
}

/// Resolves usernames to display names.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn display_name(&self, username: &str) -> Result<String, IdentityError>;
}

/// Directory backed by a fixed set of profiles (from config or tests).
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: RwLock<HashMap<String, UserProfile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let users = profiles
            .into_iter()
            .map(|p| (p.username.clone(), p))
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }

    /// Add or replace a profile.
    pub fn insert(&self, profile: UserProfile) {
        if let Ok(mut users) = self.users.write() {
            users.insert(profile.username.clone(), profile);
        }
    }

    pub fn len(&self) -> usize {
        self.users.read().map(|u| u.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn display_name(&self, username: &str) -> Result<String, IdentityError> {
        let users = self
            .users
            .read()
            .map_err(|e| IdentityError::Backend(e.to_string()))?;

        users
            .get(username)
            .ok_or_else(|| IdentityError::NotFound(username.to_string()))?
            .display_name()
    }
}
