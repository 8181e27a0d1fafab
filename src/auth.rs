//! Credentials for the control channel.
//!
//! A `User` holds plaintext credentials; a `HashUser` is what actually goes
//! on the wire: salted MD5 digests plus an expiry timestamp. The expiry is
//! the salt, so the server can recompute and verify without a shared nonce.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Validity window of an auth frame.
pub const EXPIRY_WINDOW_SECS: i64 = 15 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    user_name: String,
    password: String,
}

impl User {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let user_name = user_name.into();
        let password = password.into();
        if user_name.is_empty() || password.is_empty() {
            bail!("user name and password must not be empty");
        }
        Ok(Self {
            user_name,
            password,
        })
    }

    /// Parse the `user:pass` CLI form.
    pub fn parse(spec: &str) -> Result<Self> {
        match spec.split_once(':') {
            Some((u, p)) => Self::new(u, p),
            None => bail!("expected user:pass, got {:?}", spec),
        }
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn to_hash_user(&self) -> HashUser {
        let mut hu = HashUser {
            user_name_hash: String::new(),
            password_hash: String::new(),
            expires: 0,
        };
        hu.refresh_with(&self.user_name, &self.password);
        hu
    }
}

/// Wire form of a credential: salted hashes plus expiry (Unix seconds).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct HashUser {
    pub user_name_hash: String,
    pub password_hash: String,
    pub expires: i64,
}

impl HashUser {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires
    }

    /// Roll the expiry forward and recompute both hashes against the new
    /// salt. Must be called immediately before every auth send.
    pub fn refresh_with(&mut self, user_name: &str, password: &str) {
        self.expires = Utc::now().timestamp() + EXPIRY_WINDOW_SECS;
        self.user_name_hash = salted_hash(user_name, self.expires);
        self.password_hash = salted_hash(password, self.expires);
    }
}

fn salted_hash(value: &str, expires: i64) -> String {
    format!("{:x}", md5::compute(format!("{}:{}", value, expires)))
}

/// A user paired with its refreshable wire form. The plaintext stays local;
/// only the `HashUser` is ever marshalled.
#[derive(Debug, Clone)]
pub struct SessionUser {
    user: User,
    hash_user: HashUser,
}

impl SessionUser {
    pub fn new(user: User) -> Self {
        let hash_user = user.to_hash_user();
        Self { user, hash_user }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Refresh and return the wire form for the next auth frame.
    pub fn refreshed(&mut self) -> &HashUser {
        self.hash_user
            .refresh_with(self.user.user_name(), self.user.password());
        &self.hash_user
    }
}
