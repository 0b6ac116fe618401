//! Plain authentication for the distributor's LOGIN path.

use driftmail_common::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// Checks a user name and password against some backing store.
pub trait PlainAuthenticator: Send + Sync {
    /// Succeeds iff the pair is known and correct.
    fn authenticate(&self, user: &str, password: &str) -> Result<()>;
}

/// Authenticator backed by a separator-joined user file, one
/// `user<sep>password` pair per line.
#[derive(Debug)]
pub struct FileAuthenticator {
    users: HashMap<String, String>,
}

impl FileAuthenticator {
    pub fn open(path: &Path, separator: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Auth(format!("failed to read user file: {}", e)))?;

        let mut users = HashMap::new();
        for (number, line) in raw.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let (user, password) = line.split_once(separator).ok_or_else(|| {
                Error::Auth(format!(
                    "malformed user file line {}: missing separator '{}'",
                    number + 1,
                    separator
                ))
            })?;
            users.insert(user.to_string(), password.to_string());
        }

        Ok(Self { users })
    }
}

impl PlainAuthenticator for FileAuthenticator {
    fn authenticate(&self, user: &str, password: &str) -> Result<()> {
        match self.users.get(user) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(Error::Auth("name and / or password wrong".to_string())),
        }
    }
}
