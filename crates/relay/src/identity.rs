//! Identity collaborator: accounts and session tokens.
//!
//! The relay only needs to create and validate sessions; where accounts
//! live is up to the [`IdentityProvider`] implementation. The in-memory
//! provider here backs the binary and the tests.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::UserId;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors returned by identity operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Username is empty, too long or contains control characters.
    #[error("invalid username: {0}")]
    InvalidUsername(String),

    /// Another account already uses this username.
    #[error("username already taken: {0}")]
    UsernameTaken(String),

    /// Unknown username or wrong password.
    #[error("invalid username or password")]
    InvalidCredentials,
}

/// Account and session backend used by the relay.
pub trait IdentityProvider: Send + Sync {
    /// Create an account and return its id.
    fn register(&self, username: &str, password: &str) -> Result<UserId, IdentityError>;

    /// Check credentials and return the account id.
    fn authenticate(&self, username: &str, password: &str) -> Result<UserId, IdentityError>;

    /// Issue a new session token for `user_id`.
    fn create_session(&self, user_id: UserId) -> String;

    /// Resolve a token to its user, if the session is still valid.
    fn validate_session(&self, token: &str) -> Option<UserId>;

    /// Invalidate a token.
    fn revoke_session(&self, token: &str);

    /// True if an account with this id exists.
    fn user_exists(&self, user_id: UserId) -> bool;
}

const MAX_USERNAME_LENGTH: usize = 64;
const SALT_LENGTH: usize = 16;

#[derive(Debug, Clone)]
struct Account {
    user_id: UserId,
    salt: [u8; SALT_LENGTH],
    password_hash: String,
}

/// Identity provider holding accounts and sessions in memory.
#[derive(Debug)]
pub struct MemoryIdentityProvider {
    accounts: DashMap<String, Account>,
    user_ids: DashMap<UserId, String>,
    sessions: DashMap<String, UserId>,
    next_id: AtomicI64,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            user_ids: DashMap::new(),
            sessions: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Username for an account id.
    pub fn username(&self, user_id: UserId) -> Option<String> {
        self.user_ids.get(&user_id).map(|name| name.clone())
    }
}

fn hash_password(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn validate_username(username: &str) -> Result<(), IdentityError> {
    if username.trim().is_empty()
        || username.len() > MAX_USERNAME_LENGTH
        || username.chars().any(char::is_control)
    {
        return Err(IdentityError::InvalidUsername(username.to_string()));
    }
    Ok(())
}

impl IdentityProvider for MemoryIdentityProvider {
    fn register(&self, username: &str, password: &str) -> Result<UserId, IdentityError> {
        validate_username(username)?;

        match self.accounts.entry(username.to_string()) {
            Entry::Occupied(_) => Err(IdentityError::UsernameTaken(username.to_string())),
            Entry::Vacant(slot) => {
                let mut salt = [0u8; SALT_LENGTH];
                rand::thread_rng().fill_bytes(&mut salt);
                let user_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                slot.insert(Account {
                    user_id,
                    salt,
                    password_hash: hash_password(&salt, password),
                });
                self.user_ids.insert(user_id, username.to_string());
                tracing::info!(user_id, username, "Account registered");
                Ok(user_id)
            }
        }
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<UserId, IdentityError> {
        let account = self
            .accounts
            .get(username)
            .ok_or(IdentityError::InvalidCredentials)?;
        if hash_password(&account.salt, password) != account.password_hash {
            return Err(IdentityError::InvalidCredentials);
        }
        Ok(account.user_id)
    }

    fn create_session(&self, user_id: UserId) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(token.clone(), user_id);
        token
    }

    fn validate_session(&self, token: &str) -> Option<UserId> {
        self.sessions.get(token).map(|entry| *entry)
    }

    fn revoke_session(&self, token: &str) {
        self.sessions.remove(token);
    }

    fn user_exists(&self, user_id: UserId) -> bool {
        self.user_ids.contains_key(&user_id)
    }
}
