//! Salted-hash account store.
//!
//! Accounts live in a single file of JSON lines, one [`AccountRecord`] per
//! line. Lookups scan sequentially. Every mutation rewrites the whole file
//! through a temp file and an atomic rename, and one exclusive lock spans the
//! full read / write / rename sequence, so calls are fully serialised.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use parley_shared::crypto::{generate_salt, hashes_match, salted_hash};

use crate::error::{Result, StoreError};
use crate::fsutil::replace_file;

const MAX_FIELD_LEN: usize = 256;

/// One persisted account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub email_address: String,
    pub username: String,
    /// Hex-encoded random salt.
    pub salt: String,
    /// Hex-encoded `blake3(password || salt)`.
    pub salted_hash: String,
}

impl AccountRecord {
    fn new(email_address: &str, username: &str, password: &str) -> Self {
        let salt = generate_salt();
        Self {
            email_address: email_address.to_string(),
            username: username.to_string(),
            salt: hex::encode(salt),
            salted_hash: hex::encode(salted_hash(password, &salt)),
        }
    }

    fn password_matches(&self, password: &str) -> Result<bool> {
        let salt = hex::decode(&self.salt)?;
        let stored = hex::decode(&self.salted_hash)?;
        Ok(hashes_match(&salted_hash(password, &salt), &stored))
    }

    fn collides_with(&self, email_address: &str, username: &str) -> bool {
        self.username == username || self.email_address.eq_ignore_ascii_case(email_address)
    }
}

/// Result of [`CredentialStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignUpOutcome {
    Created,
    /// Another account already uses this username or email address.
    AlreadyExists,
}

pub struct CredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CredentialStore {
    /// Open the store at `path`, creating an empty file if none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let store = Self {
            path,
            lock: Mutex::new(()),
        };
        let count = store.len()?;
        info!(path = %store.path.display(), accounts = count, "Credential store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a new account. Rejected when the username or the email
    /// address is already taken.
    pub fn create(&self, email_address: &str, username: &str, password: &str) -> Result<SignUpOutcome> {
        validate("email address", email_address)?;
        validate("username", username)?;
        validate("password", password)?;

        let _guard = self.exclusive();
        let mut records = self.read_records()?;

        if records
            .iter()
            .any(|r| r.collides_with(email_address, username))
        {
            debug!(username, "Sign-up rejected: username or email taken");
            return Ok(SignUpOutcome::AlreadyExists);
        }

        records.push(AccountRecord::new(email_address, username, password));
        self.write_records(&records)?;

        info!(username, "Account created");
        Ok(SignUpOutcome::Created)
    }

    /// `true` iff an account named `username` exists and `password` hashes
    /// to its stored value. Both failure causes look the same to the caller.
    pub fn verify(&self, username: &str, password: &str) -> Result<bool> {
        let _guard = self.exclusive();
        let records = self.read_records()?;

        match records.iter().find(|r| r.username == username) {
            Some(record) => record.password_matches(password),
            None => {
                // Burn a hash anyway so a missing user costs the same as a
                // wrong password.
                let _ = salted_hash(password, &generate_salt());
                Ok(false)
            }
        }
    }

    /// Replace the password of `username` after checking the current one.
    /// Returns `false` if the account is unknown or `old_password` is wrong.
    pub fn change_password(&self, username: &str, old_password: &str, new_password: &str) -> Result<bool> {
        validate("password", new_password)?;

        let _guard = self.exclusive();
        let mut records = self.read_records()?;

        let Some(record) = records.iter_mut().find(|r| r.username == username) else {
            return Ok(false);
        };
        if !record.password_matches(old_password)? {
            return Ok(false);
        }

        *record = AccountRecord::new(&record.email_address, username, new_password);
        self.write_records(&records)?;

        info!(username, "Password changed");
        Ok(true)
    }

    /// Remove the account after checking its password.
    pub fn delete(&self, username: &str, password: &str) -> Result<bool> {
        let _guard = self.exclusive();
        let mut records = self.read_records()?;

        let Some(index) = records.iter().position(|r| r.username == username) else {
            return Ok(false);
        };
        if !records[index].password_matches(password)? {
            return Ok(false);
        }

        records.remove(index);
        self.write_records(&records)?;

        info!(username, "Account deleted");
        Ok(true)
    }

    pub fn contains_username(&self, username: &str) -> Result<bool> {
        let _guard = self.exclusive();
        Ok(self.read_records()?.iter().any(|r| r.username == username))
    }

    pub fn len(&self) -> Result<usize> {
        let _guard = self.exclusive();
        Ok(self.read_records()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn exclusive(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        self.lock.lock().unwrap_or_else(|poisoned| {
            warn!("Credential store lock was poisoned");
            poisoned.into_inner()
        })
    }

    fn read_records(&self) -> Result<Vec<AccountRecord>> {
        let contents = fs::read_to_string(&self.path)?;
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|source| StoreError::Corrupt {
                    line: i + 1,
                    source,
                })
            })
            .collect()
    }

    fn write_records(&self, records: &[AccountRecord]) -> Result<()> {
        let mut out = Vec::new();
        for record in records {
            serde_json::to_writer(&mut out, record)?;
            out.push(b'\n');
        }
        replace_file(&self.path, &out)?;
        Ok(())
    }
}

fn validate(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() || value.len() > MAX_FIELD_LEN {
        return Err(StoreError::InvalidInput { field });
    }
    Ok(())
}
