//! Denied source addresses, persisted as a text file with one IP per line.
//!
//! Lines starting with `#` and blank lines are ignored. Unparseable lines
//! are skipped with a warning so a hand-edited file never blocks startup.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use crate::error::Result;
use crate::fsutil::replace_file;

pub struct Blacklist {
    path: PathBuf,
    entries: RwLock<BTreeSet<IpAddr>>,
}

impl Blacklist {
    /// Load the blacklist at `path`. A missing file is an empty blacklist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => parse(&path, &contents),
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), entries = entries.len(), "Blacklist loaded");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.read().contains(ip)
    }

    /// Add `ip` and persist. Returns `false` if it was already listed.
    pub fn add(&self, ip: IpAddr) -> Result<bool> {
        let mut entries = self.write();
        if !entries.insert(ip) {
            return Ok(false);
        }
        if let Err(e) = persist(&self.path, &entries) {
            entries.remove(&ip);
            return Err(e);
        }
        info!(%ip, "Address blacklisted");
        Ok(true)
    }

    /// Remove `ip` and persist. Returns `false` if it was not listed.
    pub fn remove(&self, ip: &IpAddr) -> Result<bool> {
        let mut entries = self.write();
        if !entries.remove(ip) {
            return Ok(false);
        }
        if let Err(e) = persist(&self.path, &entries) {
            entries.insert(*ip);
            return Err(e);
        }
        info!(%ip, "Address removed from blacklist");
        Ok(true)
    }

    pub fn list(&self) -> Vec<IpAddr> {
        self.read().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeSet<IpAddr>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeSet<IpAddr>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn parse(path: &Path, contents: &str) -> BTreeSet<IpAddr> {
    let mut entries = BTreeSet::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<IpAddr>() {
            Ok(ip) => {
                entries.insert(ip);
            }
            Err(_) => warn!(
                path = %path.display(),
                line = i + 1,
                value = line,
                "Ignoring invalid blacklist entry"
            ),
        }
    }
    entries
}

fn persist(path: &Path, entries: &BTreeSet<IpAddr>) -> Result<()> {
    let mut out = String::from("# Parley blacklist: one address per line\n");
    for ip in entries {
        out.push_str(&ip.to_string());
        out.push('\n');
    }
    replace_file(path, out.as_bytes())?;
    Ok(())
}
