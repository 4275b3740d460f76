//! # parley-store
//!
//! Persistent state of the Parley relay: the salted-hash credential store
//! used during authentication and the blacklist of denied source addresses.
//!
//! Both are small flat files. Writers always replace the whole file through
//! a temp file and an atomic rename, so a reader never sees a partial write.

pub mod blacklist;
pub mod credentials;

mod error;
mod fsutil;

pub use blacklist::Blacklist;
pub use credentials::{AccountRecord, CredentialStore, SignUpOutcome};
pub use error::{Result, StoreError};
