use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::TOKEN_SIZE;

fn random_token() -> [u8; TOKEN_SIZE] {
    let mut bytes = [0u8; TOKEN_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

fn token_from_hex(s: &str) -> Result<[u8; TOKEN_SIZE], hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != TOKEN_SIZE {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut arr = [0u8; TOKEN_SIZE];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

// Random token issued to a session at authentication time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub [u8; TOKEN_SIZE]);

impl UserId {
    /// Placeholder carried by entities sent before authentication and by
    /// server-originated entities.
    pub const UNASSIGNED: UserId = UserId([0u8; TOKEN_SIZE]);

    pub fn generate() -> Self {
        Self(random_token())
    }

    pub fn is_assigned(&self) -> bool {
        *self != Self::UNASSIGNED
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        token_from_hex(s).map(Self)
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Correlates a transfer manifest with its chunk stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TransferId(pub [u8; TOKEN_SIZE]);

impl TransferId {
    pub fn generate() -> Self {
        Self(random_token())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        token_from_hex(s).map(Self)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 16 hex chars are plenty to tell transfers apart in logs
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Server-side session number, assigned monotonically on accept.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Availability {
    Available,
    Busy,
    Away,
    AppearOffline,
    Offline,
}

impl Availability {
    /// What other users get to see. Appearing offline is indistinguishable
    /// from being offline.
    pub fn public(self) -> Self {
        match self {
            Self::AppearOffline => Self::Offline,
            other => other,
        }
    }
}

impl Default for Availability {
    fn default() -> Self {
        Self::Available
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Away => "away",
            Self::AppearOffline => "appear-offline",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// One row of a `CONNECTED_USERS` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub instance_id: InstanceId,
    pub username: String,
    pub availability: Availability,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_hex_is_64_chars() {
        let id = UserId::generate();
        assert_eq!(id.to_hex().len(), 64);
        assert!(id.is_assigned());
        assert_eq!(UserId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn test_user_id_rejects_short_hex() {
        assert!(UserId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_transfer_ids_are_distinct() {
        assert_ne!(TransferId::generate(), TransferId::generate());
    }

    #[test]
    fn test_appear_offline_is_public_offline() {
        assert_eq!(Availability::AppearOffline.public(), Availability::Offline);
        assert_eq!(Availability::Busy.public(), Availability::Busy);
    }
}
