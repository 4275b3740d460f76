use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use subtle::ConstantTimeEq;

use crate::constants::{GUEST_PREFIX, GUEST_SUFFIX_LEN, SALT_SIZE};

pub type Salt = [u8; SALT_SIZE];
pub type SaltedHash = [u8; 32];

pub fn generate_salt() -> Salt {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// BLAKE3 over password || salt
pub fn salted_hash(password: &str, salt: &[u8]) -> SaltedHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    *hasher.finalize().as_bytes()
}

/// Constant-time equality; slices of different length never match.
pub fn hashes_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1
}

/// Disposable username handed to guests, e.g. `Guest4fK9qZ0aBcD1eF2g`.
pub fn guest_username() -> String {
    let suffix: String = rand::rngs::OsRng
        .sample_iter(&Alphanumeric)
        .take(GUEST_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{GUEST_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salted_hash_deterministic() {
        let salt = generate_salt();
        assert_eq!(salted_hash("pw", &salt), salted_hash("pw", &salt));
    }

    #[test]
    fn test_different_salts_different_hashes() {
        let h1 = salted_hash("pw", &[1u8; SALT_SIZE]);
        let h2 = salted_hash("pw", &[2u8; SALT_SIZE]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_hashes_match() {
        let h = salted_hash("pw", b"salt");
        assert!(hashes_match(&h, &h));
        assert!(!hashes_match(&h, &salted_hash("pW", b"salt")));
        assert!(!hashes_match(&h, &h[..31]));
    }

    #[test]
    fn test_guest_username_shape() {
        let name = guest_username();
        assert_eq!(name.len(), GUEST_PREFIX.len() + GUEST_SUFFIX_LEN);
        assert!(name.starts_with("Guest"));
        assert!(name[5..].chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
