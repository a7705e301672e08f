//! Pluggable credential verification for login passwords and transaction PINs.
//!
//! Stored hashes are self-describing strings: `pbkdf2-sha256$<rounds>$<salt>$<hash>`,
//! with salt and hash hex-encoded. Verification reads the round count from
//! the stored value, so raising the default does not invalidate old hashes.

use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

const SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

pub trait CredentialHasher: Send + Sync {
    /// One-way hash of `plaintext` with a fresh salt.
    fn hash(&self, plaintext: &str) -> String;

    /// Whether `plaintext` matches a value previously produced by [`hash`](Self::hash).
    fn verify(&self, plaintext: &str, stored: &str) -> bool;
}

/// Salted PBKDF2-HMAC-SHA256.
#[derive(Debug, Clone)]
pub struct Pbkdf2Hasher {
    rounds: u32,
}

impl Pbkdf2Hasher {
    pub fn new(rounds: u32) -> Self {
        Self {
            rounds: rounds.max(1),
        }
    }

    fn derive(plaintext: &str, salt: &[u8], rounds: u32) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(plaintext.as_bytes(), salt, rounds, &mut out);
        out
    }
}

impl CredentialHasher for Pbkdf2Hasher {
    fn hash(&self, plaintext: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = Self::derive(plaintext, &salt, self.rounds);
        format!(
            "{SCHEME}${}${}${}",
            self.rounds,
            hex::encode(salt),
            hex::encode(hash)
        )
    }

    fn verify(&self, plaintext: &str, stored: &str) -> bool {
        let mut parts = stored.split('$');
        let (Some(SCHEME), Some(rounds), Some(salt), Some(expected), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return false;
        };

        let Ok(rounds) = rounds.parse::<u32>() else {
            return false;
        };
        let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(expected)) else {
            return false;
        };
        if rounds == 0 || expected.len() != HASH_LEN {
            return false;
        }

        let actual = Self::derive(plaintext, &salt, rounds);
        actual[..].ct_eq(&expected[..]).into()
    }
}
