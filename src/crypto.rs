//! Access-token encryption at rest.
//!
//! AES-256-GCM with the key held in service configuration. Every encryption
//! draws a fresh 96-bit random nonce, prepends it to the ciphertext, and
//! hex-encodes the concatenation; decryption splits the first 12 bytes back
//! off as the nonce. A bad key or malformed ciphertext is a hard failure —
//! callers never fall back to storing plaintext.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::TriageDb;

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("malformed ciphertext: {0}")]
    InvalidFormat(String),
}

/// AES-256-GCM cipher for Instagram access tokens.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Encrypt a plaintext token. Returns hex of `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(hex::encode(combined))
    }

    /// Decrypt a hex-encoded `nonce || ciphertext` token.
    pub fn decrypt(&self, cipher_hex: &str) -> Result<String, CryptoError> {
        let combined = hex::decode(cipher_hex)
            .map_err(|e| CryptoError::InvalidFormat(format!("not valid hex: {e}")))?;

        if combined.len() <= NONCE_SIZE {
            return Err(CryptoError::InvalidFormat(format!(
                "ciphertext too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decryption(format!("not valid UTF-8: {e}")))
    }
}

/// Outcome of a token migration run.
#[derive(Debug, serde::Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub total: usize,
    pub errors: Vec<String>,
}

/// One-time migration: encrypt every stored token not yet flagged encrypted.
///
/// Partial-failure semantics — a profile that fails to encrypt or persist is
/// recorded and the run continues. Tokens already flagged are never
/// re-encrypted.
pub fn migrate_profile_tokens(db: &TriageDb, cipher: &TokenCipher) -> MigrationReport {
    let profiles = match db.unencrypted_token_profiles() {
        Ok(profiles) => profiles,
        Err(e) => {
            warn!("token migration: failed to list profiles: {e}");
            return MigrationReport {
                migrated: 0,
                total: 0,
                errors: vec![format!("listing profiles: {e}")],
            };
        }
    };

    let total = profiles.len();
    let mut migrated = 0;
    let mut errors = Vec::new();

    for profile in profiles {
        let Some(token) = profile.instagram_access_token.as_deref() else {
            continue;
        };

        match cipher.encrypt(token) {
            Ok(cipher_hex) => {
                match db.set_encrypted_token(&profile.user_id, &cipher_hex) {
                    Ok(()) => migrated += 1,
                    Err(e) => errors.push(format!("profile {}: {e}", profile.user_id)),
                }
            }
            Err(e) => errors.push(format!("profile {}: {e}", profile.user_id)),
        }
    }

    info!(
        migrated,
        total,
        failed = errors.len(),
        "token migration complete"
    );

    MigrationReport {
        migrated,
        total,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::new(&[42u8; 32])
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let c = cipher();
        let encrypted = c.encrypt("IGQVJ-long-lived-token").unwrap();
        assert_eq!(c.decrypt(&encrypted).unwrap(), "IGQVJ-long-lived-token");
    }

    #[test]
    fn test_same_plaintext_yields_different_ciphertext() {
        let c = cipher();
        let a = c.encrypt("token").unwrap();
        let b = c.encrypt("token").unwrap();
        // Fresh random nonce per encryption
        assert_ne!(a, b);
        assert_eq!(c.decrypt(&a).unwrap(), c.decrypt(&b).unwrap());
    }

    #[test]
    fn test_decrypt_rejects_malformed_hex() {
        let err = cipher().decrypt("not-hex!").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidFormat(_)));
    }

    #[test]
    fn test_decrypt_rejects_truncated_input() {
        // Shorter than the 12-byte nonce
        let err = cipher().decrypt("aabbcc").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidFormat(_)));
    }

    #[test]
    fn test_decrypt_rejects_wrong_key() {
        let encrypted = cipher().encrypt("token").unwrap();
        let other = TokenCipher::new(&[9u8; 32]);
        let err = other.decrypt(&encrypted).unwrap_err();
        assert!(matches!(err, CryptoError::Decryption(_)));
    }

    #[test]
    fn test_migration_encrypts_and_flags_unmigrated_profiles() {
        let db = TriageDb::open_in_memory().unwrap();
        let c = cipher();

        db.insert_profile_with_token("user-plain", Some("plain-token"), false)
            .unwrap();
        let pre_encrypted = c.encrypt("already-done").unwrap();
        db.insert_profile_with_token("user-done", Some(&pre_encrypted), true)
            .unwrap();
        db.insert_profile_with_token("user-none", None, false)
            .unwrap();

        let report = migrate_profile_tokens(&db, &c);
        assert_eq!(report.migrated, 1);
        assert!(report.errors.is_empty());

        let profile = db.get_profile("user-plain").unwrap().unwrap();
        assert!(profile.token_encrypted);
        let stored = profile.instagram_access_token.unwrap();
        assert_ne!(stored, "plain-token");
        assert_eq!(c.decrypt(&stored).unwrap(), "plain-token");

        // Flagged profile untouched (never re-encrypted)
        let done = db.get_profile("user-done").unwrap().unwrap();
        assert_eq!(done.instagram_access_token.unwrap(), pre_encrypted);
    }
}
