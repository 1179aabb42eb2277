//! Password-based authenticated encryption for session blobs.
//!
//! Blob layout: `salt(16) ‖ nonce(12) ‖ ciphertext+tag`. The key is derived
//! with PBKDF2-HMAC-SHA256 from the passphrase and a salt that is freshly
//! drawn on every call, then used with AES-256-GCM.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use rand::RngCore;
use replydesk_core::{Error, Result};
use sha2::Sha256;
use tracing::warn;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Work factor used when nothing else is configured.
pub const DEFAULT_ROUNDS: u32 = 100_000;

/// Environment variable carrying the session passphrase.
pub const SECRET_ENV: &str = "REPLYDESK_SESSION_SECRET";

/// Placeholder used when the environment does not provide a passphrase.
const PLACEHOLDER_SECRET: &str = "replydesk-change-me";

const MIN_SECRET_LEN: usize = 12;

/// The symmetric passphrase, remembering whether it came from a safe source.
#[derive(Clone)]
pub struct SessionSecret {
    bytes: Vec<u8>,
    weak: bool,
}

impl SessionSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        let bytes = secret.into();
        let weak = bytes.len() < MIN_SECRET_LEN || bytes == PLACEHOLDER_SECRET.as_bytes();
        Self { bytes, weak }
    }

    /// Read the passphrase from `REPLYDESK_SESSION_SECRET`.
    ///
    /// A missing or short value is an operational misconfiguration: the
    /// placeholder is used and the secret is flagged as weak.
    pub fn from_env() -> Self {
        match std::env::var(SECRET_ENV) {
            Ok(value) if !value.trim().is_empty() => {
                let secret = Self::new(value.into_bytes());
                if secret.weak {
                    warn!(env = SECRET_ENV, "Session secret is shorter than {} bytes", MIN_SECRET_LEN);
                }
                secret
            }
            _ => {
                warn!(env = SECRET_ENV, "Session secret not set, falling back to the built-in placeholder");
                Self {
                    bytes: PLACEHOLDER_SECRET.as_bytes().to_vec(),
                    weak: true,
                }
            }
        }
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSecret")
            .field("weak", &self.weak)
            .finish_non_exhaustive()
    }
}

/// Encrypts and decrypts blobs with a fixed passphrase and KDF work factor.
#[derive(Debug, Clone)]
pub struct SessionCipher {
    secret: SessionSecret,
    rounds: u32,
}

impl SessionCipher {
    pub fn new(secret: SessionSecret) -> Self {
        Self::with_rounds(secret, DEFAULT_ROUNDS)
    }

    pub fn with_rounds(secret: SessionSecret, rounds: u32) -> Self {
        Self {
            secret,
            rounds: rounds.max(1),
        }
    }

    pub fn secret(&self) -> &SessionSecret {
        &self.secret
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let cipher = self.cipher_for(&salt)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Storage("Session encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Any structural or authentication problem yields `Error::Decryption`
    /// and nothing else; partial plaintext is never returned.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(Error::Decryption);
        }
        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let cipher = self.cipher_for(salt)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Decryption)
    }

    fn cipher_for(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.secret.as_bytes(), salt, self.rounds, &mut key);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| Error::Storage("Invalid derived key length".to_string()));
        key.fill(0);
        cipher
    }
}

/// One-shot encryption with the default work factor.
pub fn encrypt(plaintext: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
    SessionCipher::new(SessionSecret::new(secret.to_vec())).encrypt(plaintext)
}

/// One-shot decryption with the default work factor.
pub fn decrypt(blob: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
    SessionCipher::new(SessionSecret::new(secret.to_vec())).decrypt(blob)
}
