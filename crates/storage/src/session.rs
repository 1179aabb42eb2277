use replydesk_core::{Error, Paths, Result};
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::crypto::SessionCipher;

/// Blobs at or under this size cannot hold a real session.
const MIN_PRESENT_BYTES: u64 = 10;

/// Encrypted authenticated-session state, one file per identity.
pub struct SessionStore {
    paths: Paths,
    cipher: SessionCipher,
}

impl SessionStore {
    pub fn new(paths: Paths, cipher: SessionCipher) -> Self {
        Self { paths, cipher }
    }

    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }

    /// Decrypted session state, or `None` when nothing usable is stored.
    ///
    /// A blob that fails to decrypt is reported as `Error::Decryption`;
    /// callers treat that the same as "not logged in".
    pub fn load(&self, identity: &str) -> Result<Option<Vec<u8>>> {
        let path = self.paths.session_file(identity);
        let blob = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match self.cipher.decrypt(&blob) {
            Ok(state) => {
                debug!(identity, bytes = state.len(), "Session loaded");
                Ok(Some(state))
            }
            Err(e) => {
                warn!(identity, "Stored session failed to decrypt");
                Err(e)
            }
        }
    }

    /// Encrypt and atomically replace the identity's session.
    pub fn save(&self, identity: &str, state: &[u8]) -> Result<()> {
        if state.is_empty() {
            return Err(Error::Validation("refusing to store an empty session".to_string()));
        }
        let blob = self.cipher.encrypt(state)?;
        let path = self.paths.session_file(identity);
        write_atomic(&path, &blob)?;
        info!(identity, path = %path.display(), "Session saved");
        Ok(())
    }

    /// Returns whether a blob was removed.
    pub fn delete(&self, identity: &str) -> Result<bool> {
        let path = self.paths.session_file(identity);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(identity, "Session deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Presence check on file size alone; no decryption.
    pub fn exists(&self, identity: &str) -> bool {
        std::fs::metadata(self.paths.session_file(identity))
            .map(|m| m.is_file() && m.len() > MIN_PRESENT_BYTES)
            .unwrap_or(false)
    }
}
