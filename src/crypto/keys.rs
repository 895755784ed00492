//! Key derivation helpers using HKDF-SHA256.
//!
//! A single process-wide secret (supplied at startup through the
//! `MTASTAGE_SECRET` environment variable or a secret file) is turned into
//! a `MasterKey`.  From that key we derive a unique **per-record** key for
//! every vault entry, on every call, so the vault table alone never holds
//! enough material to recover a plaintext.

use std::path::Path;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::errors::{Result, StageError};

/// Length of derived keys (256 bits).
const KEY_LEN: usize = 32;

/// Shortest process secret we accept.
pub const MIN_SECRET_LEN: usize = 16;

/// Environment variable holding the process secret.
pub const SECRET_ENV: &str = "MTASTAGE_SECRET";

/// Salt binding the master key to this application.
const MASTER_SALT: &[u8] = b"mtastage-vault-v1";

/// Read the process secret: the environment variable wins, then the
/// secret file.  Surrounding whitespace in the file is ignored.
pub fn load_process_secret(secret_file: Option<&Path>) -> Result<Zeroizing<Vec<u8>>> {
    if let Ok(value) = std::env::var(SECRET_ENV) {
        let value = Zeroizing::new(value);
        if !value.is_empty() {
            return check_len(Zeroizing::new(value.as_bytes().to_vec()));
        }
    }

    let Some(path) = secret_file else {
        return Err(StageError::MissingSecret);
    };
    if !path.exists() {
        return Err(StageError::MissingSecret);
    }

    let raw = Zeroizing::new(std::fs::read(path)?);
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    check_len(Zeroizing::new(raw[start..end].to_vec()))
}

fn check_len(secret: Zeroizing<Vec<u8>>) -> Result<Zeroizing<Vec<u8>>> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(StageError::KeyDerivationFailed(format!(
            "process secret must be at least {MIN_SECRET_LEN} bytes"
        )));
    }
    Ok(secret)
}

/// Internal helper: run HKDF-SHA256 with the given salt and `info`.
fn hkdf_derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);

    let mut okm = [0u8; KEY_LEN];
    hk.expand(info, &mut okm)
        .map_err(|e| StageError::KeyDerivationFailed(format!("HKDF expand failed: {e}")))?;

    Ok(okm)
}

/// A wrapper around the 32-byte master key that automatically zeroes
/// its memory when dropped.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Create a new `MasterKey` from raw bytes.
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Derive the master key from the process-wide secret.
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let mut bytes = hkdf_derive(Some(MASTER_SALT), secret, b"mtastage-master-key")?;
        let key = Self::new(bytes);
        bytes.zeroize();
        Ok(key)
    }

    /// Derive a per-record encryption key.
    ///
    /// `info` is `"mtastage-secret:<name>"`, so a ciphertext only decrypts
    /// under the record name it was written for.
    pub fn derive_record_key(&self, name: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let info = format!("mtastage-secret:{name}");
        hkdf_derive(None, &self.bytes, info.as_bytes()).map(Zeroizing::new)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_differ_per_name() {
        let key = MasterKey::from_secret(b"0123456789abcdef-process").unwrap();
        let a = key.derive_record_key("relay_password").unwrap();
        let b = key.derive_record_key("staged:relay_password").unwrap();
        assert_ne!(*a, *b);
        assert_eq!(*a, *key.derive_record_key("relay_password").unwrap());
    }

    #[test]
    fn different_secrets_give_different_keys() {
        let a = MasterKey::from_secret(b"0123456789abcdef-one").unwrap();
        let b = MasterKey::from_secret(b"0123456789abcdef-two").unwrap();
        assert_ne!(
            *a.derive_record_key("x").unwrap(),
            *b.derive_record_key("x").unwrap()
        );
    }

    #[test]
    fn secret_file_is_trimmed_and_length_checked() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secret");

        std::fs::write(&path, "short\n").unwrap();
        // Only meaningful when the env var is not set for the test process.
        if std::env::var(SECRET_ENV).is_err() {
            assert!(matches!(
                load_process_secret(Some(&path)),
                Err(StageError::KeyDerivationFailed(_))
            ));

            std::fs::write(&path, "  0123456789abcdef0123\n").unwrap();
            let secret = load_process_secret(Some(&path)).unwrap();
            assert_eq!(secret.as_slice(), b"0123456789abcdef0123");

            assert!(matches!(
                load_process_secret(Some(&dir.path().join("missing"))),
                Err(StageError::MissingSecret)
            ));
            assert!(matches!(load_process_secret(None), Err(StageError::MissingSecret)));
        }
    }
}
