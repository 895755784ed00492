//! Sealed vault records.
//!
//! A record is sealed with AES-256-GCM under its per-record key.  The
//! record name is authenticated as associated data, so a blob only opens
//! under the name it was sealed for.
//!
//! ```text
//! [ format: 1 byte | nonce: 12 bytes | ciphertext + 16-byte tag ]
//! ```

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};

use crate::errors::{Result, StageError};

/// Current record format.
pub const FORMAT_V1: u8 = 1;

pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + NONCE_LEN;

fn cipher(record_key: &[u8]) -> Option<Aes256Gcm> {
    Aes256Gcm::new_from_slice(record_key).ok()
}

/// Seal `plaintext` for the record `name`.
pub fn seal(record_key: &[u8], name: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(record_key)
        .ok_or_else(|| StageError::EncryptionFailed("record key must be 32 bytes".into()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let body = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: name.as_bytes(),
            },
        )
        .map_err(|e| StageError::EncryptionFailed(format!("sealing '{name}': {e}")))?;

    let mut sealed = Vec::with_capacity(HEADER_LEN + body.len());
    sealed.push(FORMAT_V1);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&body);
    Ok(sealed)
}

/// Open a blob produced by `seal` for the same record name.
///
/// Every failure is `DecryptionFailed`; callers learn nothing about which
/// check rejected the blob.
pub fn open(record_key: &[u8], name: &str, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < HEADER_LEN + TAG_LEN || sealed[0] != FORMAT_V1 {
        return Err(StageError::DecryptionFailed);
    }
    let (nonce, body) = sealed[1..].split_at(NONCE_LEN);
    let cipher = cipher(record_key).ok_or(StageError::DecryptionFailed)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: body,
                aad: name.as_bytes(),
            },
        )
        .map_err(|_| StageError::DecryptionFailed)
}
