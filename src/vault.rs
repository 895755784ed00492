//! Secret vault: encrypted storage for secret-bearing parameter values.
//!
//! Each record is encrypted with AES-256-GCM under a key derived from the
//! process master key and the record name, so a row copied under another
//! name will not decrypt.  Plaintext only ever leaves this module wrapped
//! in `Zeroizing`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, MasterKey};
use crate::errors::{Result, StageError};
use crate::store::{now_rfc3339, parse_timestamp, Editor};

/// Prefix for credentials that are staged but not yet applied.
pub const STAGED_PREFIX: &str = "staged:";

/// Vault record name for a staged value of `key`.
pub fn staged_name(key: &str) -> String {
    format!("{STAGED_PREFIX}{key}")
}

/// Metadata about a stored secret (no ciphertext).
#[derive(Debug, Clone, Serialize)]
pub struct SecretMetadata {
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// Vault view over a connection or transaction.
pub struct SecretVault<'a> {
    conn: &'a Connection,
    key: &'a MasterKey,
}

impl<'a> SecretVault<'a> {
    pub fn new(conn: &'a Connection, key: &'a MasterKey) -> Self {
        Self { conn, key }
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(StageError::SerializationError(format!(
                "invalid secret name '{name}'"
            )));
        }
        Ok(())
    }

    fn seal(key: &MasterKey, name: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let record_key = key.derive_record_key(name)?;
        crypto::seal(record_key.as_slice(), name, plaintext)
    }

    fn open(key: &MasterKey, name: &str, ciphertext: &[u8]) -> Result<Zeroizing<String>> {
        let record_key = key.derive_record_key(name)?;
        let bytes = crypto::open(record_key.as_slice(), name, ciphertext)?;
        String::from_utf8(bytes).map(Zeroizing::new).map_err(|e| {
            let mut bad = e.into_bytes();
            bad.zeroize();
            StageError::SerializationError("secret value is not valid UTF-8".to_string())
        })
    }

    fn write_row(&self, name: &str, ciphertext: &[u8], editor: &Editor) -> Result<()> {
        self.conn.execute(
            "INSERT INTO secrets (name, encrypted_value, updated_at, updated_by)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                encrypted_value = excluded.encrypted_value,
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by",
            params![name, ciphertext, now_rfc3339(), editor.username],
        )?;
        Ok(())
    }

    fn ciphertext(&self, name: &str) -> Result<Vec<u8>> {
        self.conn
            .query_row(
                "SELECT encrypted_value FROM secrets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StageError::SecretNotFound(name.to_string()))
    }

    /// Encrypt and store (or replace) a secret.
    pub fn store(&self, name: &str, plaintext: &str, editor: &Editor) -> Result<()> {
        Self::validate_name(name)?;
        let ciphertext = Self::seal(self.key, name, plaintext.as_bytes())?;
        self.write_row(name, &ciphertext, editor)
    }

    /// Decrypt a secret.  Fails with `SecretNotFound` or `DecryptionFailed`.
    pub fn retrieve(&self, name: &str) -> Result<Zeroizing<String>> {
        Self::validate_name(name)?;
        let ciphertext = self.ciphertext(name)?;
        Self::open(self.key, name, &ciphertext)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM secrets WHERE name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    /// Remove a secret.  Returns whether it existed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM secrets WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    /// Move a secret to a new name.
    ///
    /// Record keys are bound to the name, so the value is decrypted and
    /// sealed again rather than renamed in place.
    pub fn promote(&self, from: &str, to: &str, editor: &Editor) -> Result<()> {
        let plaintext = self.retrieve(from)?;
        self.store(to, &plaintext, editor)?;
        self.delete(from)?;
        Ok(())
    }

    /// Delete every staged record.  Returns how many were removed.
    pub fn discard_staged(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM secrets WHERE substr(name, 1, ?1) = ?2",
            params![STAGED_PREFIX.len() as i64, STAGED_PREFIX],
        )?)
    }

    /// Metadata for every secret, sorted by name.
    pub fn list(&self) -> Result<Vec<SecretMetadata>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, updated_at, updated_by FROM secrets ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let updated_at: String = row.get(1)?;
            Ok(SecretMetadata {
                name: row.get(0)?,
                updated_at: parse_timestamp(1, &updated_at)?,
                updated_by: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Re-encrypt every record under `new_key`.  Returns how many were
    /// rewritten.  Run inside a transaction so a failure leaves every
    /// record under the old key.
    pub fn rotate(&self, new_key: &MasterKey, editor: &Editor) -> Result<usize> {
        let names: Vec<String> = self.list()?.into_iter().map(|m| m.name).collect();
        for name in &names {
            let plaintext = self.retrieve(name)?;
            let ciphertext = Self::seal(new_key, name, plaintext.as_bytes())?;
            self.write_row(name, &ciphertext, editor)?;
        }
        Ok(names.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn key(tag: &str) -> MasterKey {
        MasterKey::from_secret(format!("0123456789abcdef-{tag}").as_bytes()).unwrap()
    }

    fn admin() -> Editor {
        Editor::new("1", "admin")
    }

    #[test]
    fn store_and_retrieve() {
        let db = Database::open_in_memory().unwrap();
        let k = key("a");
        db.with_conn(|c| {
            let vault = SecretVault::new(c, &k);
            vault.store("relay_password", "user:s3cret", &admin())?;
            assert_eq!(vault.retrieve("relay_password")?.as_str(), "user:s3cret");
            assert!(vault.contains("relay_password")?);

            vault.store("relay_password", "user:other", &admin())?;
            assert_eq!(vault.retrieve("relay_password")?.as_str(), "user:other");
            assert_eq!(vault.list()?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn ciphertext_does_not_contain_plaintext() {
        let db = Database::open_in_memory().unwrap();
        let k = key("a");
        db.with_conn(|c| {
            SecretVault::new(c, &k).store("relay_password", "user:s3cret", &admin())?;
            let blob: Vec<u8> = c.query_row(
                "SELECT encrypted_value FROM secrets WHERE name = 'relay_password'",
                [],
                |row| row.get(0),
            )?;
            assert!(!blob.windows(6).any(|w| w == b"s3cret"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (key("a"), key("b"));
        db.with_conn(|c| {
            SecretVault::new(c, &a).store("relay_password", "user:pw", &admin())?;
            assert!(matches!(
                SecretVault::new(c, &b).retrieve("relay_password"),
                Err(StageError::DecryptionFailed)
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn row_copied_under_another_name_does_not_decrypt() {
        let db = Database::open_in_memory().unwrap();
        let k = key("a");
        db.with_conn(|c| {
            let vault = SecretVault::new(c, &k);
            vault.store("staged:relay_password", "user:pw", &admin())?;
            c.execute(
                "UPDATE secrets SET name = 'relay_password' WHERE name = 'staged:relay_password'",
                [],
            )?;
            assert!(matches!(
                vault.retrieve("relay_password"),
                Err(StageError::DecryptionFailed)
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn missing_secret_is_reported() {
        let db = Database::open_in_memory().unwrap();
        let k = key("a");
        db.with_conn(|c| {
            let vault = SecretVault::new(c, &k);
            assert!(matches!(
                vault.retrieve("relay_password"),
                Err(StageError::SecretNotFound(_))
            ));
            assert!(!vault.delete("relay_password")?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn promote_moves_the_value() {
        let db = Database::open_in_memory().unwrap();
        let k = key("a");
        db.with_conn(|c| {
            let vault = SecretVault::new(c, &k);
            vault.store(&staged_name("relay_password"), "user:new", &admin())?;
            vault.promote(&staged_name("relay_password"), "relay_password", &admin())?;
            assert_eq!(vault.retrieve("relay_password")?.as_str(), "user:new");
            assert!(!vault.contains("staged:relay_password")?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn discard_staged_leaves_live_records() {
        let db = Database::open_in_memory().unwrap();
        let k = key("a");
        db.with_conn(|c| {
            let vault = SecretVault::new(c, &k);
            vault.store("relay_password", "user:live", &admin())?;
            vault.store(&staged_name("relay_password"), "user:next", &admin())?;
            assert_eq!(vault.discard_staged()?, 1);
            assert!(vault.contains("relay_password")?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn rotate_reencrypts_every_record() {
        let db = Database::open_in_memory().unwrap();
        let (old, new) = (key("old"), key("new"));
        db.with_transaction(|tx| {
            let vault = SecretVault::new(tx, &old);
            vault.store("relay_password", "user:live", &admin())?;
            vault.store(&staged_name("relay_password"), "user:next", &admin())?;
            assert_eq!(vault.rotate(&new, &admin())?, 2);
            Ok(())
        })
        .unwrap();

        db.with_conn(|c| {
            let rotated = SecretVault::new(c, &new);
            assert_eq!(rotated.retrieve("relay_password")?.as_str(), "user:live");
            assert_eq!(
                rotated.retrieve("staged:relay_password")?.as_str(),
                "user:next"
            );
            assert!(SecretVault::new(c, &old).retrieve("relay_password").is_err());
            Ok(())
        })
        .unwrap();
    }
}
