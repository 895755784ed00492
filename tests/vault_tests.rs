//! Integration tests for the secret vault on an on-disk database.

use mtastage::crypto::MasterKey;
use mtastage::store::{Database, Editor};
use mtastage::vault::SecretVault;
use mtastage::StageError;
use tempfile::TempDir;

/// Helper: a database path inside a fresh temp dir.
fn db_path() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("mtastage.db");
    (dir, path)
}

fn key(secret: &[u8]) -> MasterKey {
    MasterKey::from_secret(secret).expect("derive master key")
}

#[test]
fn secrets_survive_reopening_the_database() {
    let (_dir, path) = db_path();
    let editor = Editor::new("1", "admin");

    {
        let db = Database::open(&path).expect("open database");
        let k = key(b"vault-test-process-secret");
        db.with_conn(|c| SecretVault::new(c, &k).store("relay_password", "relay:pw", &editor))
            .unwrap();
    }

    let db = Database::open(&path).expect("reopen database");
    let k = key(b"vault-test-process-secret");
    let value = db
        .with_conn(|c| SecretVault::new(c, &k).retrieve("relay_password"))
        .unwrap();
    assert_eq!(value.as_str(), "relay:pw");

    let listed = db.with_conn(|c| SecretVault::new(c, &k).list()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "relay_password");
    assert_eq!(listed[0].updated_by, "admin");
}

#[test]
fn another_process_secret_cannot_read_the_vault() {
    let (_dir, path) = db_path();
    let editor = Editor::new("1", "admin");
    let db = Database::open(&path).unwrap();

    let k = key(b"vault-test-process-secret");
    db.with_conn(|c| SecretVault::new(c, &k).store("relay_password", "relay:pw", &editor))
        .unwrap();

    let wrong = key(b"some-other-process-secret");
    let result = db.with_conn(|c| SecretVault::new(c, &wrong).retrieve("relay_password"));
    assert!(matches!(result, Err(StageError::DecryptionFailed)));
}

#[cfg(unix)]
#[test]
fn database_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let (_dir, path) = db_path();
    let _db = Database::open(&path).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
