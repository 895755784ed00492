//! Cryptographic primitives for the secret vault.
//!
//! This module provides:
//! - Sealing and opening of AES-256-GCM vault records (`encryption`)
//! - The process master key and HKDF-based per-record key derivation (`keys`)

pub mod encryption;
pub mod keys;

pub use encryption::{open, seal};
pub use keys::{load_process_secret, MasterKey, MIN_SECRET_LEN, SECRET_ENV};
