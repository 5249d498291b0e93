//! Encrypted credential storage for OAuth refresh tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Keystore                           │
//! │  - Unlocked/Locked state machine         │
//! │  - DEK wrap/unwrap, lock/rotate          │
//! └─────────────────────────────────────────┘
//!          ↓ derive/wrap            ↑ unwrap
//! ┌─────────────────────────────────────────┐
//! │       kdf / encryption                   │
//! │  - scrypt KEK derivation                 │
//! │  - AES-256-GCM with per-record AAD       │
//! └─────────────────────────────────────────┘
//!          ↓                        ↑
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore (SQLite)           │
//! │  - accounts / credentials / key_material │
//! │  - plaintext or encrypted secret form    │
//! │  - transactional bulk migration          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! While the store is unlocked, refresh tokens are held in plaintext form.
//! Locking generates a random data encryption key (DEK), wraps it under a
//! password-derived key (KEK), and re-encrypts every stored secret in one
//! transaction. The two representations are mutually exclusive per row.

use chrono::{DateTime, Utc};

pub mod encryption;
pub mod kdf;
pub mod keystore;
pub mod storage;

pub use encryption::EncryptedSecret;
pub use kdf::KdfParams;
pub use keystore::{Dek, Keystore, LockStatus};
pub use storage::CredentialStore;

/// The secret representation held by a credential row. Exactly one form
/// exists at any time; which one is decided by the store-wide lock state.
#[derive(Debug, Clone, PartialEq)]
pub enum SecretForm {
    /// Direct secret string, used while the store is unlocked.
    Plaintext(String),
    /// Ciphertext/iv/tag under the DEK, used while the store is locked.
    Encrypted(EncryptedSecret),
}

/// A credential row as read from storage.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub account_id: String,
    pub secret: SecretForm,
    /// Short-lived access-token cache; not separately encrypted.
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    /// Token-format version for forward compatibility.
    pub token_version: i64,
}
