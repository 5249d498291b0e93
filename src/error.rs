//! Error taxonomy for the credential core.
//!
//! Every error that crosses the tool boundary carries a stable
//! machine-readable code (see [`CoreError::code`]) plus a human-readable
//! message. Resolution ambiguity keeps its candidate list so callers can
//! render a disambiguation prompt. No variant ever carries password, key,
//! or decrypted secret material.

use std::fmt;

/// Errors surfaced by the credential store, key lifecycle, and account
/// resolution components.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Key derivation failed or exceeded the memory-ceiling retry budget.
    Kdf(String),
    /// AEAD tag verification failed (tampered ciphertext, mismatched
    /// associated data, or a corrupted row). Never auto-retried.
    Authentication,
    /// Unwrapping the DEK failed authentication. Indistinguishable from a
    /// corrupted key-material record on purpose.
    WrongPassword,
    /// `lock` called while the store is already locked.
    AlreadyLocked,
    /// An operation needed the DEK but the store is locked and no password
    /// was supplied.
    DatabaseLocked,
    /// No credential row exists for the account.
    CredentialsNotFound(String),
    /// The resolution key matched no account.
    AccountNotFound(String),
    /// Resolution with an empty key, but no accounts are linked.
    NoAccounts,
    /// The resolution key matched more than one account. Carries the
    /// matching emails (empty when an omitted key hit multiple accounts).
    AmbiguousAccount(Vec<String>),
    /// Underlying storage failure or call-sequence misuse.
    Storage(String),
}

impl CoreError {
    /// Stable machine-readable code for the tool-invocation error channel.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Kdf(_) => "KDF_ERROR",
            CoreError::Authentication => "AUTHENTICATION_FAILED",
            CoreError::WrongPassword => "WRONG_PASSWORD",
            CoreError::AlreadyLocked => "ALREADY_LOCKED",
            CoreError::DatabaseLocked => "DATABASE_LOCKED",
            CoreError::CredentialsNotFound(_) => "CREDENTIALS_NOT_FOUND",
            CoreError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            CoreError::NoAccounts => "NO_ACCOUNTS_LINKED",
            CoreError::AmbiguousAccount(_) => "AMBIGUOUS_ACCOUNT",
            CoreError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Candidate emails for ambiguity errors, empty otherwise.
    pub fn candidates(&self) -> &[String] {
        match self {
            CoreError::AmbiguousAccount(emails) => emails,
            _ => &[],
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Kdf(msg) => write!(f, "Key derivation failed: {}", msg),
            CoreError::Authentication => {
                write!(f, "Decryption failed: authentication tag mismatch")
            }
            CoreError::WrongPassword => {
                write!(f, "Wrong password or corrupted key material")
            }
            CoreError::AlreadyLocked => write!(f, "Credential store is already locked"),
            CoreError::DatabaseLocked => {
                write!(f, "Credential store is locked; a password is required")
            }
            CoreError::CredentialsNotFound(account_id) => {
                write!(f, "No credentials stored for account {}", account_id)
            }
            CoreError::AccountNotFound(key) => {
                write!(f, "No account matches '{}'", key)
            }
            CoreError::NoAccounts => write!(f, "No accounts are linked"),
            CoreError::AmbiguousAccount(emails) => {
                if emails.is_empty() {
                    write!(f, "Multiple accounts are linked; specify which one")
                } else {
                    write!(f, "Ambiguous account; matches: {}", emails.join(", "))
                }
            }
            CoreError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}
