//! Password-based key derivation for the key-encryption-key.
//!
//! Uses scrypt with interactive-strength defaults (N=2^14, r=8, p=1).
//! Derivation enforces a working-memory ceiling so runaway cost parameters
//! cannot exhaust the host: the first attempt requests a generous ceiling
//! (at least a fixed floor, and at least twice the estimated requirement),
//! and a ceiling-exceeded failure is retried once with an escalated ceiling
//! before the error propagates. Conservative parallelism accounting is what
//! makes the first attempt fail for high-`p` parameter sets.

use scrypt::Params;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CoreError;

use super::encryption::KEY_SIZE;

/// Identifier persisted in the key-material record.
pub const KDF_ALGORITHM: &str = "scrypt";

/// Size of the random KDF salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Fixed floor for the first-attempt memory ceiling (64 MiB).
const MAXMEM_FLOOR: u64 = 64 * 1024 * 1024;

/// Scrypt cost parameters, serialized into the key-material record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// log2 of the CPU/memory cost (N = 2^log_n)
    pub log_n: u8,
    /// Block size
    pub r: u32,
    /// Parallelism
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            log_n: 14,
            r: 8,
            p: 1,
        }
    }
}

impl KdfParams {
    /// Estimated working memory in bytes: the core scrypt table, 128 * N * r.
    pub fn estimated_mem(&self) -> u64 {
        128 * (self.r as u64) * (1u64 << self.log_n)
    }

    /// Worst-case accounting used for ceiling enforcement: one table per
    /// parallelism lane.
    fn required_mem(&self) -> u64 {
        self.estimated_mem().saturating_mul(self.p as u64)
    }
}

/// A derived key, wiped from memory on drop.
pub type DerivedKey = Zeroizing<[u8; KEY_SIZE]>;

/// Derives a key from `password` and `salt`, deterministic for identical
/// inputs. Applies the memory-ceiling retry policy before giving up.
pub fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<DerivedKey, CoreError> {
    derive_key_with_floor(password, salt, params, MAXMEM_FLOOR)
}

/// Implementation of [`derive_key`] with an explicit floor so tests can
/// exercise the retry path without multi-gigabyte parameter sets.
pub(crate) fn derive_key_with_floor(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
    floor: u64,
) -> Result<DerivedKey, CoreError> {
    let estimate = params.estimated_mem();

    let ceiling = floor.max(estimate.saturating_mul(2));
    match run_scrypt(password, salt, params, ceiling) {
        Err(KdfFailure::CeilingExceeded { required, .. }) => {
            let escalated = (floor.saturating_mul(4)).max(estimate.saturating_mul(8));
            tracing::debug!(
                required_bytes = required,
                escalated_ceiling = escalated,
                "scrypt memory ceiling exceeded, retrying with escalated ceiling"
            );
            run_scrypt(password, salt, params, escalated).map_err(KdfFailure::into_core)
        }
        other => other.map_err(KdfFailure::into_core),
    }
}

enum KdfFailure {
    CeilingExceeded { required: u64, ceiling: u64 },
    Invalid(String),
}

impl KdfFailure {
    fn into_core(self) -> CoreError {
        match self {
            KdfFailure::CeilingExceeded { required, ceiling } => CoreError::Kdf(format!(
                "parameters require {} bytes of working memory, ceiling is {}",
                required, ceiling
            )),
            KdfFailure::Invalid(msg) => CoreError::Kdf(msg),
        }
    }
}

fn run_scrypt(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
    maxmem: u64,
) -> Result<DerivedKey, KdfFailure> {
    let required = params.required_mem();
    if required > maxmem {
        return Err(KdfFailure::CeilingExceeded {
            required,
            ceiling: maxmem,
        });
    }

    let scrypt_params = Params::new(params.log_n, params.r, params.p, KEY_SIZE)
        .map_err(|e| KdfFailure::Invalid(format!("invalid scrypt parameters: {}", e)))?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    scrypt::scrypt(password.as_bytes(), salt, &scrypt_params, key.as_mut())
        .map_err(|e| KdfFailure::Invalid(format!("scrypt failed: {}", e)))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small, fast parameters for tests
    fn fast_params() -> KdfParams {
        KdfParams {
            log_n: 5,
            r: 8,
            p: 1,
        }
    }

    #[test]
    fn test_deterministic_for_same_inputs() {
        let params = fast_params();
        let a = derive_key("password", b"0123456789abcdef", &params).unwrap();
        let b = derive_key("password", b"0123456789abcdef", &params).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_different_password_or_salt_changes_key() {
        let params = fast_params();
        let base = derive_key("password", b"0123456789abcdef", &params).unwrap();
        let other_pw = derive_key("passwore", b"0123456789abcdef", &params).unwrap();
        let other_salt = derive_key("password", b"fedcba9876543210", &params).unwrap();
        assert_ne!(*base, *other_pw);
        assert_ne!(*base, *other_salt);
    }

    #[test]
    fn test_ceiling_retry_succeeds() {
        // estimate = 128 * 8 * 32 = 32 KiB; with p=4 the enforcement sees
        // 128 KiB required. First ceiling max(16K, 64K) = 64K fails, the
        // escalated ceiling max(64K, 256K) = 256K admits it.
        let params = KdfParams {
            log_n: 5,
            r: 8,
            p: 4,
        };
        let key = derive_key_with_floor("pw", b"0123456789abcdef", &params, 16 * 1024).unwrap();
        assert_eq!(key.len(), KEY_SIZE);
    }

    #[test]
    fn test_ceiling_exhausted_is_kdf_error() {
        // required = 32 KiB * 32 = 1 MiB, above even the escalated ceiling
        let params = KdfParams {
            log_n: 5,
            r: 8,
            p: 32,
        };
        let err = derive_key_with_floor("pw", b"0123456789abcdef", &params, 16 * 1024).unwrap_err();
        assert_eq!(err.code(), "KDF_ERROR");
    }

    #[test]
    fn test_default_params_are_interactive_strength() {
        let params = KdfParams::default();
        assert_eq!(params.log_n, 14);
        assert_eq!(params.estimated_mem(), 16 * 1024 * 1024);
    }
}
