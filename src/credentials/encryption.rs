//! AES-256-GCM envelope encryption for stored secrets.
//!
//! Each secret is encrypted with a fresh random 12-byte iv. The associated
//! data binds the ciphertext to the record it belongs to, so a ciphertext
//! copied from one account's row fails authentication under another
//! account's context even though the data encryption key is shared.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};

use crate::error::CoreError;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the iv in bytes (96 bits, standard for GCM)
pub const IV_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Protocol version baked into every associated-data string.
const AAD_VERSION: &str = "v1";

/// The encrypted representation of a secret: ciphertext, iv, and
/// authentication tag held separately, matching the persisted columns.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedSecret {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
}

/// Associated-data context for an account's refresh token.
pub fn refresh_token_aad(account_id: &str) -> String {
    format!("credentials.refresh_token:{}:{}", account_id, AAD_VERSION)
}

/// Associated-data context for the wrapped data encryption key.
pub fn wrapped_dek_aad() -> String {
    format!("keystore.dek:{}", AAD_VERSION)
}

/// Encrypts plaintext under `key`, binding `aad` into the authentication tag.
///
/// A fresh random iv is generated per call and never reused for a given key.
pub fn encrypt(key: &[u8], plaintext: &[u8], aad: &str) -> Result<EncryptedSecret, CoreError> {
    let cipher = cipher_for(key)?;
    let iv = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut combined = cipher
        .encrypt(
            &iv,
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| CoreError::Storage("encryption failed".to_string()))?;

    // aes-gcm appends the tag to the ciphertext; the store keeps them apart
    let tag = combined.split_off(combined.len() - TAG_SIZE);

    Ok(EncryptedSecret {
        ciphertext: combined,
        iv: iv.to_vec(),
        tag,
    })
}

/// Decrypts an [`EncryptedSecret`], verifying the tag and the `aad` binding.
///
/// Fails with [`CoreError::Authentication`] if any of ciphertext, iv, tag,
/// or associated data does not match what was used at encryption time.
pub fn decrypt(key: &[u8], secret: &EncryptedSecret, aad: &str) -> Result<Vec<u8>, CoreError> {
    if secret.iv.len() != IV_SIZE || secret.tag.len() != TAG_SIZE {
        return Err(CoreError::Authentication);
    }

    let cipher = cipher_for(key)?;
    let iv = Nonce::from_slice(&secret.iv);

    let mut combined = secret.ciphertext.clone();
    combined.extend_from_slice(&secret.tag);

    cipher
        .decrypt(
            iv,
            Payload {
                msg: &combined,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| CoreError::Authentication)
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CoreError> {
    if key.len() != KEY_SIZE {
        return Err(CoreError::Storage(format!(
            "encryption key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| CoreError::Storage("failed to create cipher".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let aad = refresh_token_aad("acct-1");
        let secret = encrypt(&KEY, b"refresh-token-12345", &aad).unwrap();

        assert_eq!(secret.iv.len(), IV_SIZE);
        assert_eq!(secret.tag.len(), TAG_SIZE);
        assert_ne!(secret.ciphertext, b"refresh-token-12345");

        let plaintext = decrypt(&KEY, &secret, &aad).unwrap();
        assert_eq!(plaintext, b"refresh-token-12345");
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let aad = refresh_token_aad("acct-1");
        let a = encrypt(&KEY, b"same", &aad).unwrap();
        let b = encrypt(&KEY, b"same", &aad).unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampering_detected() {
        let aad = refresh_token_aad("acct-1");
        let secret = encrypt(&KEY, b"secret", &aad).unwrap();

        let mut bad = secret.clone();
        bad.ciphertext[0] ^= 0x01;
        assert_eq!(decrypt(&KEY, &bad, &aad), Err(CoreError::Authentication));

        let mut bad = secret.clone();
        bad.iv[0] ^= 0x01;
        assert_eq!(decrypt(&KEY, &bad, &aad), Err(CoreError::Authentication));

        let mut bad = secret.clone();
        bad.tag[0] ^= 0x01;
        assert_eq!(decrypt(&KEY, &bad, &aad), Err(CoreError::Authentication));
    }

    #[test]
    fn test_cross_account_isolation() {
        // Same key, different account context: must not decrypt
        let secret = encrypt(&KEY, b"secret", &refresh_token_aad("acct-a")).unwrap();
        assert_eq!(
            decrypt(&KEY, &secret, &refresh_token_aad("acct-b")),
            Err(CoreError::Authentication)
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let aad = refresh_token_aad("acct-1");
        let secret = encrypt(&KEY, b"secret", &aad).unwrap();
        let other = [8u8; 32];
        assert_eq!(
            decrypt(&other, &secret, &aad),
            Err(CoreError::Authentication)
        );
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        let aad = refresh_token_aad("acct-1");
        assert!(encrypt(&[0u8; 16], b"x", &aad).is_err());
    }
}
