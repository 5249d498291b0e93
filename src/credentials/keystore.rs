//! Key lifecycle management: lock, unlock, rotate.
//!
//! The keystore owns the key-material singleton and the in-memory data
//! encryption key (DEK). Two persisted states exist, Unlocked and Locked;
//! rotation is not a persisted state but an atomic transition that re-wraps
//! the same DEK under a new password. The DEK only ever exists outside its
//! wrapped form in process memory, and is wiped on drop.

use std::sync::Arc;

use rand::RngCore;
use tracing::info;
use zeroize::Zeroizing;

use crate::error::CoreError;

use super::encryption::{self, EncryptedSecret, KEY_SIZE};
use super::kdf::{self, KdfParams, KDF_ALGORITHM, SALT_SIZE};
use super::storage::{self, CredentialStore};

/// The data encryption key, wiped from memory on drop.
pub type Dek = Zeroizing<[u8; KEY_SIZE]>;

/// The persisted key-material singleton.
///
/// Invariant: `is_locked` implies `kdf_salt`, `kdf_params` and
/// `wrapped_dek` are present; unlocked implies all three are absent.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub is_locked: bool,
    pub kdf_algorithm: String,
    pub kdf_salt: Option<Vec<u8>>,
    pub kdf_params: Option<KdfParams>,
    pub wrapped_dek: Option<EncryptedSecret>,
    pub password_hint: Option<String>,
}

/// Lock state reported to operators. Never includes key material.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LockStatus {
    pub locked: bool,
    pub kdf_algorithm: String,
    pub password_hint: Option<String>,
}

/// Owns the store-wide lock state and all DEK handling.
pub struct Keystore {
    store: Arc<CredentialStore>,
    kdf_params: KdfParams,
}

impl Keystore {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self::with_params(store, KdfParams::default())
    }

    pub fn with_params(store: Arc<CredentialStore>, kdf_params: KdfParams) -> Self {
        Self { store, kdf_params }
    }

    /// Current lock state.
    pub fn status(&self) -> Result<LockStatus, CoreError> {
        let material = self.store.key_material()?;
        Ok(LockStatus {
            locked: material.is_locked,
            kdf_algorithm: material.kdf_algorithm,
            password_hint: material.password_hint,
        })
    }

    /// Locks the store: generates a fresh DEK, wraps it under a KEK derived
    /// from `password` with a fresh salt, and re-encrypts every plaintext
    /// credential under the DEK. Everything runs inside one transaction, so
    /// the store is never observed partially migrated.
    pub fn lock(&self, password: &str, hint: Option<&str>) -> Result<(), CoreError> {
        let mut salt = vec![0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let kek = kdf::derive_key(password, &salt, &self.kdf_params)?;

        let mut dek: Dek = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(dek.as_mut());

        let wrapped = encryption::encrypt(&kek[..], &dek[..], &encryption::wrapped_dek_aad())?;

        let migrated = self.store.transaction(|conn| {
            let material = storage::read_key_material(conn)?;
            if material.is_locked {
                return Err(CoreError::AlreadyLocked);
            }

            let plaintext_rows = storage::plaintext_secrets(conn)?;
            for (account_id, secret) in &plaintext_rows {
                let encrypted = encryption::encrypt(
                    &dek[..],
                    secret.as_bytes(),
                    &encryption::refresh_token_aad(account_id),
                )?;
                storage::write_encrypted_secret(conn, account_id, &encrypted)?;
            }

            storage::write_key_material(
                conn,
                &KeyMaterial {
                    is_locked: true,
                    kdf_algorithm: KDF_ALGORITHM.to_string(),
                    kdf_salt: Some(salt.clone()),
                    kdf_params: Some(self.kdf_params),
                    wrapped_dek: Some(wrapped.clone()),
                    password_hint: hint.map(str::to_string),
                },
            )?;

            Ok(plaintext_rows.len())
        })?;

        info!(credentials_migrated = migrated, "credential store locked");
        Ok(())
    }

    /// Unwraps the DEK with `password`. The returned key lives only in
    /// process memory. Does not mutate persisted state.
    ///
    /// A failed unwrap reports [`CoreError::WrongPassword`]; a bad password
    /// and a corrupted record are deliberately indistinguishable.
    pub fn unlock(&self, password: &str) -> Result<Dek, CoreError> {
        let material = self.store.key_material()?;
        self.unwrap_dek(&material, password)
    }

    /// Re-wraps the same DEK under `new_password` with a fresh salt.
    /// Credential rows are untouched; the update to the key-material row is
    /// atomic, so a failure at any step leaves the old password in effect.
    pub fn rotate(
        &self,
        old_password: &str,
        new_password: &str,
        hint: Option<&str>,
    ) -> Result<(), CoreError> {
        let material = self.store.key_material()?;
        let dek = self.unwrap_dek(&material, old_password)?;

        let mut salt = vec![0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let kek = kdf::derive_key(new_password, &salt, &self.kdf_params)?;
        let wrapped = encryption::encrypt(&kek[..], &dek[..], &encryption::wrapped_dek_aad())?;

        self.store.transaction(|conn| {
            let current = storage::read_key_material(conn)?;
            if !current.is_locked {
                return Err(CoreError::Storage("key store is not locked".to_string()));
            }
            storage::write_key_material(
                conn,
                &KeyMaterial {
                    is_locked: true,
                    kdf_algorithm: KDF_ALGORITHM.to_string(),
                    kdf_salt: Some(salt.clone()),
                    kdf_params: Some(self.kdf_params),
                    wrapped_dek: Some(wrapped.clone()),
                    password_hint: hint.map(str::to_string),
                },
            )
        })?;

        info!("credential store password rotated");
        Ok(())
    }

    /// Returns the DEK needed for credential access: `None` while the store
    /// is unlocked (no key required), the unwrapped DEK when locked and a
    /// password was supplied, and [`CoreError::DatabaseLocked`] otherwise.
    pub fn current_key(&self, password: Option<&str>) -> Result<Option<Dek>, CoreError> {
        let material = self.store.key_material()?;
        if !material.is_locked {
            return Ok(None);
        }
        let password = password.ok_or(CoreError::DatabaseLocked)?;
        self.unwrap_dek(&material, password).map(Some)
    }

    fn unwrap_dek(&self, material: &KeyMaterial, password: &str) -> Result<Dek, CoreError> {
        if !material.is_locked {
            return Err(CoreError::Storage("key store is not locked".to_string()));
        }
        let (salt, params, wrapped) = match (
            &material.kdf_salt,
            &material.kdf_params,
            &material.wrapped_dek,
        ) {
            (Some(salt), Some(params), Some(wrapped)) => (salt, params, wrapped),
            // Locked without complete key material is indistinguishable
            // from corruption, same as a bad password
            _ => return Err(CoreError::WrongPassword),
        };

        let kek = kdf::derive_key(password, salt, params)?;
        let plaintext = Zeroizing::new(
            encryption::decrypt(&kek[..], wrapped, &encryption::wrapped_dek_aad())
                .map_err(|_| CoreError::WrongPassword)?,
        );

        if plaintext.len() != KEY_SIZE {
            return Err(CoreError::WrongPassword);
        }
        let mut dek: Dek = Zeroizing::new([0u8; KEY_SIZE]);
        dek.copy_from_slice(&plaintext);
        Ok(dek)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::LinkRequest;
    use crate::credentials::SecretForm;

    fn fast_keystore(store: Arc<CredentialStore>) -> Keystore {
        // Small scrypt cost so the suite stays fast
        Keystore::with_params(
            store,
            KdfParams {
                log_n: 5,
                r: 8,
                p: 1,
            },
        )
    }

    fn setup() -> (Arc<CredentialStore>, Keystore, Vec<String>) {
        let store = Arc::new(CredentialStore::new(":memory:").unwrap());
        let keystore = fast_keystore(store.clone());

        let mut account_ids = Vec::new();
        for email in ["a@x.com", "b@x.com", "c@x.com"] {
            let account = store
                .link_account(&LinkRequest {
                    external_user_id: format!("ext-{}", email),
                    email: email.to_string(),
                    display_name: None,
                    scopes: vec![],
                })
                .unwrap();
            store
                .store_secret(&account.id, &format!("refresh-{}", email), None)
                .unwrap();
            account_ids.push(account.id);
        }
        (store, keystore, account_ids)
    }

    #[test]
    fn test_lock_migrates_all_plaintext_rows() {
        let (store, keystore, account_ids) = setup();

        keystore.lock("hunter2", Some("usual one")).unwrap();

        let status = keystore.status().unwrap();
        assert!(status.locked);
        assert_eq!(status.password_hint.as_deref(), Some("usual one"));

        for id in &account_ids {
            let credential = store.get_credential(id).unwrap().unwrap();
            assert!(matches!(credential.secret, SecretForm::Encrypted(_)));
        }
    }

    #[test]
    fn test_lock_twice_fails() {
        let (_store, keystore, _ids) = setup();
        keystore.lock("hunter2", None).unwrap();
        assert_eq!(
            keystore.lock("hunter2", None),
            Err(CoreError::AlreadyLocked)
        );
    }

    #[test]
    fn test_lock_unlock_roundtrips_every_secret() {
        let (store, keystore, account_ids) = setup();
        keystore.lock("hunter2", None).unwrap();

        let dek = keystore.unlock("hunter2").unwrap();
        for (id, email) in account_ids.iter().zip(["a@x.com", "b@x.com", "c@x.com"]) {
            assert_eq!(
                store.usable_secret(id, Some(&dek[..])).unwrap(),
                format!("refresh-{}", email)
            );
        }
    }

    #[test]
    fn test_unlock_wrong_password() {
        let (_store, keystore, _ids) = setup();
        keystore.lock("hunter2", None).unwrap();
        assert_eq!(
            keystore.unlock("hunter3").unwrap_err(),
            CoreError::WrongPassword
        );
    }

    #[test]
    fn test_unlock_when_not_locked_is_misuse() {
        let (_store, keystore, _ids) = setup();
        assert!(matches!(
            keystore.unlock("hunter2"),
            Err(CoreError::Storage(_))
        ));
    }

    #[test]
    fn test_rotate_keeps_dek_and_invalidates_old_password() {
        let (store, keystore, account_ids) = setup();
        keystore.lock("old-pass", None).unwrap();
        let dek_before = keystore.unlock("old-pass").unwrap();

        keystore.rotate("old-pass", "new-pass", Some("rotated")).unwrap();

        let dek_after = keystore.unlock("new-pass").unwrap();
        assert_eq!(*dek_before, *dek_after);
        assert_eq!(
            keystore.unlock("old-pass").unwrap_err(),
            CoreError::WrongPassword
        );

        // Credentials were not re-encrypted and still decrypt
        for id in &account_ids {
            assert!(store.usable_secret(id, Some(&dek_after[..])).is_ok());
        }
    }

    #[test]
    fn test_rotate_with_wrong_old_password_changes_nothing() {
        let (_store, keystore, _ids) = setup();
        keystore.lock("old-pass", None).unwrap();

        assert_eq!(
            keystore.rotate("bad", "new-pass", None).unwrap_err(),
            CoreError::WrongPassword
        );
        // Old password still works
        assert!(keystore.unlock("old-pass").is_ok());
    }

    #[test]
    fn test_current_key_states() {
        let (_store, keystore, _ids) = setup();

        // Unlocked: no key needed, password irrelevant
        assert!(keystore.current_key(None).unwrap().is_none());

        keystore.lock("hunter2", None).unwrap();
        assert_eq!(
            keystore.current_key(None).unwrap_err(),
            CoreError::DatabaseLocked
        );
        assert!(keystore.current_key(Some("hunter2")).unwrap().is_some());
        assert_eq!(
            keystore.current_key(Some("wrong")).unwrap_err(),
            CoreError::WrongPassword
        );
    }
}
