//! SQLite persistence for accounts, credentials, and key material.
//!
//! # Schema
//! ```sql
//! CREATE TABLE accounts (
//!     id TEXT PRIMARY KEY,
//!     external_user_id TEXT NOT NULL,
//!     email TEXT NOT NULL UNIQUE,
//!     display_name TEXT,
//!     scopes TEXT NOT NULL,             -- JSON array
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//! CREATE TABLE credentials (
//!     account_id TEXT PRIMARY KEY
//!         REFERENCES accounts(id) ON DELETE CASCADE,
//!     refresh_token TEXT,               -- plaintext form
//!     refresh_token_ciphertext BLOB,    -- encrypted form
//!     refresh_token_iv BLOB,
//!     refresh_token_tag BLOB,
//!     access_token TEXT,                -- short-lived cache, not encrypted
//!     access_token_expires_at TEXT,
//!     token_version INTEGER NOT NULL,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//! CREATE TABLE key_material (           -- singleton row, id = 1
//!     id INTEGER PRIMARY KEY CHECK (id = 1),
//!     is_locked INTEGER NOT NULL,
//!     kdf_algorithm TEXT NOT NULL,
//!     kdf_salt BLOB,
//!     kdf_params TEXT,                  -- JSON cost parameters
//!     wrapped_dek BLOB,
//!     wrapped_dek_iv BLOB,
//!     wrapped_dek_tag BLOB,
//!     password_hint TEXT
//! );
//! ```
//!
//! Exactly one of `refresh_token` and the `refresh_token_*` blob columns is
//! populated per row; the tagged [`SecretForm`] makes that explicit at the
//! component boundary. Multi-row mutations (lock migration, rotation) run
//! through [`CredentialStore::transaction`] so a crash or concurrent writer
//! never observes a partially-migrated store.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::accounts::{Account, LinkRequest};
use crate::error::CoreError;

use super::encryption::{self, EncryptedSecret};
use super::keystore::KeyMaterial;
use super::{SecretForm, StoredCredential};

/// Bounded wait for a database locked by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store for accounts, credentials, and the key-material
/// singleton.
///
/// The connection is wrapped in a Mutex; cross-process writers are
/// serialized by SQLite itself with a bounded busy timeout.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Creates or opens a store at `db_path`, bootstrapping the schema and
    /// seeding the key-material singleton as unlocked.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, CoreError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                external_user_id TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT,
                scopes TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS credentials (
                account_id TEXT PRIMARY KEY
                    REFERENCES accounts(id) ON DELETE CASCADE,
                refresh_token TEXT,
                refresh_token_ciphertext BLOB,
                refresh_token_iv BLOB,
                refresh_token_tag BLOB,
                access_token TEXT,
                access_token_expires_at TEXT,
                token_version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS key_material (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_locked INTEGER NOT NULL DEFAULT 0,
                kdf_algorithm TEXT NOT NULL DEFAULT 'scrypt',
                kdf_salt BLOB,
                kdf_params TEXT,
                wrapped_dek BLOB,
                wrapped_dek_iv BLOB,
                wrapped_dek_tag BLOB,
                password_hint TEXT
            );
            INSERT OR IGNORE INTO key_material (id, is_locked) VALUES (1, 0);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` inside a single SQLite transaction. Commits when `f`
    /// returns Ok, rolls back otherwise.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Account directory
    // ------------------------------------------------------------------

    /// Links an account, or updates a previously linked one.
    ///
    /// Identity is the unique email: re-linking an existing email updates
    /// `external_user_id`, `display_name` and `scopes` in place, preserving
    /// the account id and `created_at`.
    pub fn link_account(&self, request: &LinkRequest) -> Result<Account, CoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let scopes_json = serde_json::to_string(&request.scopes)
            .map_err(|e| CoreError::Storage(format!("failed to serialize scopes: {}", e)))?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM accounts WHERE email = ?1",
                params![request.email],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                conn.execute(
                    r#"
                    UPDATE accounts
                    SET external_user_id = ?1, display_name = ?2,
                        scopes = ?3, updated_at = ?4
                    WHERE id = ?5
                    "#,
                    params![
                        request.external_user_id,
                        request.display_name,
                        scopes_json,
                        now.to_rfc3339(),
                        id,
                    ],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    r#"
                    INSERT INTO accounts
                        (id, external_user_id, email, display_name, scopes,
                         created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        id,
                        request.external_user_id,
                        request.email,
                        request.display_name,
                        scopes_json,
                        now.to_rfc3339(),
                        now.to_rfc3339(),
                    ],
                )?;
                id
            }
        };

        drop(conn);
        self.get_account(&id)?
            .ok_or_else(|| CoreError::Storage("linked account vanished".to_string()))
    }

    pub fn get_account(&self, id: &str) -> Result<Option<Account>, CoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, external_user_id, email, display_name, scopes,
                    created_at, updated_at
             FROM accounts WHERE id = ?1",
            params![id],
            account_from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    /// All linked accounts, ordered by email.
    pub fn list_accounts(&self) -> Result<Vec<Account>, CoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, external_user_id, email, display_name, scopes,
                    created_at, updated_at
             FROM accounts ORDER BY email",
        )?;
        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<Result<Vec<Account>, _>>()?;
        Ok(accounts)
    }

    /// Removes an account; its credential row is cascade-deleted.
    /// Returns false if no such account existed.
    pub fn remove_account(&self, id: &str) -> Result<bool, CoreError> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ------------------------------------------------------------------
    // Credential adapter
    // ------------------------------------------------------------------

    /// Returns the decrypted refresh secret for `account_id`.
    ///
    /// Plaintext rows return directly (the unlocked-state path; the
    /// keystore's state guarantees it is never taken while locked).
    /// Encrypted rows require `dek` and fail with
    /// [`CoreError::DatabaseLocked`] without one.
    pub fn usable_secret(&self, account_id: &str, dek: Option<&[u8]>) -> Result<String, CoreError> {
        let credential = self
            .get_credential(account_id)?
            .ok_or_else(|| CoreError::CredentialsNotFound(account_id.to_string()))?;

        match credential.secret {
            SecretForm::Plaintext(secret) => Ok(secret),
            SecretForm::Encrypted(encrypted) => {
                let dek = dek.ok_or(CoreError::DatabaseLocked)?;
                let plaintext =
                    encryption::decrypt(dek, &encrypted, &encryption::refresh_token_aad(account_id))?;
                String::from_utf8(plaintext)
                    .map_err(|_| CoreError::Storage("decrypted secret is not UTF-8".to_string()))
            }
        }
    }

    /// Writes the refresh secret for `account_id`: plaintext form without a
    /// `dek` (store unlocked), encrypted form with one.
    pub fn store_secret(
        &self,
        account_id: &str,
        secret: &str,
        dek: Option<&[u8]>,
    ) -> Result<(), CoreError> {
        let conn = self.conn.lock().unwrap();
        match dek {
            None => write_plaintext_secret(&conn, account_id, secret),
            Some(dek) => {
                let encrypted = encryption::encrypt(
                    dek,
                    secret.as_bytes(),
                    &encryption::refresh_token_aad(account_id),
                )?;
                write_encrypted_secret(&conn, account_id, &encrypted)
            }
        }
    }

    pub fn get_credential(&self, account_id: &str) -> Result<Option<StoredCredential>, CoreError> {
        let conn = self.conn.lock().unwrap();
        read_credential(&conn, account_id)
    }

    /// Updates the short-lived access-token cache for an account.
    pub fn cache_access_token(
        &self,
        account_id: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE credentials
             SET access_token = ?1, access_token_expires_at = ?2, updated_at = ?3
             WHERE account_id = ?4",
            params![
                access_token,
                expires_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
                account_id,
            ],
        )?;
        if rows == 0 {
            return Err(CoreError::CredentialsNotFound(account_id.to_string()));
        }
        Ok(())
    }

    /// Reads the key-material singleton.
    pub fn key_material(&self) -> Result<KeyMaterial, CoreError> {
        let conn = self.conn.lock().unwrap();
        read_key_material(&conn)
    }
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let scopes_json: String = row.get(4)?;
    let scopes = serde_json::from_str(&scopes_json).unwrap_or_default();
    Ok(Account {
        id: row.get(0)?,
        external_user_id: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        scopes,
        created_at: parse_timestamp(row, 5)?,
        updated_at: parse_timestamp(row, 6)?,
    })
}

fn parse_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

// ----------------------------------------------------------------------
// Row helpers shared with the keystore's transactional operations
// ----------------------------------------------------------------------

pub(crate) fn read_credential(
    conn: &Connection,
    account_id: &str,
) -> Result<Option<StoredCredential>, CoreError> {
    let row = conn
        .query_row(
            "SELECT refresh_token, refresh_token_ciphertext, refresh_token_iv,
                    refresh_token_tag, access_token, access_token_expires_at,
                    token_version
             FROM credentials WHERE account_id = ?1",
            params![account_id],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, Option<Vec<u8>>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((plaintext, ciphertext, iv, tag, access_token, expires_at, token_version)) = row
    else {
        return Ok(None);
    };

    let secret = match (plaintext, ciphertext, iv, tag) {
        (Some(secret), None, None, None) => SecretForm::Plaintext(secret),
        (None, Some(ciphertext), Some(iv), Some(tag)) => {
            SecretForm::Encrypted(EncryptedSecret {
                ciphertext,
                iv,
                tag,
            })
        }
        _ => {
            return Err(CoreError::Storage(format!(
                "credential row for {} does not hold exactly one secret form",
                account_id
            )))
        }
    };

    let expires_at = expires_at
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| CoreError::Storage(format!("bad expiry timestamp: {}", e)))
        })
        .transpose()?;

    Ok(Some(StoredCredential {
        account_id: account_id.to_string(),
        secret,
        access_token,
        access_token_expires_at: expires_at,
        token_version,
    }))
}

pub(crate) fn write_plaintext_secret(
    conn: &Connection,
    account_id: &str,
    secret: &str,
) -> Result<(), CoreError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        r#"
        INSERT INTO credentials
            (account_id, refresh_token, token_version, created_at, updated_at)
        VALUES (?1, ?2, 1, ?3, ?3)
        ON CONFLICT(account_id) DO UPDATE SET
            refresh_token = excluded.refresh_token,
            refresh_token_ciphertext = NULL,
            refresh_token_iv = NULL,
            refresh_token_tag = NULL,
            updated_at = excluded.updated_at
        "#,
        params![account_id, secret, now],
    )?;
    Ok(())
}

pub(crate) fn write_encrypted_secret(
    conn: &Connection,
    account_id: &str,
    encrypted: &EncryptedSecret,
) -> Result<(), CoreError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        r#"
        INSERT INTO credentials
            (account_id, refresh_token_ciphertext, refresh_token_iv,
             refresh_token_tag, token_version, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
        ON CONFLICT(account_id) DO UPDATE SET
            refresh_token = NULL,
            refresh_token_ciphertext = excluded.refresh_token_ciphertext,
            refresh_token_iv = excluded.refresh_token_iv,
            refresh_token_tag = excluded.refresh_token_tag,
            updated_at = excluded.updated_at
        "#,
        params![
            account_id,
            encrypted.ciphertext,
            encrypted.iv,
            encrypted.tag,
            now,
        ],
    )?;
    Ok(())
}

/// All credential rows currently in plaintext form, for the lock migration.
pub(crate) fn plaintext_secrets(conn: &Connection) -> Result<Vec<(String, String)>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT account_id, refresh_token FROM credentials
         WHERE refresh_token IS NOT NULL ORDER BY account_id",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<(String, String)>, _>>()?;
    Ok(rows)
}

pub(crate) fn read_key_material(conn: &Connection) -> Result<KeyMaterial, CoreError> {
    conn.query_row(
        "SELECT is_locked, kdf_algorithm, kdf_salt, kdf_params,
                wrapped_dek, wrapped_dek_iv, wrapped_dek_tag, password_hint
         FROM key_material WHERE id = 1",
        [],
        |row| {
            let params_json: Option<String> = row.get(3)?;
            let wrapped: (Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>) =
                (row.get(4)?, row.get(5)?, row.get(6)?);
            Ok(KeyMaterial {
                is_locked: row.get::<_, i64>(0)? != 0,
                kdf_algorithm: row.get(1)?,
                kdf_salt: row.get(2)?,
                kdf_params: params_json.and_then(|s| serde_json::from_str(&s).ok()),
                wrapped_dek: match wrapped {
                    (Some(ciphertext), Some(iv), Some(tag)) => Some(EncryptedSecret {
                        ciphertext,
                        iv,
                        tag,
                    }),
                    _ => None,
                },
                password_hint: row.get(7)?,
            })
        },
    )
    .map_err(CoreError::from)
}

pub(crate) fn write_key_material(
    conn: &Connection,
    material: &KeyMaterial,
) -> Result<(), CoreError> {
    let params_json = material
        .kdf_params
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| CoreError::Storage(format!("failed to serialize kdf params: {}", e)))?;

    conn.execute(
        r#"
        UPDATE key_material
        SET is_locked = ?1, kdf_algorithm = ?2, kdf_salt = ?3, kdf_params = ?4,
            wrapped_dek = ?5, wrapped_dek_iv = ?6, wrapped_dek_tag = ?7,
            password_hint = ?8
        WHERE id = 1
        "#,
        params![
            material.is_locked as i64,
            material.kdf_algorithm,
            material.kdf_salt,
            params_json,
            material.wrapped_dek.as_ref().map(|w| w.ciphertext.clone()),
            material.wrapped_dek.as_ref().map(|w| w.iv.clone()),
            material.wrapped_dek.as_ref().map(|w| w.tag.clone()),
            material.password_hint,
        ],
    )?;
    Ok(())
}
