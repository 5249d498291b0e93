//! Glue between account resolution, the credential store, and the calendar
//! API: resolve the caller's account key, obtain a usable access token
//! (cached, or refreshed from the stored refresh secret), and perform the
//! requested operation.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::Value;

use crate::accounts::{self, Account};
use crate::credentials::{CredentialStore, Keystore};
use crate::error::CoreError;

use super::client::CalendarClient;

/// Cached access tokens this close to expiry are refreshed anyway.
const EXPIRY_SKEW_SECS: i64 = 60;

pub struct CalendarService {
    pub(crate) store: Arc<CredentialStore>,
    pub(crate) keystore: Arc<Keystore>,
    client: CalendarClient,
    /// Unlock password for a locked store, from the configured source.
    /// `None` is fine while the store is unlocked.
    unlock_password: Option<String>,
}

impl CalendarService {
    pub fn new(
        store: Arc<CredentialStore>,
        keystore: Arc<Keystore>,
        client: CalendarClient,
        unlock_password: Option<String>,
    ) -> Self {
        Self {
            store,
            keystore,
            client,
            unlock_password,
        }
    }

    /// Resolves a caller-supplied account key to exactly one account.
    pub fn resolve_account(&self, key: Option<&str>) -> Result<Account, CoreError> {
        let accounts = self.store.list_accounts()?;
        accounts::resolve(key, &accounts).cloned()
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, CoreError> {
        self.store.list_accounts()
    }

    pub async fn list_calendars(&self, account_key: Option<&str>) -> Result<Value> {
        let account = self.resolve_account(account_key)?;
        let token = self.access_token(&account.id).await?;
        self.client.list_calendars(&token).await
    }

    pub async fn list_events(
        &self,
        account_key: Option<&str>,
        calendar_id: &str,
        time_min: Option<&str>,
        time_max: Option<&str>,
    ) -> Result<Value> {
        let account = self.resolve_account(account_key)?;
        let token = self.access_token(&account.id).await?;
        self.client
            .list_events(&token, calendar_id, time_min, time_max)
            .await
    }

    pub async fn get_event(
        &self,
        account_key: Option<&str>,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<Value> {
        let account = self.resolve_account(account_key)?;
        let token = self.access_token(&account.id).await?;
        self.client.get_event(&token, calendar_id, event_id).await
    }

    pub async fn create_event(
        &self,
        account_key: Option<&str>,
        calendar_id: &str,
        event: &Value,
    ) -> Result<Value> {
        let account = self.resolve_account(account_key)?;
        let token = self.access_token(&account.id).await?;
        self.client.create_event(&token, calendar_id, event).await
    }

    pub async fn update_event(
        &self,
        account_key: Option<&str>,
        calendar_id: &str,
        event_id: &str,
        event: &Value,
    ) -> Result<Value> {
        let account = self.resolve_account(account_key)?;
        let token = self.access_token(&account.id).await?;
        self.client
            .update_event(&token, calendar_id, event_id, event)
            .await
    }

    pub async fn delete_event(
        &self,
        account_key: Option<&str>,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<()> {
        let account = self.resolve_account(account_key)?;
        let token = self.access_token(&account.id).await?;
        self.client.delete_event(&token, calendar_id, event_id).await
    }

    /// Returns a usable access token for the account: the cached one when
    /// still comfortably valid, otherwise a fresh one obtained with the
    /// stored refresh secret. The DEK, when needed, is held only for the
    /// duration of the secret read.
    async fn access_token(&self, account_id: &str) -> Result<String> {
        let credential = self
            .store
            .get_credential(account_id)?
            .ok_or_else(|| CoreError::CredentialsNotFound(account_id.to_string()))?;

        if let (Some(token), Some(expires_at)) =
            (&credential.access_token, credential.access_token_expires_at)
        {
            if expires_at > Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) {
                return Ok(token.clone());
            }
        }

        let refresh_token = {
            let dek = self.keystore.current_key(self.unlock_password.as_deref())?;
            self.store
                .usable_secret(account_id, dek.as_ref().map(|d| &d[..]))?
        };

        let fresh = self.client.refresh_access_token(&refresh_token).await?;
        if let Some(expires_at) = fresh.expires_at {
            self.store
                .cache_access_token(account_id, &fresh.access_token, expires_at)?;
        }
        Ok(fresh.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::LinkRequest;
    use crate::credentials::KdfParams;

    fn service_with(server: &mockito::ServerGuard, password: Option<&str>) -> CalendarService {
        let store = Arc::new(CredentialStore::new(":memory:").unwrap());
        let keystore = Arc::new(Keystore::with_params(
            store.clone(),
            KdfParams {
                log_n: 5,
                r: 8,
                p: 1,
            },
        ));
        let client = CalendarClient::new(
            server.url(),
            format!("{}/token", server.url()),
            "client-id".to_string(),
            "client-secret".to_string(),
        );
        CalendarService::new(store, keystore, client, password.map(str::to_string))
    }

    fn link_with_secret(service: &CalendarService, email: &str) -> Account {
        let account = service
            .store
            .link_account(&LinkRequest {
                external_user_id: format!("ext-{}", email),
                email: email.to_string(),
                display_name: None,
                scopes: vec![],
            })
            .unwrap();
        service
            .store
            .store_secret(&account.id, "refresh-secret", None)
            .unwrap();
        account
    }

    #[tokio::test]
    async fn test_refreshes_and_caches_access_token() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-1","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/users/me/calendarList")
            .match_header("authorization", "Bearer at-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[]}"#)
            .expect(2)
            .create_async()
            .await;

        let service = service_with(&server, None);
        link_with_secret(&service, "a@x.com");

        // Two calls, one refresh: the second uses the cached token
        service.list_calendars(None).await.unwrap();
        service.list_calendars(None).await.unwrap();
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_locked_store_without_password_fails() {
        let server = mockito::Server::new_async().await;
        let service = service_with(&server, None);
        let _account = link_with_secret(&service, "a@x.com");
        service.keystore.lock("hunter2", None).unwrap();

        let err = service.list_calendars(None).await.unwrap_err();
        let core = err.downcast_ref::<CoreError>().unwrap();
        assert_eq!(core, &CoreError::DatabaseLocked);
    }

    #[tokio::test]
    async fn test_locked_store_with_password_refreshes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-2","expires_in":3600}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/users/me/calendarList")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[]}"#)
            .create_async()
            .await;

        let service = service_with(&server, Some("hunter2"));
        link_with_secret(&service, "a@x.com");
        service.keystore.lock("hunter2", None).unwrap();

        service.list_calendars(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolution_errors_pass_through() {
        let server = mockito::Server::new_async().await;
        let service = service_with(&server, None);

        let err = service.list_calendars(None).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<CoreError>().unwrap(),
            &CoreError::NoAccounts
        );
    }
}
