//! HTTP client for the remote calendar API.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// A freshly obtained short-lived access token.
#[derive(Debug, Clone)]
pub struct FreshAccessToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// OAuth token endpoint response (standard OAuth 2.0 refresh grant).
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Bearer-authenticated client for calendar operations.
///
/// Calendar and event payloads are opaque JSON, returned to the caller
/// verbatim.
pub struct CalendarClient {
    http_client: Client,
    api_base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl CalendarClient {
    pub fn new(
        api_base_url: String,
        token_url: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        let http_client = Client::builder()
            .user_agent("calbridge/0.1")
            .build()
            .expect("Failed to build HTTP client");
        Self {
            http_client,
            api_base_url,
            token_url,
            client_id,
            client_secret,
        }
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<FreshAccessToken> {
        let mut form_data = HashMap::new();
        form_data.insert("grant_type", "refresh_token");
        form_data.insert("refresh_token", refresh_token);
        form_data.insert("client_id", self.client_id.as_str());
        form_data.insert("client_secret", self.client_secret.as_str());

        let response = self
            .http_client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form_data)
            .send()
            .await
            .context("Failed to send token refresh request")?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("Token refresh failed with status {}", status));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;

        tracing::debug!(
            expires_in = ?token_response.expires_in,
            "access token refreshed"
        );

        let expires_at = token_response
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds));

        Ok(FreshAccessToken {
            access_token: token_response.access_token,
            expires_at,
        })
    }

    /// Fetch the account's calendar list.
    pub async fn list_calendars(&self, access_token: &str) -> Result<Value> {
        let url = format!("{}/users/me/calendarList", self.api_base_url);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("Failed to send list_calendars request")?;
        json_body(response).await
    }

    /// List events on a calendar, optionally bounded by a time window.
    pub async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        time_min: Option<&str>,
        time_max: Option<&str>,
    ) -> Result<Value> {
        let url = format!(
            "{}/calendars/{}/events",
            self.api_base_url,
            urlencode(calendar_id)
        );
        let mut request = self
            .http_client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("singleEvents", "true"), ("orderBy", "startTime")]);
        if let Some(time_min) = time_min {
            request = request.query(&[("timeMin", time_min)]);
        }
        if let Some(time_max) = time_max {
            request = request.query(&[("timeMax", time_max)]);
        }
        let response = request
            .send()
            .await
            .context("Failed to send list_events request")?;
        json_body(response).await
    }

    pub async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<Value> {
        let url = format!(
            "{}/calendars/{}/events/{}",
            self.api_base_url,
            urlencode(calendar_id),
            urlencode(event_id)
        );
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("Failed to send get_event request")?;
        json_body(response).await
    }

    pub async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &Value,
    ) -> Result<Value> {
        let url = format!(
            "{}/calendars/{}/events",
            self.api_base_url,
            urlencode(calendar_id)
        );
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await
            .context("Failed to send create_event request")?;
        json_body(response).await
    }

    pub async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &Value,
    ) -> Result<Value> {
        let url = format!(
            "{}/calendars/{}/events/{}",
            self.api_base_url,
            urlencode(calendar_id),
            urlencode(event_id)
        );
        let response = self
            .http_client
            .patch(&url)
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await
            .context("Failed to send update_event request")?;
        json_body(response).await
    }

    pub async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/calendars/{}/events/{}",
            self.api_base_url,
            urlencode(calendar_id),
            urlencode(event_id)
        );
        let response = self
            .http_client
            .delete(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("Failed to send delete_event request")?;
        check_status(&response)?;
        Ok(())
    }
}

async fn json_body(response: Response) -> Result<Value> {
    check_status(&response)?;
    response
        .json::<Value>()
        .await
        .context("Failed to parse calendar API response")
}

fn check_status(response: &Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(anyhow!("Calendar API request failed with status {}", status))
    }
}

/// Percent-encode a path segment (calendar and event ids may contain `@`).
fn urlencode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}
