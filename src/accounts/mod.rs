//! Linked external accounts.
//!
//! An [`Account`] identifies one linked external identity. Emails are
//! unique across accounts (case-preserved, matched case-insensitively by
//! the resolver). Rows live in the credential store; deleting an account
//! cascades to its credential.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod resolver;

pub use resolver::resolve;

/// A linked external account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Opaque stable identifier (UUID v4).
    pub id: String,
    /// Identifier of the user at the external service.
    pub external_user_id: String,
    /// Unique email, case-preserved.
    pub email: String,
    pub display_name: Option<String>,
    /// Granted permission scopes.
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for linking (or re-linking) an account. On re-link of an existing
/// email, `display_name` and `scopes` are updated in place.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub external_user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub scopes: Vec<String>,
}
