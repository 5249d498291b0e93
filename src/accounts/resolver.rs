//! Maps a caller-supplied key to exactly one stored account.
//!
//! Resolution runs three tiers in strict order, returning on the first
//! that produces a single match:
//!
//! 1. Empty key: the sole linked account is the default; zero or several
//!    linked accounts fail.
//! 2. Exact match on `id` or `email` (byte-exact, case-sensitive). Exact
//!    wins outright: a full email that happens to be a substring of some
//!    other account's display name never causes ambiguity.
//! 3. Case-folded substring match over `email` and `display_name`,
//!    candidates ordered by email. One match resolves; several fail with
//!    the candidate list; none fails not-found.

use crate::error::CoreError;

use super::Account;

/// Resolves `key` against the full set of stored accounts.
///
/// `key` may be `None` or blank, which selects the single linked account
/// when exactly one exists.
pub fn resolve<'a>(key: Option<&str>, accounts: &'a [Account]) -> Result<&'a Account, CoreError> {
    let key = key.map(str::trim).unwrap_or("");

    if key.is_empty() {
        return match accounts {
            [] => Err(CoreError::NoAccounts),
            [only] => Ok(only),
            // Caller must disambiguate; no key means no useful candidates
            _ => Err(CoreError::AmbiguousAccount(Vec::new())),
        };
    }

    if let Some(exact) = accounts.iter().find(|a| a.id == key || a.email == key) {
        return Ok(exact);
    }

    let folded = key.to_lowercase();
    let mut matches: Vec<&Account> = accounts
        .iter()
        .filter(|a| {
            a.email.to_lowercase().contains(&folded)
                || a.display_name
                    .as_deref()
                    .unwrap_or("")
                    .to_lowercase()
                    .contains(&folded)
        })
        .collect();
    matches.sort_by(|a, b| a.email.cmp(&b.email));

    match matches.as_slice() {
        [] => Err(CoreError::AccountNotFound(key.to_string())),
        [only] => Ok(only),
        several => Err(CoreError::AmbiguousAccount(
            several.iter().map(|a| a.email.clone()).collect(),
        )),
    }
}
