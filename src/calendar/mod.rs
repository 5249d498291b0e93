//! Outbound calendar collaborator.
//!
//! The calendar domain stays opaque here: event and calendar payloads are
//! `serde_json::Value` passed through verbatim. This module only knows how
//! to turn a stored refresh token into a usable short-lived access token
//! and issue the CRUD calls.

mod client;
mod service;

pub use client::{CalendarClient, FreshAccessToken};
pub use service::CalendarService;
