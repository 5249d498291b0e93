// Error taxonomy shared across the core
pub mod error;

// Account directory and resolution
pub mod accounts;

// Encrypted credential storage and key lifecycle
pub mod credentials;

// Outbound calendar API client
pub mod calendar;

// Tool registration and local JSON-RPC serving
pub mod tools;

// Configuration
pub mod config;
