// Configuration loading
pub mod config;

// Credential records and encrypted storage
pub mod credentials;

// Error taxonomy shared across the subsystem
pub mod error;

// OAuth2 authorization, callback handling, and token refresh
pub mod oauth;

pub use error::AuthError;
