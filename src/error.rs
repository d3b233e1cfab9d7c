//! Error taxonomy for the credential and authorization subsystem.
//!
//! Callers branch on these variants: a `Configuration` error means no network
//! call was made and the credential needs setup, `StateExpired` means the
//! authorization flow must be restarted, and `ReauthRequired` means the stored
//! refresh material was rejected and the user has to re-authorize.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Missing client id/secret or refresh material. Raised before any
    /// network call is attempted.
    #[error("credential misconfigured: {0}")]
    Configuration(String),

    /// OAuth state token missing, already consumed, or past its TTL.
    /// Distinct from provider-side exchange failures so the caller can
    /// restart the flow instead of surfacing a provider error.
    #[error("authorization state is invalid or expired")]
    StateExpired,

    /// A token refresh was rejected by the provider. The credential has been
    /// marked invalid; the user must go through authorization again.
    #[error("reauthentication required: {0}")]
    ReauthRequired(String),

    #[error("unknown service provider: {0}")]
    UnknownProvider(String),

    #[error("credential not found: {0}")]
    CredentialNotFound(Uuid),

    /// Storage or other infrastructure failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
