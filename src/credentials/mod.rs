//! Credential records and encrypted storage.
//!
//! A credential is the per-user, per-provider row holding OAuth client
//! configuration, token material, and the provider sync cursor used by the
//! polling engine. Secret columns (client secret, access token, refresh
//! token) are sealed at rest with AES-256-GCM; the master key comes from an
//! environment variable and never touches disk.
//!
//! Only the OAuth coordinator and refresh manager mutate token material;
//! everything else reads through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod encryption;
mod store;

pub use encryption::{open, seal, validate_key};
pub use store::CredentialStore;

/// Whether a credential carries OAuth2 tokens or a static API key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    OAuth2,
    ApiKey,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::OAuth2 => "oauth2",
            CredentialType::ApiKey => "api_key",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "oauth2" => Some(CredentialType::OAuth2),
            "api_key" => Some(CredentialType::ApiKey),
            _ => None,
        }
    }
}

/// A persisted credential for one user and one service provider.
///
/// Lifecycle: created unauthenticated (no tokens, `is_valid = false`),
/// authorized via the OAuth callback, refreshed while valid, invalidated
/// when a refresh is rejected, deleted on explicit user action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub user_id: String,
    /// Provider id, e.g. "google", "spotify", "twitch".
    pub provider: String,
    pub credential_type: CredentialType,
    /// Human-readable label derived from the provider profile on callback.
    pub display_name: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub is_valid: bool,
    /// Opaque provider sync token for incremental polling.
    pub cursor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Creates a fresh, unauthenticated OAuth2 credential.
    pub fn new_oauth2(
        user_id: impl Into<String>,
        provider: impl Into<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            provider: provider.into(),
            credential_type: CredentialType::OAuth2,
            display_name: None,
            client_id,
            client_secret,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            scope: None,
            is_valid: false,
            cursor: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Token material persisted after a successful code exchange or refresh.
#[derive(Clone, Debug)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}
