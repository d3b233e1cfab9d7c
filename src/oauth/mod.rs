//! OAuth 2.0 authorization flow and token refresh.
//!
//! Authorization code flow:
//! 1. Controller asks for an authorize URL (`get_auth_url`)
//! 2. User authorizes on the provider's site
//! 3. Provider redirects back; controller hands code + state to
//!    `handle_callback`
//! 4. Tokens are exchanged and persisted; the credential becomes valid
//!
//! Refresh is reused by both scheduled refresh and the polling engine's
//! hot path (`ensure_fresh`).

mod exchange;
mod provider;
mod state;

pub use exchange::is_redirect_uri_mismatch;
pub use provider::{ProfileKind, ProviderSpec, ProviderTable};
pub use state::{run_state_pruner, PendingAuth, StateStore};

use crate::config::OAuthSettings;
use crate::credentials::{Credential, CredentialStore, CredentialType};
use crate::error::AuthError;
use anyhow::Context;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of `get_auth_url`: the provider authorize URL plus the state bound
/// to this attempt.
#[derive(Clone, Debug, Serialize)]
pub struct AuthUrl {
    pub auth_url: String,
    pub state: String,
}

/// Result of `handle_callback`.
///
/// Exchange failures are reported here with `success = false` rather than as
/// an error, so the controller can redirect the user gracefully. Only a
/// broken flow (bad state, missing credential, misconfiguration) is an `Err`.
#[derive(Clone, Debug, Serialize)]
pub struct CallbackOutcome {
    pub success: bool,
    pub credential_id: Option<Uuid>,
    pub error: Option<String>,
    /// Frontend URL captured when the flow started, for the controller's
    /// final redirect.
    pub redirect_url: Option<String>,
}

/// Coordinates authorization, callback handling, and token refresh for all
/// providers in the table.
pub struct OAuthCoordinator {
    store: Arc<CredentialStore>,
    providers: ProviderTable,
    states: StateStore,
    http: reqwest::Client,
    refresh_buffer: Duration,
}

impl OAuthCoordinator {
    pub fn new(store: Arc<CredentialStore>, settings: &OAuthSettings) -> anyhow::Result<Self> {
        Self::with_providers(store, ProviderTable::builtin(), settings)
    }

    /// Constructor with an explicit provider table (tests point it at mock
    /// servers).
    ///
    /// Provider calls carry a per-request timeout; refresh runs on the
    /// polling hot path, so a stalled token endpoint must fail the single
    /// operation rather than hang it.
    pub fn with_providers(
        store: Arc<CredentialStore>,
        providers: ProviderTable,
        settings: &OAuthSettings,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.http_timeout_seconds))
            .build()
            .context("Failed to build OAuth HTTP client")?;
        Ok(Self {
            store,
            providers,
            states: StateStore::new(settings.state_ttl_seconds),
            http,
            refresh_buffer: Duration::seconds(settings.refresh_buffer_seconds),
        })
    }

    /// State store handle for the background pruner and for tests.
    pub fn state_store(&self) -> StateStore {
        self.states.clone()
    }

    fn spec_for(&self, provider: &str) -> Result<&ProviderSpec, AuthError> {
        self.providers
            .get(provider)
            .ok_or_else(|| AuthError::UnknownProvider(provider.to_string()))
    }

    fn client_config<'a>(
        &self,
        credential: &'a Credential,
    ) -> Result<(&'a str, &'a str), AuthError> {
        match (
            credential.client_id.as_deref(),
            credential.client_secret.as_deref(),
        ) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            _ => Err(AuthError::Configuration(format!(
                "credential {} has no client id/secret configured",
                credential.id
            ))),
        }
    }

    /// Builds the provider authorize URL and issues a CSRF state for one
    /// authorization attempt.
    ///
    /// No state is issued when the credential is missing, belongs to another
    /// user, is misconfigured, or names an unknown provider.
    pub fn get_auth_url(
        &self,
        user_id: &str,
        credential_id: Uuid,
        redirect_url: Option<String>,
    ) -> Result<AuthUrl, AuthError> {
        let credential = self
            .store
            .get_for_user(credential_id, user_id)
            .context("Failed to load credential")?
            .ok_or(AuthError::CredentialNotFound(credential_id))?;

        let spec = self.spec_for(&credential.provider)?;
        let (client_id, _) = self.client_config(&credential)?;

        let state = self.states.issue(user_id, credential_id, redirect_url);
        let redirect_uri = callback_redirect_uri(&credential.provider);
        let auth_url = spec.build_authorize_url(client_id, &redirect_uri, &state);

        info!(
            credential_id = %credential_id,
            provider = %credential.provider,
            "Issued authorization URL"
        );

        Ok(AuthUrl { auth_url, state })
    }

    /// Consumes the callback: validates the state, exchanges the code, and
    /// persists tokens.
    pub async fn handle_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<CallbackOutcome, AuthError> {
        // Consumed before any further work so a concurrent second callback
        // can never replay it.
        let pending = self.states.consume(state).ok_or(AuthError::StateExpired)?;

        let credential = self
            .store
            .get_for_user(pending.credential_id, &pending.user_id)
            .context("Failed to load credential")?
            .ok_or(AuthError::CredentialNotFound(pending.credential_id))?;

        let spec = self.spec_for(&credential.provider)?;
        let (client_id, client_secret) = self.client_config(&credential)?;

        let redirect_uri = callback_redirect_uri(&credential.provider);
        let update = match exchange::exchange_code(
            &self.http,
            spec,
            client_id,
            client_secret,
            code,
            &redirect_uri,
        )
        .await
        {
            Ok(update) => update,
            Err(e) => {
                let raw = e.to_string();
                warn!(
                    credential_id = %credential.id,
                    provider = %credential.provider,
                    error = %raw,
                    "Token exchange failed"
                );
                let message = if exchange::is_redirect_uri_mismatch(&raw) {
                    format!(
                        "Redirect URI mismatch: the callback URL registered with {} \
                         does not match this deployment. Update the provider app \
                         configuration and retry. ({})",
                        credential.provider, raw
                    )
                } else {
                    raw
                };
                return Ok(CallbackOutcome {
                    success: false,
                    credential_id: Some(credential.id),
                    error: Some(message),
                    redirect_url: pending.redirect_url,
                });
            }
        };

        // Display naming only; failures here never fail the callback
        let profile = exchange::fetch_profile(&self.http, spec, &update.access_token).await;

        self.store
            .store_tokens(credential.id, &update)
            .context("Failed to persist tokens")?;

        let display_name = match &profile {
            Some(identifier) => format!("{} ({})", credential.provider, identifier),
            None => credential.provider.clone(),
        };
        self.store
            .set_display_name(credential.id, &display_name)
            .context("Failed to persist display name")?;

        info!(
            credential_id = %credential.id,
            provider = %credential.provider,
            has_refresh_token = update.refresh_token.is_some(),
            "Authorization completed"
        );

        Ok(CallbackOutcome {
            success: true,
            credential_id: Some(credential.id),
            error: None,
            redirect_url: pending.redirect_url,
        })
    }

    /// Refreshes the access token for a credential.
    ///
    /// Fails fast (zero network calls) when the credential is not an OAuth2
    /// credential or lacks refresh material. A rejected refresh marks the
    /// credential invalid and surfaces as `ReauthRequired`; it is never
    /// retried here.
    pub async fn refresh_credential(&self, credential_id: Uuid) -> Result<Credential, AuthError> {
        let mut credential = self
            .store
            .get(credential_id)
            .context("Failed to load credential")?
            .ok_or(AuthError::CredentialNotFound(credential_id))?;

        if credential.credential_type != CredentialType::OAuth2 {
            return Err(AuthError::Configuration(format!(
                "credential {} is not an oauth2 credential",
                credential_id
            )));
        }
        let refresh_token = credential.refresh_token.clone().ok_or_else(|| {
            AuthError::Configuration(format!(
                "credential {} has no refresh token",
                credential_id
            ))
        })?;
        let (client_id, client_secret) = self.client_config(&credential)?;
        let spec = self.spec_for(&credential.provider)?;

        let update = match exchange::refresh_grant(
            &self.http,
            spec,
            client_id,
            client_secret,
            &refresh_token,
        )
        .await
        {
            Ok(update) => update,
            Err(e) => {
                warn!(
                    credential_id = %credential_id,
                    provider = %credential.provider,
                    error = %e,
                    "Token refresh rejected, marking credential invalid"
                );
                self.store
                    .mark_invalid(credential_id)
                    .context("Failed to mark credential invalid")?;
                return Err(AuthError::ReauthRequired(e.to_string()));
            }
        };

        self.store
            .store_tokens(credential_id, &update)
            .context("Failed to persist refreshed tokens")?;

        debug!(credential_id = %credential_id, "Access token refreshed");

        credential.access_token = Some(update.access_token);
        if update.refresh_token.is_some() {
            credential.refresh_token = update.refresh_token;
        }
        credential.expires_at = update.expires_at;
        if update.scope.is_some() {
            credential.scope = update.scope;
        }
        credential.is_valid = true;
        credential.updated_at = Utc::now();

        Ok(credential)
    }

    /// Ensures the credential's access token is usable right now.
    ///
    /// Hot path for every action execution and every polling cycle: returns
    /// the credential unchanged when the token is not near expiry, otherwise
    /// performs exactly one refresh attempt. Failures are fatal to the single
    /// calling operation only.
    pub async fn ensure_fresh(&self, credential: Credential) -> Result<Credential, AuthError> {
        if credential.access_token.is_none() {
            return Err(AuthError::Configuration(format!(
                "credential {} has no access token; authorization required",
                credential.id
            )));
        }

        let needs_refresh = match credential.expires_at {
            Some(expires_at) => expires_at <= Utc::now() + self.refresh_buffer,
            None => false,
        };
        if !needs_refresh {
            return Ok(credential);
        }

        debug!(
            credential_id = %credential.id,
            expires_at = ?credential.expires_at,
            "Access token near expiry, refreshing"
        );
        self.refresh_credential(credential.id).await
    }
}

/// Callback URI registered with the provider for this deployment.
///
/// The controller layer serves this route; the base URL comes from the
/// environment so one provider app works per deployment.
pub fn callback_redirect_uri(provider: &str) -> String {
    let base = std::env::var("LATTICE_CALLBACK_BASE_URL")
        .unwrap_or_else(|_| "http://localhost:8080".to_string());
    format!("{}/credentials/{}/callback", base, provider)
}
