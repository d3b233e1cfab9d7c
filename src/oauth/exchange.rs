//! Token endpoint calls: authorization-code exchange and refresh-token grant.

use super::provider::{ProfileKind, ProviderSpec};
use crate::credentials::TokenUpdate;
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Standard OAuth 2.0 token response.
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_update(self) -> TokenUpdate {
        TokenUpdate {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|seconds| Utc::now() + Duration::seconds(seconds)),
            scope: self.scope,
        }
    }
}

async fn post_token_form(
    http: &reqwest::Client,
    token_url: &str,
    form: &HashMap<&str, &str>,
) -> Result<TokenUpdate> {
    let response = http
        .post(token_url)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await
        .context("Failed to send token request")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        return Err(anyhow!("Token request failed with status {}: {}", status, body));
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .context("Failed to parse token response")?;

    tracing::debug!(
        has_refresh_token = token_response.refresh_token.is_some(),
        expires_in = ?token_response.expires_in,
        "Token endpoint call succeeded"
    );

    Ok(token_response.into_update())
}

/// Exchanges an authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    spec: &ProviderSpec,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenUpdate> {
    let mut form = HashMap::new();
    form.insert("grant_type", "authorization_code");
    form.insert("code", code);
    form.insert("redirect_uri", redirect_uri);
    form.insert("client_id", client_id);
    form.insert("client_secret", client_secret);

    tracing::debug!(provider = %spec.id, "Exchanging authorization code");
    post_token_form(http, &spec.token_url, &form).await
}

/// Obtains a new access token via the refresh-token grant.
pub async fn refresh_grant(
    http: &reqwest::Client,
    spec: &ProviderSpec,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<TokenUpdate> {
    let mut form = HashMap::new();
    form.insert("grant_type", "refresh_token");
    form.insert("refresh_token", refresh_token);
    form.insert("client_id", client_id);
    form.insert("client_secret", client_secret);

    tracing::debug!(provider = %spec.id, "Refreshing access token");
    post_token_form(http, &spec.token_url, &form).await
}

/// Fetches a display identifier from the provider profile endpoint.
///
/// Best-effort: any failure is logged and swallowed, since the identifier is
/// only used for display naming.
pub async fn fetch_profile(
    http: &reqwest::Client,
    spec: &ProviderSpec,
    access_token: &str,
) -> Option<String> {
    let response = match http
        .get(&spec.profile_url)
        .bearer_auth(access_token)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(provider = %spec.id, error = %e, "Profile fetch failed");
            return None;
        }
    };

    if !response.status().is_success() {
        tracing::debug!(
            provider = %spec.id,
            status = %response.status(),
            "Profile endpoint returned an error"
        );
        return None;
    }

    let body: serde_json::Value = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(provider = %spec.id, error = %e, "Profile response not parseable");
            return None;
        }
    };

    let identifier = match spec.profile {
        ProfileKind::GoogleEmail => body.get("email").and_then(|v| v.as_str()),
        ProfileKind::SpotifyAccount => body
            .get("email")
            .and_then(|v| v.as_str())
            .or_else(|| body.get("id").and_then(|v| v.as_str())),
        ProfileKind::TwitchLogin => body.get("login").and_then(|v| v.as_str()),
    };

    identifier.map(|s| s.to_string())
}

/// Heuristic for redirect-URI-mismatch errors, so callback handling can show
/// actionable guidance instead of a generic provider failure.
pub fn is_redirect_uri_mismatch(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("redirect_uri_mismatch")
        || lower.contains("redirect uri")
        || lower.contains("invalid redirect")
}
