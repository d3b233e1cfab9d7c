//! Configuration for the authorization and polling subsystem.
//!
//! Loaded from a TOML file (path in `LATTICE_CONFIG`) with per-field
//! defaults, so a missing file or missing section falls back to the
//! documented constants.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Complete core configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default)]
    pub polling: PollingSettings,
}

/// OAuth coordinator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthSettings {
    /// How long an issued state token remains consumable (seconds).
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    /// Access tokens expiring within this buffer are refreshed before use.
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_seconds: i64,
    /// Per-request timeout for provider token and profile calls (seconds).
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_refresh_buffer() -> i64 {
    60
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            refresh_buffer_seconds: default_refresh_buffer(),
            http_timeout_seconds: default_http_timeout(),
        }
    }
}

/// Polling trigger engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingSettings {
    /// Interval between scheduler ticks (seconds).
    #[serde(default = "default_poll_interval")]
    pub interval_seconds: u64,
    /// A confirmed item counts as "new" only if created within this window.
    #[serde(default = "default_recency_window")]
    pub recency_window_seconds: i64,
    /// Page size for provider delta queries.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Per-request timeout for provider and dispatcher HTTP calls (seconds).
    /// Bounds how long one credential's poll can hold its processing slot.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_recency_window() -> i64 {
    300
}

fn default_page_size() -> u32 {
    50
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_poll_interval(),
            recency_window_seconds: default_recency_window(),
            page_size: default_page_size(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl CoreConfig {
    /// Parses configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file {}", path.as_ref().display())
        })?;
        toml::from_str(&raw).context("Failed to parse config file")
    }

    /// Loads configuration from `LATTICE_CONFIG`, falling back to defaults
    /// when the variable is unset.
    pub fn load() -> Result<Self> {
        match std::env::var("LATTICE_CONFIG") {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }
}
