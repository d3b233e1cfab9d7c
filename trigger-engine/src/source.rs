//! Provider delta-query client.
//!
//! The [`EventSource`] trait is the engine's view of a provider's
//! incremental list API: hand in the last sync cursor, get back the items
//! that changed plus the next cursor. [`GoogleCalendarSource`] is the
//! concrete implementation against a Google-Calendar-style events API.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Errors the engine reacts to distinctly.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The stored sync cursor was rejected; a full resync is required.
    #[error("sync cursor is no longer valid")]
    CursorInvalid,

    /// The access token was rejected mid-poll.
    #[error("access token rejected by provider")]
    Unauthorized,

    /// Network-level failure; retried on the next tick.
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Any other non-success response.
    #[error("provider returned status {status}: {body}")]
    Api { status: u16, body: String },
}

/// One item from the provider's delta response.
#[derive(Clone, Debug)]
pub struct SourceItem {
    pub id: String,
    /// Provider-reported status: "confirmed", "cancelled", ...
    pub status: String,
    /// When the item was created on the provider side.
    pub created: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

/// Result of one delta query.
#[derive(Debug, Default)]
pub struct DeltaPage {
    pub items: Vec<SourceItem>,
    /// Cursor to persist for the next incremental query. Providers only
    /// hand this back on the final page of a delta.
    pub next_cursor: Option<String>,
}

/// A provider's incremental list API.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetches everything changed since `cursor` (everything visible when
    /// `cursor` is `None`).
    async fn fetch_delta(
        &self,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, SourceError>;
}

/// Wire format of the events list endpoint.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    #[serde(default)]
    items: Vec<RawEvent>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    next_sync_token: Option<String>,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    summary: Option<String>,
}

impl From<RawEvent> for SourceItem {
    fn from(raw: RawEvent) -> Self {
        SourceItem {
            id: raw.id,
            status: raw.status.unwrap_or_default(),
            created: raw.created,
            summary: raw.summary,
        }
    }
}

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

/// Pages fetched per delta at most; a misbehaving provider cannot pin a
/// credential's cycle forever.
const MAX_PAGES: u32 = 10;

/// Delta client for the Google Calendar events API.
///
/// Uses `syncToken` for incremental queries and follows `pageToken`
/// pagination until the provider hands back the next sync token. A 410
/// response maps to [`SourceError::CursorInvalid`] (the provider's
/// full-resync signal), a 401 to [`SourceError::Unauthorized`].
pub struct GoogleCalendarSource {
    http: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl GoogleCalendarSource {
    pub fn new(page_size: u32, timeout_seconds: u64) -> anyhow::Result<Self> {
        Self::with_base_url(page_size, timeout_seconds, DEFAULT_BASE_URL.to_string())
    }

    /// Custom base URL, for tests against a mock server.
    ///
    /// The timeout bounds the whole request including the body read; a
    /// stalled provider fails the poll instead of holding the credential's
    /// processing slot indefinitely.
    pub fn with_base_url(
        page_size: u32,
        timeout_seconds: u64,
        base_url: String,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to build provider HTTP client")?;
        Ok(Self {
            http,
            base_url,
            page_size,
        })
    }

    async fn fetch_page(
        &self,
        access_token: &str,
        cursor: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<EventsResponse, SourceError> {
        let url = format!("{}/calendars/primary/events", self.base_url);

        let mut request = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("maxResults", self.page_size.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("syncToken", cursor)]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request.send().await?;
        let status = response.status();

        match status.as_u16() {
            410 => return Err(SourceError::CursorInvalid),
            401 => return Err(SourceError::Unauthorized),
            _ if !status.is_success() => {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<failed to read body>".to_string());
                return Err(SourceError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            _ => {}
        }

        Ok(response.json::<EventsResponse>().await?)
    }
}

#[async_trait]
impl EventSource for GoogleCalendarSource {
    async fn fetch_delta(
        &self,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, SourceError> {
        let mut delta = DeltaPage::default();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page = self
                .fetch_page(access_token, cursor, page_token.as_deref())
                .await?;

            delta.items.extend(page.items.into_iter().map(SourceItem::from));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => {
                    delta.next_cursor = page.next_sync_token;
                    return Ok(delta);
                }
            }
        }

        tracing::warn!(pages = MAX_PAGES, "Delta pagination cap hit, stopping early");
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(server: &mockito::Server) -> GoogleCalendarSource {
        GoogleCalendarSource::with_base_url(50, 5, server.url()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_delta_with_cursor() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("syncToken".into(), "S1".into()),
                mockito::Matcher::UrlEncoded("maxResults".into(), "50".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "items": [
                        {"id": "e1", "status": "confirmed", "created": "2026-08-29T10:00:00Z", "summary": "Standup"}
                    ],
                    "nextSyncToken": "S2"
                }"#,
            )
            .create_async()
            .await;

        let page = source(&server)
            .fetch_delta("tok", Some("S1"))
            .await
            .expect("delta should succeed");

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "e1");
        assert_eq!(page.items[0].status, "confirmed");
        assert!(page.items[0].created.is_some());
        assert_eq!(page.next_cursor, Some("S2".to_string()));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_delta_follows_pagination() {
        let mut server = mockito::Server::new_async().await;
        let _first = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("maxResults".into(), "50".into()),
                mockito::Matcher::Regex("^maxResults=50$".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items": [{"id": "e1", "status": "confirmed"}], "nextPageToken": "P2"}"#)
            .create_async()
            .await;
        let _second = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::UrlEncoded("pageToken".into(), "P2".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items": [{"id": "e2", "status": "cancelled"}], "nextSyncToken": "S9"}"#)
            .create_async()
            .await;

        let page = source(&server).fetch_delta("tok", None).await.unwrap();

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].id, "e2");
        assert_eq!(page.next_cursor, Some("S9".to_string()));
    }

    #[tokio::test]
    async fn test_gone_maps_to_cursor_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::Any)
            .with_status(410)
            .create_async()
            .await;

        let err = source(&server).fetch_delta("tok", Some("stale")).await.unwrap_err();
        assert!(matches!(err, SourceError::CursorInvalid));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let err = source(&server).fetch_delta("tok", None).await.unwrap_err();
        assert!(matches!(err, SourceError::Unauthorized));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_api() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .with_body("backend unavailable")
            .create_async()
            .await;

        let err = source(&server).fetch_delta("tok", None).await.unwrap_err();
        match err {
            SourceError::Api { status, body } => {
                assert_eq!(status, 503);
                assert!(body.contains("backend unavailable"));
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_items_without_status_or_created() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items": [{"id": "e1"}], "nextSyncToken": "S1"}"#)
            .create_async()
            .await;

        let page = source(&server).fetch_delta("tok", None).await.unwrap();
        assert_eq!(page.items[0].status, "");
        assert!(page.items[0].created.is_none());
    }

    #[tokio::test]
    async fn test_stalled_provider_times_out() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/calendars/primary/events")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_chunked_body(|writer| {
                // Headers go out, then the body stalls past the client timeout
                std::thread::sleep(std::time::Duration::from_secs(3));
                writer.write_all(b"{}")
            })
            .create_async()
            .await;

        let source = GoogleCalendarSource::with_base_url(50, 1, server.url()).unwrap();
        let err = source.fetch_delta("tok", None).await.unwrap_err();
        match err {
            SourceError::Transport(e) => assert!(e.is_timeout()),
            other => panic!("expected transport timeout, got {:?}", other),
        }
    }
}
