//! Timer-driven polling engine.
//!
//! Per-credential cycle: Idle → Polling → {Success → Idle, TokenExpired →
//! Refresh → Polling (one retry), SyncTokenInvalid → FullResync → Idle}.
//! One credential's failure never affects another's cycle, and a credential
//! is never polled twice concurrently.

use crate::dispatch::WorkflowDispatcher;
use crate::registry::{TriggerKind, TriggerRegistry};
use crate::source::{EventSource, SourceError, SourceItem};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use lattice::config::PollingSettings;
use lattice::credentials::{Credential, CredentialStore};
use lattice::oauth::OAuthCoordinator;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counters for external monitoring.
#[derive(Clone, Debug, Default)]
pub struct EngineStatus {
    pub last_tick: Option<DateTime<Utc>>,
    pub tick_count: u64,
    pub credential_failures: u64,
    pub dispatched: u64,
}

/// A registration resolved for one tick: which workflow, which kind, and its
/// trigger configuration.
#[derive(Clone, Debug)]
struct RegisteredWorkflow {
    workflow_id: Uuid,
    kind: TriggerKind,
    config: serde_json::Value,
}

/// Classifies one delta item.
///
/// An item is "created" only when the provider reports it confirmed **and**
/// its creation time falls within the recency window; older confirmed items
/// are provider-side updates, not new events. Cancellation is explicit and
/// not subject to the window.
fn classify(
    item: &SourceItem,
    now: DateTime<Utc>,
    recency_window: Duration,
) -> Option<TriggerKind> {
    match item.status.as_str() {
        "cancelled" => Some(TriggerKind::EventCancelled),
        "confirmed" => {
            let created = item.created?;
            if now.signed_duration_since(created) <= recency_window {
                Some(TriggerKind::EventCreated)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn trigger_payload(
    credential: &Credential,
    item: &SourceItem,
    kind: TriggerKind,
    config: &serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "trigger": kind.as_str(),
        "eventId": item.id,
        "status": item.status,
        "summary": item.summary,
        "created": item.created,
        "credentialId": credential.id,
        "userId": credential.user_id,
        "config": config,
    })
}

/// Polls all live registrations on a fixed interval.
pub struct PollingEngine {
    registry: Arc<TriggerRegistry>,
    store: Arc<CredentialStore>,
    oauth: Arc<OAuthCoordinator>,
    source: Arc<dyn EventSource>,
    dispatcher: Arc<dyn WorkflowDispatcher>,
    /// Credentials with a poll currently in flight. Guards re-entrancy per
    /// credential across ticks; entries are always removed afterwards.
    processing: Mutex<HashSet<Uuid>>,
    /// Guards overlapping scheduler invocations only.
    tick_in_flight: AtomicBool,
    recency_window: Duration,
    status: Mutex<EngineStatus>,
}

impl PollingEngine {
    pub fn new(
        registry: Arc<TriggerRegistry>,
        store: Arc<CredentialStore>,
        oauth: Arc<OAuthCoordinator>,
        source: Arc<dyn EventSource>,
        dispatcher: Arc<dyn WorkflowDispatcher>,
        settings: &PollingSettings,
    ) -> Self {
        Self {
            registry,
            store,
            oauth,
            source,
            dispatcher,
            processing: Mutex::new(HashSet::new()),
            tick_in_flight: AtomicBool::new(false),
            recency_window: Duration::seconds(settings.recency_window_seconds),
            status: Mutex::new(EngineStatus::default()),
        }
    }

    pub fn status_snapshot(&self) -> EngineStatus {
        self.status.lock().unwrap().clone()
    }

    /// Starts the recurring scheduler (non-blocking). The returned handle is
    /// aborted on shutdown; in-flight provider calls are bounded by the HTTP
    /// client's own timeouts.
    pub fn start(self: &Arc<Self>, interval_seconds: u64) -> JoinHandle<()> {
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            info!(interval_secs = interval_seconds, "Starting polling scheduler");
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

            loop {
                interval.tick().await;

                if engine.tick_in_flight.swap(true, Ordering::SeqCst) {
                    debug!("Previous scheduler pass still running, skipping tick");
                    continue;
                }
                engine.poll_all_registrations().await;
                engine.tick_in_flight.store(false, Ordering::SeqCst);
            }
        })
    }

    /// One scheduler pass: snapshot registrations, group by credential,
    /// batch-load the credential rows, and poll each distinct credential
    /// concurrently with settle-all semantics.
    pub async fn poll_all_registrations(&self) {
        let mut grouped: HashMap<Uuid, Vec<RegisteredWorkflow>> = HashMap::new();
        for kind in TriggerKind::ALL {
            for (workflow_id, registration) in self.registry.snapshot(kind) {
                let Some(credential_id) = registration.credential_id else {
                    continue;
                };
                grouped.entry(credential_id).or_default().push(RegisteredWorkflow {
                    workflow_id,
                    kind,
                    config: registration.config,
                });
            }
        }

        if !grouped.is_empty() {
            let ids: Vec<Uuid> = grouped.keys().copied().collect();
            let credentials = match self.store.get_many(&ids) {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!(error = %e, "Failed to batch-load credentials, skipping tick");
                    return;
                }
            };

            if credentials.len() < ids.len() {
                debug!(
                    missing = ids.len() - credentials.len(),
                    "Some registrations reference deleted credentials"
                );
            }

            let polls: Vec<_> = credentials
                .into_iter()
                .filter_map(|credential| {
                    grouped
                        .remove(&credential.id)
                        .map(|workflows| self.poll_credential(credential, workflows))
                })
                .collect();

            join_all(polls).await;
        }

        let mut status = self.status.lock().unwrap();
        status.last_tick = Some(Utc::now());
        status.tick_count += 1;
    }

    /// Polls one credential, isolating its failure from the rest of the
    /// tick. Skipped when the credential's previous poll is still running.
    async fn poll_credential(&self, credential: Credential, workflows: Vec<RegisteredWorkflow>) {
        let credential_id = credential.id;

        {
            let mut processing = self.processing.lock().unwrap();
            if !processing.insert(credential_id) {
                debug!(
                    credential_id = %credential_id,
                    "Previous poll still in flight, skipping this tick"
                );
                return;
            }
        }

        let result = self.check_credential_events(credential, &workflows).await;

        // Released on every path, success or failure
        self.processing.lock().unwrap().remove(&credential_id);

        if let Err(e) = result {
            warn!(credential_id = %credential_id, error = %e, "Credential poll failed");
            self.status.lock().unwrap().credential_failures += 1;
        }
    }

    async fn check_credential_events(
        &self,
        credential: Credential,
        workflows: &[RegisteredWorkflow],
    ) -> Result<()> {
        let credential = self
            .oauth
            .ensure_fresh(credential)
            .await
            .context("Token refresh failed")?;
        let mut access_token = credential
            .access_token
            .clone()
            .ok_or_else(|| anyhow!("Credential {} has no access token", credential.id))?;

        let had_cursor = credential.cursor.is_some();

        let first = self
            .source
            .fetch_delta(&access_token, credential.cursor.as_deref())
            .await;

        // Token rejected mid-poll: one forced refresh, one retry
        let fetched = match first {
            Err(SourceError::Unauthorized) => {
                debug!(
                    credential_id = %credential.id,
                    "Access token rejected mid-poll, refreshing and retrying once"
                );
                let refreshed = self
                    .oauth
                    .refresh_credential(credential.id)
                    .await
                    .context("Mid-poll token refresh failed")?;
                access_token = refreshed
                    .access_token
                    .ok_or_else(|| anyhow!("Refresh returned no access token"))?;
                self.source
                    .fetch_delta(&access_token, credential.cursor.as_deref())
                    .await
            }
            other => other,
        };

        let page = match fetched {
            Ok(page) => page,
            Err(SourceError::CursorInvalid) => {
                // One full query with no cursor; firing is suppressed so the
                // returned history is not replayed as new events
                info!(
                    credential_id = %credential.id,
                    "Sync cursor invalidated by provider, performing full resync"
                );
                let recovery = self
                    .source
                    .fetch_delta(&access_token, None)
                    .await
                    .context("Full resync query failed")?;
                self.store
                    .set_cursor(credential.id, recovery.next_cursor.as_deref())
                    .context("Failed to persist resync cursor")?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Bootstrap: with no prior cursor everything returned is pre-existing
        // history, so only the cursor is stored
        if !had_cursor {
            if let Some(next) = page.next_cursor.as_deref() {
                self.store
                    .set_cursor(credential.id, Some(next))
                    .context("Failed to persist bootstrap cursor")?;
            }
            debug!(
                credential_id = %credential.id,
                items = page.items.len(),
                "Bootstrap cycle complete, cursor stored, no triggers fired"
            );
            return Ok(());
        }

        let now = Utc::now();
        for item in &page.items {
            let Some(kind) = classify(item, now, self.recency_window) else {
                continue;
            };

            for workflow in workflows {
                if workflow.kind != kind {
                    continue;
                }
                // The workflow may have deactivated since the tick snapshot
                if !self.registry.contains(kind, workflow.workflow_id) {
                    continue;
                }

                let payload = trigger_payload(&credential, item, kind, &workflow.config);
                match self
                    .dispatcher
                    .trigger_workflow_execution(workflow.workflow_id, payload)
                    .await
                {
                    Ok(()) => {
                        self.status.lock().unwrap().dispatched += 1;
                        debug!(
                            workflow_id = %workflow.workflow_id,
                            event_id = %item.id,
                            trigger = kind.as_str(),
                            "Dispatched trigger execution"
                        );
                    }
                    // Dispatch is fire-and-forget: logged, never retried here
                    Err(e) => warn!(
                        workflow_id = %workflow.workflow_id,
                        event_id = %item.id,
                        error = %e,
                        "Trigger dispatch failed"
                    ),
                }
            }
        }

        // Progress survives even a zero-event cycle
        if let Some(next) = page.next_cursor.as_deref() {
            self.store
                .set_cursor(credential.id, Some(next))
                .context("Failed to persist cursor")?;
        }

        Ok(())
    }
}
