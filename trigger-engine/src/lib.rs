//! Trigger detection for the workflow-automation backend.
//!
//! A single recurring timer drives one polling pass per tick. Each pass
//! groups live trigger registrations by the credential that backs them,
//! queries the provider's delta API with the stored sync cursor, classifies
//! returned items, and hands matching (item, workflow) pairs to the external
//! execution runtime.
//!
//! # Architecture
//!
//! ```text
//! TriggerRegistry (in-memory, per trigger kind)
//!          ↓ snapshot once per tick
//! ┌─────────────────────────────────────────┐
//! │       PollingEngine                      │
//! │  - group registrations by credential     │
//! │  - refresh tokens on the hot path        │
//! │  - delta query via sync cursor           │
//! │  - classify + route per trigger kind     │
//! └─────────────────────────────────────────┘
//!          ↓ one call per (item, workflow)
//!   WorkflowDispatcher (external runtime)
//! ```
//!
//! Failure isolation: one credential's failure never aborts the tick, and a
//! failed dispatch call is logged and dropped. A credential whose previous
//! poll is still in flight is skipped for the tick, never polled twice
//! concurrently.

pub mod dispatch;
pub mod engine;
pub mod registry;
pub mod source;

pub use dispatch::{HttpDispatcher, WorkflowDispatcher};
pub use engine::{EngineStatus, PollingEngine};
pub use registry::{Registration, TriggerKind, TriggerRegistry};
pub use source::{DeltaPage, EventSource, GoogleCalendarSource, SourceError, SourceItem};
