//! In-memory trigger registrations, one map per trigger kind.
//!
//! Registrations are created on workflow activation and removed on
//! deactivation; their lifetime is independent of the backing credential.
//! Nothing here is persisted — the controller layer rebuilds registrations
//! from durable workflow state at process start.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The event classes a workflow can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    EventCreated,
    EventCancelled,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 2] = [TriggerKind::EventCreated, TriggerKind::EventCancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::EventCreated => "event_created",
            TriggerKind::EventCancelled => "event_cancelled",
        }
    }
}

/// One workflow's subscription to an event source.
#[derive(Clone, Debug)]
pub struct Registration {
    /// Credential whose account is watched. Registrations without a
    /// credential are inert until one is attached.
    pub credential_id: Option<Uuid>,
    /// Opaque per-workflow trigger configuration, forwarded in the payload.
    pub config: serde_json::Value,
}

/// Explicitly constructed registration store. Injected wherever it is
/// needed so tests get isolated instances; never global state.
pub struct TriggerRegistry {
    kinds: HashMap<TriggerKind, DashMap<Uuid, Registration>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        let mut kinds = HashMap::new();
        for kind in TriggerKind::ALL {
            kinds.insert(kind, DashMap::new());
        }
        Self { kinds }
    }

    fn map(&self, kind: TriggerKind) -> &DashMap<Uuid, Registration> {
        // All kinds are inserted in new(); the lookup cannot miss.
        &self.kinds[&kind]
    }

    /// Inserts or overwrites a workflow's registration for a trigger kind.
    pub fn register(&self, kind: TriggerKind, workflow_id: Uuid, registration: Registration) {
        self.map(kind).insert(workflow_id, registration);
    }

    /// Removes a workflow's registration for one trigger kind.
    pub fn unregister(&self, kind: TriggerKind, workflow_id: Uuid) -> bool {
        self.map(kind).remove(&workflow_id).is_some()
    }

    /// Removes a workflow from every kind (workflow deleted or deactivated).
    pub fn unregister_workflow(&self, workflow_id: Uuid) {
        for kind in TriggerKind::ALL {
            self.map(kind).remove(&workflow_id);
        }
    }

    /// Read snapshot of one kind's registrations, consumed once per tick.
    pub fn snapshot(&self, kind: TriggerKind) -> Vec<(Uuid, Registration)> {
        self.map(kind)
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Whether a workflow is currently registered for a kind. Backs the
    /// classification routing: an item only reaches workflows registered in
    /// the matching kind's map.
    pub fn contains(&self, kind: TriggerKind, workflow_id: Uuid) -> bool {
        self.map(kind).contains_key(&workflow_id)
    }

    pub fn len(&self, kind: TriggerKind) -> usize {
        self.map(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        TriggerKind::ALL.iter().all(|kind| self.map(*kind).is_empty())
    }
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(credential_id: Uuid) -> Registration {
        Registration {
            credential_id: Some(credential_id),
            config: serde_json::json!({"calendar": "primary"}),
        }
    }

    #[test]
    fn test_register_and_snapshot() {
        let registry = TriggerRegistry::new();
        let workflow = Uuid::new_v4();
        let credential = Uuid::new_v4();

        registry.register(TriggerKind::EventCreated, workflow, registration(credential));

        let snapshot = registry.snapshot(TriggerKind::EventCreated);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, workflow);
        assert_eq!(snapshot[0].1.credential_id, Some(credential));

        // Registration is scoped to its kind
        assert!(registry.snapshot(TriggerKind::EventCancelled).is_empty());
        assert!(registry.contains(TriggerKind::EventCreated, workflow));
        assert!(!registry.contains(TriggerKind::EventCancelled, workflow));
    }

    #[test]
    fn test_register_overwrites() {
        let registry = TriggerRegistry::new();
        let workflow = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        registry.register(TriggerKind::EventCreated, workflow, registration(first));
        registry.register(TriggerKind::EventCreated, workflow, registration(second));

        let snapshot = registry.snapshot(TriggerKind::EventCreated);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1.credential_id, Some(second));
    }

    #[test]
    fn test_unregister() {
        let registry = TriggerRegistry::new();
        let workflow = Uuid::new_v4();

        registry.register(TriggerKind::EventCreated, workflow, registration(Uuid::new_v4()));
        assert!(registry.unregister(TriggerKind::EventCreated, workflow));
        assert!(!registry.unregister(TriggerKind::EventCreated, workflow));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_workflow_clears_all_kinds() {
        let registry = TriggerRegistry::new();
        let workflow = Uuid::new_v4();
        let credential = Uuid::new_v4();

        registry.register(TriggerKind::EventCreated, workflow, registration(credential));
        registry.register(TriggerKind::EventCancelled, workflow, registration(credential));

        registry.unregister_workflow(workflow);
        assert!(registry.is_empty());
    }
}
