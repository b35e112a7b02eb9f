//! Actions keyed by idempotency key
//!
//! Admission is atomic per key through the `DashMap` entry API. Guards are
//! dropped before anything is published and never live across an await.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::action::{ActionRequest, ActionState, ReconciliationAction};
use crate::types::{RelayError, Result};

/// Result of offering a request to the registry
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// New key, the caller must drive the attempt
    Fresh(ReconciliationAction),
    /// Previously failed key, reset for another attempt the caller must drive
    Retry(ReconciliationAction),
    /// An attempt is already running
    InFlight(ReconciliationAction),
    /// Already committed, nothing to do
    Committed(ReconciliationAction),
}

impl Admission {
    pub fn action(&self) -> &ReconciliationAction {
        match self {
            Admission::Fresh(a)
            | Admission::Retry(a)
            | Admission::InFlight(a)
            | Admission::Committed(a) => a,
        }
    }

    /// Whether the caller now owns an attempt
    pub fn should_drive(&self) -> bool {
        matches!(self, Admission::Fresh(_) | Admission::Retry(_))
    }
}

/// In-memory action registry
pub struct ActionRegistry {
    actions: DashMap<String, ReconciliationAction>,
    updates: broadcast::Sender<ReconciliationAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(100);
        Self {
            actions: DashMap::new(),
            updates,
        }
    }

    /// Admit a request or report the key's current standing
    pub fn admit(&self, request: ActionRequest) -> Result<Admission> {
        if request.idempotency_key.trim().is_empty() {
            return Err(RelayError::InvalidInput(
                "idempotency key must not be empty".to_string(),
            ));
        }

        let admission = match self.actions.entry(request.idempotency_key.clone()) {
            Entry::Vacant(slot) => {
                let action = ReconciliationAction::new(request);
                slot.insert(action.clone());
                Admission::Fresh(action)
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                match current.state {
                    ActionState::Committed => Admission::Committed(current.clone()),
                    ActionState::Failed(_) => {
                        current.restart(request.kind);
                        Admission::Retry(current.clone())
                    }
                    _ => Admission::InFlight(current.clone()),
                }
            }
        };

        if admission.should_drive() {
            debug!(
                key = %admission.action().idempotency_key,
                attempts = admission.action().attempts,
                "Action admitted"
            );
            self.publish(admission.action().clone());
        }
        Ok(admission)
    }

    /// Mutate an action in place and publish the result
    pub fn update<F>(&self, key: &str, f: F) -> Result<ReconciliationAction>
    where
        F: FnOnce(&mut ReconciliationAction) -> Result<()>,
    {
        let updated = {
            let mut entry = self
                .actions
                .get_mut(key)
                .ok_or_else(|| RelayError::InvalidInput(format!("unknown action {key}")))?;
            f(entry.value_mut())?;
            entry.value().clone()
        };
        self.publish(updated.clone());
        Ok(updated)
    }

    pub fn get(&self, key: &str) -> Option<ReconciliationAction> {
        self.actions.get(key).map(|entry| entry.value().clone())
    }

    /// All actions, oldest first
    pub fn list(&self) -> Vec<ReconciliationAction> {
        let mut all: Vec<_> = self
            .actions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Archive a terminal action. Live actions cannot be acknowledged.
    pub fn acknowledge(&self, key: &str) -> Result<Option<ReconciliationAction>> {
        if let Some((_, action)) = self.actions.remove_if(key, |_, a| a.is_terminal()) {
            return Ok(Some(action));
        }
        match self.get(key) {
            Some(action) => Err(RelayError::InvalidInput(format!(
                "action {key} is still {}",
                action.state.name()
            ))),
            None => Ok(None),
        }
    }

    /// Receive every admitted or updated action
    pub fn subscribe(&self) -> broadcast::Receiver<ReconciliationAction> {
        self.updates.subscribe()
    }

    fn publish(&self, action: ReconciliationAction) {
        let _ = self.updates.send(action);
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Address;
    use crate::reconcile::action::{ActionKind, Role, Subject};

    fn request(key: &str) -> ActionRequest {
        ActionRequest::new(
            key,
            ActionKind::RevokeRole {
                role: Role::new(3, "tender"),
                subject: Subject {
                    user_id: 1,
                    wallet_address: Some(Address::ZERO),
                    roles: vec![Role::new(3, "tender"), Role::new(4, "expert")],
                },
            },
        )
    }

    #[test]
    fn test_empty_key_rejected() {
        let registry = ActionRegistry::new();
        let err = registry.admit(request("  ")).unwrap_err();
        assert!(matches!(err, RelayError::InvalidInput(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_in_flight_is_noop() {
        let registry = ActionRegistry::new();
        assert!(registry.admit(request("k")).unwrap().should_drive());

        registry
            .update("k", |a| a.transition(ActionState::Submitting))
            .unwrap();
        let second = registry.admit(request("k")).unwrap();
        assert!(matches!(second, Admission::InFlight(_)));
        assert_eq!(second.action().state, ActionState::Submitting);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_key_retries_with_incremented_attempts() {
        let registry = ActionRegistry::new();
        registry.admit(request("k")).unwrap();
        registry
            .update("k", |a| {
                a.tx_hash = Some("0xdead".into());
                a.transition(ActionState::Failed(RelayError::ChainWriteRejected(
                    "denied".into(),
                )))
            })
            .unwrap();

        let retry = registry.admit(request("k")).unwrap();
        assert!(matches!(retry, Admission::Retry(_)));
        assert_eq!(retry.action().attempts, 2);
        assert!(retry.action().tx_hash.is_none());
    }

    #[test]
    fn test_acknowledge_only_terminal() {
        let registry = ActionRegistry::new();
        registry.admit(request("k")).unwrap();
        assert!(registry.acknowledge("k").is_err());

        registry
            .update("k", |a| {
                a.transition(ActionState::Failed(RelayError::PreconditionFailed(
                    "no role".into(),
                )))
            })
            .unwrap();
        assert!(registry.acknowledge("k").unwrap().is_some());
        assert!(registry.get("k").is_none());
        assert!(registry.acknowledge("k").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_updates_are_published() {
        let registry = ActionRegistry::new();
        let mut rx = registry.subscribe();
        registry.admit(request("k")).unwrap();
        let action = rx.recv().await.unwrap();
        assert_eq!(action.idempotency_key, "k");
        assert_eq!(action.state, ActionState::Idle);
    }
}
