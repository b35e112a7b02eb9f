//! Reconciliation action model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::abi::RoleId;
use crate::chain::Address;
use crate::types::RelayError;

/// Application role
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role {
    /// Off-chain role id (used in the REST paths)
    pub id: u64,
    pub name: String,
}

impl Role {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Contract identifier for this role
    pub fn role_id(&self) -> RoleId {
        RoleId::from_name(&self.name)
    }

    pub fn is_admin(&self) -> bool {
        self.role_id().is_admin()
    }
}

/// User a role action applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: u64,
    #[serde(default)]
    pub wallet_address: Option<Address>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl Subject {
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.iter().any(|r| r.id == role.id)
    }
}

/// Offer fields supplied by the tender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDraft {
    pub title: String,
    pub description: String,
    pub budget: f64,
    pub currency: String,
    pub proposal_submission_start: DateTime<Utc>,
    pub proposal_submission_end: DateTime<Utc>,
    pub proposal_review_start: DateTime<Utc>,
    pub proposal_review_end: DateTime<Utc>,
}

/// What an action does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    GrantRole { role: Role, subject: Subject },
    RevokeRole { role: Role, subject: Subject },
    CreateOffer { offer: OfferDraft },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::GrantRole { .. } => "grant_role",
            ActionKind::RevokeRole { .. } => "revoke_role",
            ActionKind::CreateOffer { .. } => "create_offer",
        }
    }

    /// Role the caller must hold on-chain
    pub fn required_role(&self) -> RoleId {
        match self {
            ActionKind::GrantRole { .. } | ActionKind::RevokeRole { .. } => {
                RoleId::from_name("admin")
            }
            ActionKind::CreateOffer { .. } => RoleId::from_name("tender"),
        }
    }
}

/// Caller request handed to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub idempotency_key: String,
    pub kind: ActionKind,
}

impl ActionRequest {
    pub fn new(idempotency_key: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum ActionState {
    Idle,
    Submitting,
    AwaitingConfirmation,
    SyncingOffchain,
    Committed,
    Failed(RelayError),
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Committed | ActionState::Failed(_))
    }

    /// Forward-only, no skips; any live state may fail
    pub fn can_transition_to(&self, next: &ActionState) -> bool {
        use ActionState::*;
        matches!(
            (self, next),
            (Idle, Submitting)
                | (Submitting, AwaitingConfirmation)
                | (AwaitingConfirmation, SyncingOffchain)
                | (SyncingOffchain, Committed)
                | (Idle | Submitting | AwaitingConfirmation | SyncingOffchain, Failed(_))
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActionState::Idle => "idle",
            ActionState::Submitting => "submitting",
            ActionState::AwaitingConfirmation => "awaiting_confirmation",
            ActionState::SyncingOffchain => "syncing_offchain",
            ActionState::Committed => "committed",
            ActionState::Failed(_) => "failed",
        }
    }
}

/// What a committed action changed off-chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommitOutcome {
    /// Role set of the subject after the change
    Roles { user_id: u64, roles: Vec<Role> },
    Offer {
        offer_id: Option<String>,
        contract_address: Address,
    },
}

/// One privileged action and its progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationAction {
    pub idempotency_key: String,
    pub kind: ActionKind,
    pub state: ActionState,
    pub tx_hash: Option<String>,
    /// Hashes written by earlier failed attempts, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_tx_hashes: Vec<String>,
    pub last_error: Option<RelayError>,
    pub attempts: u32,
    pub outcome: Option<CommitOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationAction {
    pub fn new(request: ActionRequest) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key: request.idempotency_key,
            kind: request.kind,
            state: ActionState::Idle,
            tx_hash: None,
            prior_tx_hashes: Vec::new(),
            last_error: None,
            attempts: 1,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting skips and moves out of terminal states
    pub fn transition(&mut self, next: ActionState) -> Result<(), RelayError> {
        if !self.state.can_transition_to(&next) {
            return Err(RelayError::InvalidInput(format!(
                "illegal transition {} -> {} for {}",
                self.state.name(),
                next.name(),
                self.idempotency_key
            )));
        }
        if let ActionState::Failed(error) = &next {
            self.last_error = Some(error.clone());
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Reset a failed action for another attempt
    pub(crate) fn restart(&mut self, kind: ActionKind) {
        self.kind = kind;
        self.state = ActionState::Idle;
        if let Some(hash) = self.tx_hash.take() {
            self.prior_tx_hashes.push(hash);
        }
        self.last_error = None;
        self.outcome = None;
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
