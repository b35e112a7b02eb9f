//! Reconciliation coordinator
//!
//! Drives each admitted action through
//! `Idle → Submitting → AwaitingConfirmation → SyncingOffchain → Committed`.
//! The off-chain mutation only happens after the chain write has a confirmed
//! receipt with a transaction hash, and that hash travels with it as proof.
//! Off-chain failures are never compensated on-chain; the action fails with
//! the hash retained so an operator can reconcile.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use super::action::{
    ActionKind, ActionRequest, ActionState, CommitOutcome, OfferDraft, ReconciliationAction,
    Role, Subject,
};
use super::offchain::{ChainProof, OffchainResponse, OffchainSync};
use super::registry::{ActionRegistry, Admission};
use super::writer::{ChainWriter, ContractCall, WriteStatus};
use crate::chain::abi;
use crate::chain::{Address, ChainClient};
use crate::types::{RelayError, Result};

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Offer factory, also the AccessControl contract holding the roles
    pub contract: Address,
    /// Account the coordinator acts as
    pub caller: Address,
    /// Bound on one off-chain request
    pub offchain_timeout: Duration,
    /// Bound on the wait for a terminal receipt
    pub confirmation_timeout: Duration,
    /// First retry delay, doubled per further attempt
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl CoordinatorConfig {
    pub fn new(contract: Address, caller: Address) -> Self {
        Self {
            contract,
            caller,
            offchain_timeout: Duration::from_secs(10),
            confirmation_timeout: Duration::from_secs(600),
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
        }
    }

    /// Delay before attempt number `attempts` (none for the first)
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        if attempts <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempts - 2).min(16);
        self.retry_base
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max)
    }
}

/// Offer committed off-chain
#[derive(Debug, Clone, PartialEq)]
pub struct OfferRecord {
    pub offer_id: Option<String>,
    pub contract_address: Address,
    pub tx_hash: String,
    pub draft: OfferDraft,
}

/// Runs privileged actions from intent to off-chain commit
pub struct ReconciliationCoordinator {
    chain: Arc<dyn ChainClient>,
    writer: Arc<dyn ChainWriter>,
    offchain: Arc<dyn OffchainSync>,
    registry: Arc<ActionRegistry>,
    config: CoordinatorConfig,
    /// Role sets of subjects touched by committed actions, by user id
    subjects: DashMap<u64, Vec<Role>>,
    offers: DashMap<Address, OfferRecord>,
}

impl ReconciliationCoordinator {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        writer: Arc<dyn ChainWriter>,
        offchain: Arc<dyn OffchainSync>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            chain,
            writer,
            offchain,
            registry: Arc::new(ActionRegistry::new()),
            config,
            subjects: DashMap::new(),
            offers: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Role set of a user after committed actions, if any touched them
    pub fn roles_of(&self, user_id: u64) -> Option<Vec<Role>> {
        self.subjects.get(&user_id).map(|roles| roles.clone())
    }

    pub fn offer(&self, contract_address: &Address) -> Option<OfferRecord> {
        self.offers.get(contract_address).map(|o| o.clone())
    }

    /// Admit a request and start its attempt in the background.
    ///
    /// Returns immediately. In-flight and committed keys are no-ops that
    /// report the current action.
    pub fn submit(self: &Arc<Self>, request: ActionRequest) -> Result<Admission> {
        let admission = self.registry.admit(request)?;

        match &admission {
            Admission::Fresh(action) | Admission::Retry(action) => {
                let this = Arc::clone(self);
                let key = action.idempotency_key.clone();
                let attempts = action.attempts;
                tokio::spawn(async move {
                    this.drive(key, attempts).await;
                });
            }
            Admission::InFlight(action) => {
                info!(
                    key = %action.idempotency_key,
                    state = action.state.name(),
                    "Action already in flight"
                );
            }
            Admission::Committed(action) => {
                info!(key = %action.idempotency_key, "Action already committed");
            }
        }

        Ok(admission)
    }

    /// Wait until `key` reaches `Committed` or `Failed`
    pub async fn wait_for_terminal(&self, key: &str) -> Result<ReconciliationAction> {
        let mut updates = self.registry.subscribe();
        loop {
            match self.registry.get(key) {
                Some(action) if action.is_terminal() => return Ok(action),
                Some(_) => {}
                None => {
                    return Err(RelayError::InvalidInput(format!("unknown action {key}")));
                }
            }

            match updates.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    return Err(RelayError::InvalidInput(format!(
                        "registry closed while waiting for {key}"
                    )))
                }
            }
        }
    }

    // =========================================================================
    // Attempt
    // =========================================================================

    async fn drive(&self, key: String, attempts: u32) {
        let delay = self.config.retry_delay(attempts);
        if !delay.is_zero() {
            info!(
                %key,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying action after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        let Some(action) = self.registry.get(&key) else {
            return;
        };

        match self.attempt(&key, &action.kind).await {
            Ok(()) => info!(%key, kind = action.kind.label(), "Action committed"),
            Err(reason) => {
                if reason.requires_operator() {
                    error!(%key, error = %reason, "Action failed, operator attention needed");
                } else {
                    warn!(%key, error = %reason, "Action failed");
                }
                let failed = self
                    .registry
                    .update(&key, |a| a.transition(ActionState::Failed(reason.clone())));
                if let Err(e) = failed {
                    error!(%key, error = %e, "Could not record failure");
                }
            }
        }
    }

    async fn attempt(&self, key: &str, kind: &ActionKind) -> Result<()> {
        self.check_preconditions(kind).await?;
        let call = self.contract_call(kind)?;

        self.registry
            .update(key, |a| a.transition(ActionState::Submitting))?;
        let write = self
            .writer
            .submit(&call)
            .await
            .map_err(|e| match e {
                RelayError::ChainWriteRejected(_) => e,
                other => RelayError::ChainWriteRejected(other.to_string()),
            })?;

        self.registry.update(key, |a| {
            a.tx_hash = write.tx_hash.clone();
            a.transition(ActionState::AwaitingConfirmation)
        })?;

        let status = tokio::time::timeout(
            self.config.confirmation_timeout,
            self.writer.wait_for_receipt(&write),
        )
        .await
        .map_err(|_| {
            RelayError::TransientProvider("timed out waiting for confirmation".to_string())
        })??;

        let (tx_hash, logs) = match status {
            WriteStatus::Success { tx_hash, logs, .. } => {
                let hash = tx_hash
                    .or_else(|| write.tx_hash.clone())
                    .filter(|h| !h.trim().is_empty())
                    .ok_or_else(|| {
                        RelayError::MissingProof(
                            "write reported success without a transaction hash".to_string(),
                        )
                    })?;
                (hash, logs)
            }
            WriteStatus::Fail { reason } | WriteStatus::Exception { reason } => {
                return Err(RelayError::ChainWriteRejected(reason));
            }
        };

        let offer_address = match kind {
            ActionKind::CreateOffer { .. } => {
                let created = abi::find_offer_created(&logs, Some(&self.config.contract))
                    .ok_or_else(|| {
                        RelayError::MissingProof(format!(
                            "receipt for {tx_hash} has no OfferCreated event"
                        ))
                    })?;
                Some(created.offer)
            }
            _ => None,
        };

        self.registry.update(key, |a| {
            a.tx_hash = Some(tx_hash.clone());
            a.transition(ActionState::SyncingOffchain)
        })?;

        let proof = ChainProof {
            tx_hash,
            offer_address,
        };
        let response = tokio::time::timeout(
            self.config.offchain_timeout,
            self.offchain.apply(kind, &proof),
        )
        .await
        .map_err(|_| RelayError::OffchainSyncFailed {
            status: None,
            message: "request timed out".to_string(),
            fields: Vec::new(),
            retryable: true,
        })?
        .map_err(as_offchain_failure)?;

        let outcome = self.record_outcome(kind, &proof, &response);
        self.registry.update(key, |a| {
            a.outcome = Some(outcome);
            a.transition(ActionState::Committed)
        })?;
        Ok(())
    }

    async fn check_preconditions(&self, kind: &ActionKind) -> Result<()> {
        let required = kind.required_role();
        let holds = self
            .chain
            .has_role(&self.config.contract, &required, &self.config.caller)
            .await?;
        if !holds {
            let name = match kind {
                ActionKind::CreateOffer { .. } => "tender",
                _ => "admin",
            };
            return Err(RelayError::PreconditionFailed(format!(
                "caller {} lacks the {name} role",
                self.config.caller
            )));
        }

        match kind {
            ActionKind::GrantRole { subject, .. } => {
                linked_wallet(subject)?;
            }
            ActionKind::RevokeRole { role, subject } => {
                let wallet = linked_wallet(subject)?;
                let roles = self.current_roles(subject);
                if roles.len() == 1 && roles[0].id == role.id {
                    return Err(RelayError::PreconditionFailed(format!(
                        "cannot remove the only role of user {}",
                        subject.user_id
                    )));
                }
                if role.is_admin() && wallet == self.config.caller {
                    return Err(RelayError::PreconditionFailed(
                        "cannot revoke your own admin role".to_string(),
                    ));
                }
            }
            ActionKind::CreateOffer { .. } => {}
        }
        Ok(())
    }

    fn contract_call(&self, kind: &ActionKind) -> Result<ContractCall> {
        let (data, description) = match kind {
            ActionKind::GrantRole { role, subject } => (
                abi::encode_grant_role(&role.role_id(), &linked_wallet(subject)?),
                format!("grantRole({}, user {})", role.name, subject.user_id),
            ),
            ActionKind::RevokeRole { role, subject } => (
                abi::encode_revoke_role(&role.role_id(), &linked_wallet(subject)?),
                format!("revokeRole({}, user {})", role.name, subject.user_id),
            ),
            ActionKind::CreateOffer { offer } => (
                abi::encode_create_offer(),
                format!("createOffer({})", offer.title),
            ),
        };
        Ok(ContractCall {
            to: self.config.contract,
            data,
            description,
        })
    }

    fn current_roles(&self, subject: &Subject) -> Vec<Role> {
        self.roles_of(subject.user_id)
            .unwrap_or_else(|| subject.roles.clone())
    }

    /// Apply `change` to the subject's role view under the shard lock
    fn update_roles(&self, subject: &Subject, change: impl FnOnce(&mut Vec<Role>)) -> Vec<Role> {
        let mut roles = self
            .subjects
            .entry(subject.user_id)
            .or_insert_with(|| subject.roles.clone());
        change(roles.value_mut());
        roles.value().clone()
    }

    fn record_outcome(
        &self,
        kind: &ActionKind,
        proof: &ChainProof,
        response: &OffchainResponse,
    ) -> CommitOutcome {
        match kind {
            ActionKind::GrantRole { role, subject } => {
                let roles = self.update_roles(subject, |roles| {
                    if !roles.iter().any(|r| r.id == role.id) {
                        roles.push(role.clone());
                    }
                });
                CommitOutcome::Roles {
                    user_id: subject.user_id,
                    roles,
                }
            }
            ActionKind::RevokeRole { role, subject } => {
                let roles = self.update_roles(subject, |roles| roles.retain(|r| r.id != role.id));
                CommitOutcome::Roles {
                    user_id: subject.user_id,
                    roles,
                }
            }
            ActionKind::CreateOffer { offer } => {
                // Checked before syncing
                let contract_address = proof.offer_address.unwrap_or(Address::ZERO);
                let offer_id = response.offer_id();
                self.offers.insert(
                    contract_address,
                    OfferRecord {
                        offer_id: offer_id.clone(),
                        contract_address,
                        tx_hash: proof.tx_hash.clone(),
                        draft: offer.clone(),
                    },
                );
                CommitOutcome::Offer {
                    offer_id,
                    contract_address,
                }
            }
        }
    }
}

fn linked_wallet(subject: &Subject) -> Result<Address> {
    subject.wallet_address.ok_or_else(|| {
        RelayError::PreconditionFailed(format!(
            "user {} has no linked wallet address",
            subject.user_id
        ))
    })
}

fn as_offchain_failure(e: RelayError) -> RelayError {
    match e {
        RelayError::OffchainSyncFailed { .. } | RelayError::MissingProof(_) => e,
        other => RelayError::OffchainSyncFailed {
            status: None,
            message: other.to_string(),
            fields: Vec::new(),
            retryable: false,
        },
    }
}
