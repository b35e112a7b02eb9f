//! On-chain/off-chain reconciliation
//!
//! - `action`: the action model and its state machine
//! - `registry`: idempotent admission and lookup by key
//! - `writer`: chain write capability (`eth_sendTransaction` implementation)
//! - `offchain`: off-chain mutation capability (REST implementation)
//! - `coordinator`: drives actions from intent to commit

pub mod action;
pub mod coordinator;
pub mod offchain;
pub mod registry;
pub mod writer;

pub use action::{
    ActionKind, ActionRequest, ActionState, CommitOutcome, OfferDraft, ReconciliationAction,
    Role, Subject,
};
pub use coordinator::{CoordinatorConfig, OfferRecord, ReconciliationCoordinator};
pub use offchain::{ChainProof, HttpOffchainSync, OffchainResponse, OffchainSync};
pub use registry::{ActionRegistry, Admission};
pub use writer::{ChainWriter, ContractCall, RpcChainWriter, SubmittedWrite, WriteStatus};
