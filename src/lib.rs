//! trust-relay: keeps a chain and an application database in step
//!
//! Two pipelines share one chain client and one error taxonomy:
//!
//! - **Feed**: [`watcher::ChainEventWatcher`] assembles a bounded, deduplicated
//!   view of recent transactions in a [`feed::FeedStore`] from push
//!   subscriptions, block polling and periodic refreshes.
//! - **Reconciliation**: [`reconcile::ReconciliationCoordinator`] authorizes
//!   privileged actions (role grants and revocations, offer creation) on-chain
//!   and only then applies them off-chain, carrying the transaction hash as
//!   proof.

pub mod chain;
pub mod config;
pub mod feed;
pub mod reconcile;
pub mod types;
pub mod watcher;

pub use config::Config;
pub use types::{ErrorKind, RelayError, Result};
