//! Relay configuration
//!
//! Read from a TOML file with `[chain]`, `[feed]` and `[reconcile]` sections.
//! Every field has a default, so an absent file or section is fine. The CLI
//! overrides a few fields on top (see `main.rs`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chain::Address;
use crate::reconcile::CoordinatorConfig;
use crate::types::{RelayError, Result};
use crate::watcher::WatcherConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// Provider endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC over HTTP
    #[serde(default = "default_http_url")]
    pub http_url: String,

    /// JSON-RPC over WebSocket, enables push subscriptions
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Timeout for one RPC round trip in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: None,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

fn default_http_url() -> String {
    "http://127.0.0.1:8545".to_string()
}
fn default_request_timeout() -> u64 { 10_000 }

/// Transaction feed tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_recent_blocks")]
    pub recent_blocks: u64,

    /// Fallback full refresh in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Block-number poll when new-block push is unavailable, in milliseconds
    #[serde(default = "default_block_poll_interval")]
    pub block_poll_interval_ms: u64,

    #[serde(default = "default_max_pending")]
    pub max_pending_per_refresh: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            recent_blocks: default_recent_blocks(),
            poll_interval_secs: default_poll_interval(),
            block_poll_interval_ms: default_block_poll_interval(),
            max_pending_per_refresh: default_max_pending(),
        }
    }
}

fn default_capacity() -> usize { 15 }
fn default_recent_blocks() -> u64 { 2 }
fn default_poll_interval() -> u64 { 30 }
fn default_block_poll_interval() -> u64 { 4_000 }
fn default_max_pending() -> usize { 10 }

impl FeedConfig {
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            capacity: self.capacity,
            recent_blocks: self.recent_blocks,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            block_poll_interval: Duration::from_millis(self.block_poll_interval_ms),
            max_pending_per_refresh: self.max_pending_per_refresh,
            ..WatcherConfig::default()
        }
    }
}

/// Reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Offer factory / AccessControl contract
    #[serde(default)]
    pub contract_address: Option<Address>,

    /// Account unlocked on the node that signs writes
    #[serde(default)]
    pub caller_address: Option<Address>,

    /// Application server base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer token for the application server
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_offchain_timeout")]
    pub offchain_timeout_ms: u64,

    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,

    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    #[serde(default = "default_receipt_poll_interval")]
    pub receipt_poll_interval_ms: u64,

    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            contract_address: None,
            caller_address: None,
            api_url: default_api_url(),
            api_token: None,
            offchain_timeout_ms: default_offchain_timeout(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            confirmations: default_confirmations(),
            receipt_poll_interval_ms: default_receipt_poll_interval(),
            retry_base_ms: default_retry_base(),
            retry_max_ms: default_retry_max(),
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_offchain_timeout() -> u64 { 10_000 }
fn default_confirmation_timeout() -> u64 { 600 }
fn default_confirmations() -> u64 { 3 }
fn default_receipt_poll_interval() -> u64 { 2_000 }
fn default_retry_base() -> u64 { 500 }
fn default_retry_max() -> u64 { 30_000 }

impl ReconcileConfig {
    /// Coordinator settings. Both addresses must be configured.
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let contract = self.contract_address.ok_or_else(|| {
            RelayError::Config("reconcile.contract_address is required".to_string())
        })?;
        let caller = self.caller_address.ok_or_else(|| {
            RelayError::Config("reconcile.caller_address is required".to_string())
        })?;

        Ok(CoordinatorConfig {
            offchain_timeout: Duration::from_millis(self.offchain_timeout_ms),
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
            retry_base: Duration::from_millis(self.retry_base_ms),
            retry_max: Duration::from_millis(self.retry_max_ms),
            ..CoordinatorConfig::new(contract, caller)
        })
    }
}

impl Config {
    /// Load from `path` if it exists, otherwise defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !is_url(&self.chain.http_url, &["http://", "https://"]) {
            return Err(format!(
                "chain.http_url must be an http(s) URL: {}",
                self.chain.http_url
            ));
        }
        if let Some(ws) = &self.chain.ws_url {
            if !is_url(ws, &["ws://", "wss://"]) {
                return Err(format!("chain.ws_url must be a ws(s) URL: {ws}"));
            }
        }
        if self.chain.request_timeout_ms == 0 {
            return Err("chain.request_timeout_ms must be greater than 0".to_string());
        }

        if self.feed.capacity == 0 {
            return Err("feed.capacity must be greater than 0".to_string());
        }
        if self.feed.poll_interval_secs == 0 || self.feed.block_poll_interval_ms == 0 {
            return Err("feed poll intervals must be greater than 0".to_string());
        }

        if !is_url(&self.reconcile.api_url, &["http://", "https://"]) {
            return Err(format!(
                "reconcile.api_url must be an http(s) URL: {}",
                self.reconcile.api_url
            ));
        }
        if self.reconcile.offchain_timeout_ms == 0
            || self.reconcile.confirmation_timeout_secs == 0
        {
            return Err("reconcile timeouts must be greater than 0".to_string());
        }
        if self.reconcile.retry_base_ms > self.reconcile.retry_max_ms {
            return Err("reconcile.retry_base_ms must not exceed retry_max_ms".to_string());
        }

        Ok(())
    }
}

fn is_url(value: &str, schemes: &[&str]) -> bool {
    schemes
        .iter()
        .any(|scheme| value.len() > scheme.len() && value.starts_with(scheme))
}
