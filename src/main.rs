//! trust-relay - chain feed watcher and on-chain/off-chain reconciliation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trust_relay::chain::abi::RoleId;
use trust_relay::chain::{Address, ChainClient, JsonRpcClient};
use trust_relay::feed::FeedStore;
use trust_relay::reconcile::{
    ActionKind, ActionRequest, ActionState, HttpOffchainSync, OfferDraft,
    ReconciliationCoordinator, Role, RpcChainWriter, Subject,
};
use trust_relay::watcher::ChainEventWatcher;
use trust_relay::{Config, RelayError};

#[derive(Parser)]
#[command(name = "trust-relay")]
#[command(about = "Chain transaction feed and on-chain/off-chain reconciliation")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "TRUST_RELAY_CONFIG", default_value = "trust-relay.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// JSON-RPC HTTP endpoint (overrides config file)
    #[arg(long, env = "RPC_URL")]
    rpc_url: Option<String>,

    /// JSON-RPC WebSocket endpoint (overrides config file)
    #[arg(long, env = "WS_URL")]
    ws_url: Option<String>,

    /// Application server base URL (overrides config file)
    #[arg(long, env = "API_URL")]
    api_url: Option<String>,

    /// Application server bearer token
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Offer factory contract (overrides config file)
    #[arg(long, env = "CONTRACT_ADDRESS")]
    contract: Option<Address>,

    /// Signing account unlocked on the node (overrides config file)
    #[arg(long, env = "CALLER_ADDRESS")]
    caller: Option<Address>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow the chain and print the transaction feed
    Watch {
        /// Run one refresh, print the feed and exit
        #[arg(long)]
        once: bool,
    },
    /// Grant a role on-chain, then record it off-chain
    GrantRole(RoleArgs),
    /// Revoke a role on-chain, then remove it off-chain
    RevokeRole(RoleArgs),
    /// Deploy an offer contract, then record the offer off-chain
    CreateOffer(OfferArgs),
    /// Check whether an account holds a role
    HasRole {
        /// Role name (admin, tender, entrepreneur, expert, ...)
        #[arg(long)]
        role: String,
        #[arg(long)]
        account: Address,
    },
}

#[derive(Args)]
struct RoleArgs {
    /// Idempotency key for this action (generated when omitted)
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    user_id: u64,
    /// Wallet linked to the user
    #[arg(long)]
    wallet: Option<Address>,
    /// Role as `<id>:<name>`
    #[arg(long, value_parser = parse_role)]
    role: Role,
    /// Roles the user currently holds, as `<id>:<name>`
    #[arg(long = "current-role", value_parser = parse_role)]
    current_roles: Vec<Role>,
}

impl RoleArgs {
    fn into_parts(self) -> (String, Role, Subject) {
        let subject = Subject {
            user_id: self.user_id,
            wallet_address: self.wallet,
            roles: self.current_roles,
        };
        (idempotency_key(self.key), self.role, subject)
    }
}

#[derive(Args)]
struct OfferArgs {
    /// Idempotency key for this action (generated when omitted)
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: String,
    #[arg(long)]
    budget: f64,
    #[arg(long, default_value = "EUR")]
    currency: String,
    /// RFC 3339 timestamps
    #[arg(long)]
    submission_start: DateTime<Utc>,
    #[arg(long)]
    submission_end: DateTime<Utc>,
    #[arg(long)]
    review_start: DateTime<Utc>,
    #[arg(long)]
    review_end: DateTime<Utc>,
}

fn idempotency_key(key: Option<String>) -> String {
    key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn parse_role(s: &str) -> Result<Role, String> {
    let (id, name) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <id>:<name>, got {s}"))?;
    let id = id
        .trim()
        .parse()
        .map_err(|e| format!("invalid role id {id}: {e}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("role name must not be empty".to_string());
    }
    Ok(Role::new(id, name))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("trust_relay={},info", cli.log_level).into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = Config::load(&cli.config)?;

    // CLI overrides
    if let Some(url) = cli.rpc_url.clone() {
        config.chain.http_url = url;
    }
    if let Some(url) = cli.ws_url.clone() {
        config.chain.ws_url = Some(url);
    }
    if let Some(url) = cli.api_url.clone() {
        config.reconcile.api_url = url;
    }
    if let Some(token) = cli.api_token.clone() {
        config.reconcile.api_token = Some(token);
    }
    if let Some(contract) = cli.contract {
        config.reconcile.contract_address = Some(contract);
    }
    if let Some(caller) = cli.caller {
        config.reconcile.caller_address = Some(caller);
    }

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let timeout = Duration::from_millis(config.chain.request_timeout_ms);
    let mut client = JsonRpcClient::with_timeout(config.chain.http_url.clone(), timeout);
    if let Some(ws) = &config.chain.ws_url {
        client = client.with_ws_url(ws.clone());
    }
    let client = Arc::new(client);

    info!("RPC: {}", config.chain.http_url);
    info!(
        "Subscriptions: {}",
        config.chain.ws_url.as_deref().unwrap_or("none (polling)")
    );

    match cli.command {
        Command::Watch { once } => watch(&config, client, once).await,
        Command::HasRole { role, account } => {
            let contract = config
                .reconcile
                .contract_address
                .context("a contract address is required (--contract or CONTRACT_ADDRESS)")?;
            let holds = client
                .has_role(&contract, &RoleId::from_name(&role), &account)
                .await?;
            println!("{holds}");
            Ok(())
        }
        Command::GrantRole(args) => {
            let (key, role, subject) = args.into_parts();
            let request = ActionRequest::new(key, ActionKind::GrantRole { role, subject });
            reconcile(&config, client, request).await
        }
        Command::RevokeRole(args) => {
            let (key, role, subject) = args.into_parts();
            let request = ActionRequest::new(key, ActionKind::RevokeRole { role, subject });
            reconcile(&config, client, request).await
        }
        Command::CreateOffer(args) => {
            let offer = OfferDraft {
                title: args.title,
                description: args.description,
                budget: args.budget,
                currency: args.currency,
                proposal_submission_start: args.submission_start,
                proposal_submission_end: args.submission_end,
                proposal_review_start: args.review_start,
                proposal_review_end: args.review_end,
            };
            let key = idempotency_key(args.key);
            let request = ActionRequest::new(key, ActionKind::CreateOffer { offer });
            reconcile(&config, client, request).await
        }
    }
}

async fn watch(config: &Config, client: Arc<JsonRpcClient>, once: bool) -> anyhow::Result<()> {
    let store = Arc::new(FeedStore::new(config.feed.capacity));
    let watcher = Arc::new(ChainEventWatcher::new(
        client,
        Arc::clone(&store),
        config.feed.watcher_config(),
    ));

    if once {
        let report = watcher.refresh().await?;
        info!(
            head = report.head,
            pending = report.pending,
            confirmed = report.confirmed,
            "Refreshed"
        );
        for record in store.snapshot().iter() {
            println!("{}", serde_json::to_string(&record.view())?);
        }
        return Ok(());
    }

    let mut updates = store.subscribe();
    let mut liveness = watcher.liveness();
    let handle = Arc::clone(&watcher).start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            changed = liveness.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = liveness.borrow_and_update().clone();
                info!(?state, "Liveness");
            }
            snapshot = updates.recv() => match snapshot {
                Ok(snapshot) => {
                    let views: Vec<_> = snapshot.iter().map(|r| r.view()).collect();
                    println!("{}", serde_json::to_string(&views)?);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Feed output lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

async fn reconcile(
    config: &Config,
    client: Arc<JsonRpcClient>,
    request: ActionRequest,
) -> anyhow::Result<()> {
    let coordinator_config = config.reconcile.coordinator_config()?;

    let writer = RpcChainWriter::new(Arc::clone(&client), coordinator_config.caller)
        .with_confirmations(config.reconcile.confirmations)
        .with_poll_interval(Duration::from_millis(config.reconcile.receipt_poll_interval_ms));

    let mut offchain = HttpOffchainSync::new(
        config.reconcile.api_url.clone(),
        Duration::from_millis(config.reconcile.offchain_timeout_ms),
    );
    if let Some(token) = &config.reconcile.api_token {
        offchain = offchain.with_token(token.clone());
    }

    let coordinator = Arc::new(ReconciliationCoordinator::new(
        client,
        Arc::new(writer),
        Arc::new(offchain),
        coordinator_config,
    ));

    let key = request.idempotency_key.clone();
    info!(%key, kind = request.kind.label(), "Submitting action");
    coordinator.submit(request)?;
    let action = coordinator.wait_for_terminal(&key).await?;

    println!("{}", serde_json::to_string_pretty(&action)?);
    if let ActionState::Failed(reason) = &action.state {
        if let (RelayError::OffchainSyncFailed { .. }, Some(hash)) = (reason, &action.tx_hash) {
            warn!(%hash, "Transaction is on-chain but the off-chain record was not updated");
        }
        anyhow::bail!("action {key} failed: {reason}");
    }
    Ok(())
}
