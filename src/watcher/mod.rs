//! Chain event watcher
//!
//! Keeps a [`FeedStore`] current from three inputs:
//!
//! - push subscriptions for new blocks and pending transaction hashes,
//! - a block-number poll when the provider cannot push new blocks,
//! - a periodic full refresh that backs up both.
//!
//! Everything runs on one task. Subscriptions push [`ChainEvent`]s onto an mpsc
//! queue and timers are arms of the same `select!`, so the store only ever
//! sees one writer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::chain::{
    CapabilityProbe, ChainClient, ChainEvent, PendingSource, RawBlock, SubscriptionId,
    SubscriptionKind,
};
use crate::feed::{normalize, FeedStore, TransactionRecord, DEFAULT_CAPACITY};
use crate::types::{RelayError, Result};

/// Watcher tuning
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Records kept by the store
    pub capacity: usize,
    /// How many of the newest blocks a full refresh reads
    pub recent_blocks: u64,
    /// Fallback full refresh interval
    pub poll_interval: Duration,
    /// `eth_blockNumber` poll interval when new-block push is unavailable
    pub block_poll_interval: Duration,
    /// Cap on pending transactions taken per refresh
    pub max_pending_per_refresh: usize,
    /// Capacity of the subscription event queue
    pub event_buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            recent_blocks: 2,
            poll_interval: Duration::from_secs(30),
            block_poll_interval: Duration::from_secs(4),
            max_pending_per_refresh: 10,
            event_buffer: 256,
        }
    }
}

/// Connection health, published on a watch channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LivenessState {
    Disconnected,
    Subscribing,
    Live,
    Degraded(String),
}

/// What one full refresh found
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub head: u64,
    pub pending: usize,
    pub confirmed: usize,
    pub skipped_blocks: Vec<u64>,
    pub pending_source: Option<PendingSource>,
    /// Pending-block transaction count, read only when every pending source failed
    pub pending_hint: Option<u64>,
    pub feed_len: usize,
}

/// Keeps the feed in sync with the chain
pub struct ChainEventWatcher {
    client: Arc<dyn ChainClient>,
    store: Arc<FeedStore>,
    config: WatcherConfig,
    probe: CapabilityProbe,
    liveness: watch::Sender<LivenessState>,
}

impl ChainEventWatcher {
    pub fn new(client: Arc<dyn ChainClient>, store: Arc<FeedStore>, config: WatcherConfig) -> Self {
        let (liveness, _) = watch::channel(LivenessState::Disconnected);
        Self {
            client,
            store,
            config,
            probe: CapabilityProbe::new(),
            liveness,
        }
    }

    pub fn store(&self) -> &Arc<FeedStore> {
        &self.store
    }

    pub fn probe(&self) -> &CapabilityProbe {
        &self.probe
    }

    pub fn liveness(&self) -> watch::Receiver<LivenessState> {
        self.liveness.subscribe()
    }

    pub fn state(&self) -> LivenessState {
        self.liveness.borrow().clone()
    }

    fn set_state(&self, next: LivenessState) {
        self.liveness.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = ?current, to = ?next, "Watcher liveness changed");
            *current = next;
            true
        });
    }

    // =========================================================================
    // Feed updates
    // =========================================================================

    /// Rebuild the feed from the pending pool and the newest blocks.
    ///
    /// Fails, leaving the store untouched, only when the head block number
    /// cannot be read.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let head = self.client.block_number().await?;

        let fetch = self.probe.fetch_pending(self.client.as_ref()).await;
        let mut report = RefreshReport {
            head,
            pending_source: fetch.source,
            ..Default::default()
        };

        if fetch.source.is_none() {
            match self.client.pending_transaction_count().await {
                Ok(count) => {
                    debug!(count, "No pending source available, pending block count only");
                    report.pending_hint = Some(count);
                }
                Err(e) => debug!(error = %e, "Pending transaction count unavailable"),
            }
        }

        let stamp = self.store.stamp();
        let pending: Vec<TransactionRecord> = fetch
            .transactions
            .iter()
            .map(|tx| normalize(tx, true, None, stamp))
            .collect();
        let live_pending: Option<HashSet<String>> = fetch.source.map(|_| {
            pending
                .iter()
                .filter(|r| !r.is_sentinel())
                .map(|r| r.hash.clone())
                .collect()
        });
        let mut batch: Vec<TransactionRecord> = pending
            .into_iter()
            .take(self.config.max_pending_per_refresh)
            .collect();
        report.pending = batch.len();

        for offset in 0..self.config.recent_blocks {
            if batch.len() >= self.store.capacity() || offset > head {
                break;
            }
            let number = head - offset;

            match self.client.block_with_transactions(number).await {
                Ok(Some(block)) => {
                    let room = self.store.capacity() - batch.len();
                    let records = block_records(&block, number, stamp);
                    report.confirmed += records.len().min(room);
                    batch.extend(records.into_iter().take(room));
                }
                Ok(None) => {
                    debug!(number, "Block not available yet");
                    report.skipped_blocks.push(number);
                }
                Err(e) => {
                    warn!(number, error = %e, "Skipping block in refresh");
                    report.skipped_blocks.push(number);
                }
            }
        }

        report.feed_len = self
            .store
            .apply_refresh(batch, live_pending.as_ref())
            .len();
        debug!(
            head,
            pending = report.pending,
            confirmed = report.confirmed,
            feed_len = report.feed_len,
            "Feed refreshed"
        );
        Ok(report)
    }

    /// Merge a newly mined block. Returns how many of its transactions were read.
    pub async fn handle_new_block(&self, number: u64) -> Result<usize> {
        let Some(block) = self.client.block_with_transactions(number).await? else {
            debug!(number, "New block not served yet, leaving it to the next refresh");
            return Ok(0);
        };

        let records = block_records(&block, number, self.store.stamp());
        let count = records.len();
        let (flipped, _) = self.store.merge_confirmed(records);
        debug!(number, count, flipped, "Merged new block");
        Ok(count)
    }

    /// Add a pending transaction announced by hash. Lookup failures drop the hash.
    pub async fn handle_pending_hash(&self, hash: &str) -> bool {
        let hash = hash.to_lowercase();
        if self.store.get(&hash).is_some() {
            return false;
        }

        match self.client.transaction(&hash).await {
            Ok(Some(tx)) => {
                let record = normalize(&tx, true, None, self.store.stamp());
                self.store.insert_pending(record)
            }
            Ok(None) => false,
            Err(e) => {
                debug!(%hash, error = %e, "Pending lookup failed, dropping");
                false
            }
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Spawn the watcher loop
    pub fn start(self: Arc<Self>) -> WatcherHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        WatcherHandle { shutdown, task }
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(endpoint = self.client.endpoint(), "Starting chain event watcher");
        self.set_state(LivenessState::Subscribing);

        let (events_tx, mut events) = mpsc::channel(self.config.event_buffer.max(1));
        let mut loop_state = LoopState::default();

        match self.refresh().await {
            Ok(report) => loop_state.last_head = Some(report.head),
            Err(e) => loop_state.poll_error = Some(format!("refresh failed: {e}")),
        }

        for kind in [SubscriptionKind::NewHeads, SubscriptionKind::PendingTransactions] {
            let slot = self.open_subscription(kind, &events_tx).await;
            loop_state.set_slot(kind, slot);
        }
        self.set_state(loop_state.liveness());

        let mut poll = tokio::time::interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut block_poll = tokio::time::interval(self.config.block_poll_interval);
        block_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut backoff = Backoff::default();
        let mut resubscribe_at = loop_state
            .has_missing()
            .then(|| Instant::now() + backoff.next());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                Some(event) = events.recv() => {
                    self.handle_event(event, &mut loop_state).await;
                    if loop_state.has_missing() && resubscribe_at.is_none() {
                        resubscribe_at = Some(Instant::now() + backoff.next());
                    }
                    self.set_state(loop_state.liveness());
                }

                _ = poll.tick() => {
                    match self.refresh().await {
                        Ok(report) => {
                            loop_state.poll_error = None;
                            loop_state.advance_head(report.head);
                        }
                        Err(e) => {
                            warn!(error = %e, "Fallback refresh failed");
                            loop_state.poll_error = Some(format!("refresh failed: {e}"));
                        }
                    }
                    self.set_state(loop_state.liveness());
                }

                _ = tokio::time::sleep_until(resubscribe_at.unwrap_or_else(Instant::now)),
                    if resubscribe_at.is_some() =>
                {
                    for kind in loop_state.missing_kinds() {
                        let slot = self.open_subscription(kind, &events_tx).await;
                        loop_state.set_slot(kind, slot);
                    }
                    resubscribe_at = if loop_state.has_missing() {
                        Some(Instant::now() + backoff.next())
                    } else {
                        backoff.reset();
                        None
                    };
                    self.set_state(loop_state.liveness());
                }

                _ = block_poll.tick(), if loop_state.heads_unsupported() => {
                    self.poll_block_number(&mut loop_state).await;
                    self.set_state(loop_state.liveness());
                }
            }
        }

        for id in loop_state.active_ids() {
            if let Err(e) = self.client.unsubscribe(&id).await {
                debug!(id = %id.0, error = %e, "Unsubscribe failed during teardown");
            }
        }
        self.set_state(LivenessState::Disconnected);
        info!("Chain event watcher stopped");
    }

    async fn open_subscription(
        &self,
        kind: SubscriptionKind,
        events: &mpsc::Sender<ChainEvent>,
    ) -> Slot {
        match self.client.subscribe(kind, events.clone()).await {
            Ok(id) => {
                info!(kind = kind.rpc_name(), id = %id.0, "Subscription established");
                Slot::Active(id)
            }
            Err(RelayError::UnsupportedCapability { .. }) => {
                info!(
                    kind = kind.rpc_name(),
                    "Subscription not supported by provider, relying on polling"
                );
                Slot::Unsupported
            }
            Err(e) => {
                warn!(kind = kind.rpc_name(), error = %e, "Subscription failed");
                Slot::Missing(e.to_string())
            }
        }
    }

    async fn handle_event(&self, event: ChainEvent, loop_state: &mut LoopState) {
        match event {
            ChainEvent::NewBlock(number) => {
                if let Err(e) = self.handle_new_block(number).await {
                    warn!(number, error = %e, "Failed to merge new block");
                }
                loop_state.advance_head(number);
            }
            ChainEvent::PendingTransaction(hash) => {
                self.handle_pending_hash(&hash).await;
            }
            ChainEvent::SubscriptionLost { kind, reason } => {
                warn!(kind = kind.rpc_name(), %reason, "Subscription lost");
                loop_state.set_slot(kind, Slot::Missing(reason));
            }
        }
    }

    /// Synthesize new-block events from `eth_blockNumber`
    async fn poll_block_number(&self, loop_state: &mut LoopState) {
        let head = match self.client.block_number().await {
            Ok(head) => head,
            Err(e) => {
                debug!(error = %e, "Block number poll failed");
                loop_state.poll_error = Some(format!("block poll failed: {e}"));
                return;
            }
        };
        loop_state.poll_error = None;

        let Some(last) = loop_state.last_head else {
            loop_state.last_head = Some(head);
            return;
        };
        if head <= last {
            return;
        }

        // After a long gap only the newest blocks matter
        let first = (last + 1).max(head.saturating_sub(self.config.recent_blocks.max(1) - 1));
        for number in first..=head {
            if let Err(e) = self.handle_new_block(number).await {
                warn!(number, error = %e, "Failed to merge polled block");
            }
        }
        loop_state.advance_head(head);
    }
}

/// Handle to a running watcher
pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Stop timers, cancel established subscriptions and wait for the loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Watcher task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn block_records(block: &RawBlock, number: u64, stamp: u64) -> Vec<TransactionRecord> {
    block
        .transactions
        .iter()
        .map(|tx| {
            let mut record = normalize(tx, false, block.timestamp, stamp);
            if record.block_number.is_none() && !record.is_sentinel() {
                record.block_number = Some(block.number.unwrap_or(number));
            }
            record
        })
        .collect()
}

// =============================================================================
// Loop bookkeeping
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Active(SubscriptionId),
    Unsupported,
    Missing(String),
}

struct LoopState {
    heads: Slot,
    pending: Slot,
    poll_error: Option<String>,
    last_head: Option<u64>,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            heads: Slot::Missing("not subscribed".into()),
            pending: Slot::Missing("not subscribed".into()),
            poll_error: None,
            last_head: None,
        }
    }
}

impl LoopState {
    fn set_slot(&mut self, kind: SubscriptionKind, slot: Slot) {
        match kind {
            SubscriptionKind::NewHeads => self.heads = slot,
            SubscriptionKind::PendingTransactions => self.pending = slot,
        }
    }

    fn slots(&self) -> [(SubscriptionKind, &Slot); 2] {
        [
            (SubscriptionKind::NewHeads, &self.heads),
            (SubscriptionKind::PendingTransactions, &self.pending),
        ]
    }

    fn has_missing(&self) -> bool {
        !self.missing_kinds().is_empty()
    }

    fn missing_kinds(&self) -> Vec<SubscriptionKind> {
        self.slots()
            .into_iter()
            .filter(|(_, slot)| matches!(slot, Slot::Missing(_)))
            .map(|(kind, _)| kind)
            .collect()
    }

    fn active_ids(&self) -> Vec<SubscriptionId> {
        self.slots()
            .into_iter()
            .filter_map(|(_, slot)| match slot {
                Slot::Active(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn heads_unsupported(&self) -> bool {
        self.heads == Slot::Unsupported
    }

    fn advance_head(&mut self, head: u64) {
        self.last_head = Some(self.last_head.map_or(head, |last| last.max(head)));
    }

    fn liveness(&self) -> LivenessState {
        if let Some(reason) = &self.poll_error {
            return LivenessState::Degraded(reason.clone());
        }
        for (kind, slot) in self.slots() {
            if let Slot::Missing(reason) = slot {
                return LivenessState::Degraded(format!("{}: {reason}", kind.rpc_name()));
            }
        }
        LivenessState::Live
    }
}

/// Exponential resubscribe delay, 100ms doubling up to 30s
struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(30);

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }
}
