use ahash::AHashMap as HashMap;
use futures::future::{BoxFuture, join_all};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, sleep_until};

use crate::affinity::{Affinity, NodeId};
use crate::aggregate::{AggregateResult, ResultAggregator};
use crate::errors::{GridError, Result};
use crate::failure::{FailureAction, FailureHandler, TopologyEvent};
use crate::locking::sort_for_locking;
use crate::row_source::{EnlistItem, EntryFilter, RowSource};
use crate::snapshot::SnapshotVersion;
use crate::transaction::Transaction;
use crate::transport::{EnlistRequest, EnlistResponse, GridTransport};
use crate::enlist::PrimaryEnlister;

/// Batch metadata supplied by the relational or cache-API layer.
#[derive(Clone)]
pub struct EnlistConfig {
    /// The single timeout governing the whole batch; on expiry the
    /// coordinator cancels and releases everything it holds.
    pub timeout: Duration,
    /// Upper bound on items in flight at once — the backpressure that keeps
    /// a slow partition owner from queueing the whole source in memory.
    pub max_in_flight: usize,
    /// Whether any per-key failure must abort the whole batch.
    pub atomic: bool,
    /// Optional previous-value predicate applied to every entry.
    pub filter: Option<Arc<dyn EntryFilter>>,
}

impl Default for EnlistConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_in_flight: 32,
            atomic: false,
            filter: None,
        }
    }
}

/// Lifecycle of an [EnlistCoordinator]. `Completed`, `Failed` and
/// `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CoordinatorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CoordinatorState::Completed | CoordinatorState::Failed | CoordinatorState::Cancelled
        )
    }
}

/// Cooperative cancellation flag for one coordinator. Cloneable so the
/// client-facing layer can cancel from outside; `cancel` is idempotent and
/// safe from any state.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Requests cancellation. The coordinator observes the flag at its next
    /// suspension point.
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            debug!("enlistment cancellation requested");
        }
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation was requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Drives one enlistment batch to a terminal state.
///
/// The coordinator pulls items from the row source in bounded windows,
/// routes each window to the primary owners of its keys (in the
/// deterministic lock order per owner), awaits lock-apply-replicate for
/// every item, and folds the per-key outcomes into the aggregate. State
/// machine: `Created → Running → {Completed, Failed, Cancelled}`.
///
/// All of the coordinator's state except the shared lock table is owned by
/// this instance; outcomes are recorded by the single driving task, so
/// completion detection (source exhausted and every dispatched item
/// recorded) cannot race the last outcome.
pub struct EnlistCoordinator<S: RowSource> {
    tx: Arc<Transaction>,
    source: S,
    snapshot: SnapshotVersion,
    cfg: EnlistConfig,
    local_node: NodeId,
    local_enlister: Arc<PrimaryEnlister>,
    affinity: Arc<dyn Affinity>,
    transport: Arc<dyn GridTransport>,
    failure: Arc<FailureHandler>,
    topology_rx: broadcast::Receiver<TopologyEvent>,
    state: CoordinatorState,
    aggregator: ResultAggregator,
    result: Option<AggregateResult>,
    error: Option<GridError>,
    cancel: CancelHandle,
    dispatched: u64,
    recorded: u64,
    exhausted: bool,
}

impl<S: RowSource> EnlistCoordinator<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tx: Arc<Transaction>,
        source: S,
        snapshot: SnapshotVersion,
        cfg: EnlistConfig,
        local_node: NodeId,
        local_enlister: Arc<PrimaryEnlister>,
        affinity: Arc<dyn Affinity>,
        transport: Arc<dyn GridTransport>,
        failure: Arc<FailureHandler>,
        topology_rx: broadcast::Receiver<TopologyEvent>,
    ) -> Self {
        let needs_previous = source.needs_previous();
        Self {
            tx,
            source,
            snapshot,
            cfg,
            local_node,
            local_enlister,
            affinity,
            transport,
            failure,
            topology_rx,
            state: CoordinatorState::Created,
            aggregator: ResultAggregator::new(needs_previous),
            result: None,
            error: None,
            cancel: CancelHandle::new(),
            dispatched: 0,
            recorded: 0,
            exhausted: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// The batch's snapshot version.
    pub fn snapshot(&self) -> SnapshotVersion {
        self.snapshot
    }

    /// A handle for cancelling this coordinator from outside.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Requests cancellation. Idempotent, safe from any state.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drives the batch to a terminal state, returning the aggregate on
    /// completion or exactly one classified error otherwise. Held locks are
    /// never leaked on any exit path.
    pub async fn run(&mut self) -> Result<AggregateResult> {
        if self.state != CoordinatorState::Created {
            return Err(GridError::Other(
                "enlist coordinator already started".to_string(),
            ));
        }
        if !self.tx.is_active() {
            let err = GridError::Other(format!(
                "transaction {} is not active",
                self.tx.version()
            ));
            self.state = CoordinatorState::Failed;
            self.error = Some(err.clone());
            return Err(err);
        }

        self.state = CoordinatorState::Running;
        debug!(
            "enlisting {:?} batch for tx {} at snapshot {:?}",
            self.source.operation(),
            self.tx.version(),
            self.snapshot
        );

        let deadline = Instant::now() + self.cfg.timeout;
        match self.drive(deadline).await {
            Ok(()) => {
                self.state = CoordinatorState::Completed;
                let aggregator =
                    std::mem::replace(&mut self.aggregator, ResultAggregator::new(false));
                let result = aggregator.finish();
                debug!(
                    "enlistment for tx {} completed, success={}, {} outcomes",
                    self.tx.version(),
                    result.success,
                    result.entries()
                );
                self.result = Some(result.clone());
                Ok(result)
            }
            Err(GridError::Cancelled) => {
                self.cancel.cancel();
                self.state = CoordinatorState::Cancelled;
                self.error = Some(GridError::Cancelled);
                debug!("enlistment for tx {} cancelled", self.tx.version());
                Err(GridError::Cancelled)
            }
            Err(err) => {
                self.state = CoordinatorState::Failed;
                self.error = Some(err.clone());
                warn!("enlistment for tx {} failed: {}", self.tx.version(), err);
                Err(err)
            }
        }
    }

    /// The aggregate result, available only in a terminal state. In
    /// `Failed` or `Cancelled` the stored classified error is returned
    /// instead — callers get either a complete aggregate or one error,
    /// never both.
    pub fn result(&self) -> Result<AggregateResult> {
        match self.state {
            CoordinatorState::Completed => {
                self.result.clone().ok_or(GridError::ResultNotReady)
            }
            CoordinatorState::Failed | CoordinatorState::Cancelled => {
                Err(self.error.clone().unwrap_or(GridError::Cancelled))
            }
            CoordinatorState::Created | CoordinatorState::Running => {
                Err(GridError::ResultNotReady)
            }
        }
    }

    async fn drive(&mut self, deadline: Instant) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(GridError::Cancelled);
            }

            let window = self.pull_window(deadline).await?;
            if window.is_empty() {
                debug_assert_eq!(self.dispatched, self.recorded);
                return Ok(());
            }
            self.dispatch_window(window, deadline).await?;
        }
    }

    /// Pulls up to `max_in_flight` items from the source. Awaiting the
    /// source is a suspension point: cancellation and the batch deadline
    /// both interrupt it.
    async fn pull_window(&mut self, deadline: Instant) -> Result<Vec<EnlistItem>> {
        let mut window = Vec::new();
        while !self.exhausted && window.len() < self.cfg.max_in_flight {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(GridError::Cancelled),
                _ = sleep_until(deadline) => return Err(GridError::Cancelled),
                item = self.source.next_item() => item?,
            };
            match next {
                Some(item) => window.push(item),
                None => self.exhausted = true,
            }
        }
        Ok(window)
    }

    /// Routes one window to the primary owners of its keys and records the
    /// outcomes. Sub-batches run concurrently across owners; within each
    /// owner, locks are acquired in the deterministic key order.
    async fn dispatch_window(&mut self, window: Vec<EnlistItem>, deadline: Instant) -> Result<()> {
        self.dispatched += window.len() as u64;

        let mut groups: HashMap<NodeId, Vec<EnlistItem>> = HashMap::new();
        for item in window {
            let partition = self.affinity.partition_of(&item.key);
            let primary = self
                .affinity
                .primary(partition)
                .ok_or(GridError::OwnershipChanged)?;
            groups.entry(primary).or_default().push(item);
        }

        let primaries: Vec<NodeId> = groups.keys().copied().collect();
        self.observe_topology(&primaries)?;

        let timeout_ms = deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        let needs_previous = self.source.needs_previous();

        let mut targets = Vec::with_capacity(groups.len());
        let mut dispatches: Vec<BoxFuture<'static, Result<EnlistResponse>>> =
            Vec::with_capacity(groups.len());
        for (node, mut items) in groups {
            sort_for_locking(&mut items);
            let request = EnlistRequest {
                tx_version: self.tx.version(),
                coordinator: self.tx.coordinator_node(),
                snapshot: self.snapshot,
                timeout_ms,
                needs_previous,
                atomic: self.cfg.atomic,
                filter: self.cfg.filter.clone(),
                items,
            };
            targets.push(node);
            if node == self.local_node {
                let enlister = Arc::clone(&self.local_enlister);
                dispatches.push(Box::pin(async move { enlister.enlist_batch(request).await }));
            } else {
                dispatches.push(self.transport.enlist(node, request));
            }
        }

        let joined = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(GridError::Cancelled),
            _ = sleep_until(deadline) => return Err(GridError::Cancelled),
            results = join_all(dispatches) => results,
        };

        for (node, result) in targets.into_iter().zip(joined) {
            match result {
                Ok(response) => {
                    for (key, outcome) in response.outcomes {
                        if self.cfg.atomic && !outcome.success {
                            let err = outcome.error.clone().unwrap_or_else(|| {
                                GridError::Other(format!("enlistment failed for key {key}"))
                            });
                            self.aggregator.record(key, outcome)?;
                            return Err(err);
                        }
                        if outcome.success {
                            self.tx.enlist_key(&key);
                        }
                        self.aggregator.record(key, outcome)?;
                        self.recorded += 1;
                    }
                }
                Err(GridError::PeerLost(_)) => {
                    return Err(self.failure.classify_peer_lost(node, true));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Drains pending topology events and applies the failure handler's
    /// classification.
    fn observe_topology(&mut self, in_flight_primaries: &[NodeId]) -> Result<()> {
        loop {
            match self.topology_rx.try_recv() {
                Ok(event) => match self.failure.classify(event, in_flight_primaries) {
                    FailureAction::Ignore | FailureAction::RetryBackups => {}
                    FailureAction::Cancel => {
                        self.cancel.cancel();
                        return Err(GridError::Cancelled);
                    }
                    FailureAction::Fatal(err) => return Err(err),
                },
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("coordinator missed {} topology events", skipped);
                }
                Err(_) => return Ok(()),
            }
        }
    }
}
