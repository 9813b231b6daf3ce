use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant, timeout_at};

use crate::affinity::{NodeId, key_hash};
use crate::errors::{GridError, Result};
use crate::row_source::EnlistItem;

/// Globally unique identity of a lock-holding transaction.
///
/// Transaction versions are assigned by each coordinating node's own clock,
/// so the version alone does not identify a transaction across the grid: two
/// transactions coordinated by different nodes routinely share a version.
/// The coordinating node disambiguates, and the derived ordering (version
/// first, node as tiebreaker) is the age order wait-die compares — a smaller
/// owner is older.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    pub tx_version: u64,
    pub node: NodeId,
}

/// A request to lock one key on behalf of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub key: String,
    pub owner: LockOwner,
    pub timeout_ms: u64,
}

/// The deterministic rank a key sorts by during lock acquisition.
///
/// Every coordinator acquires the locks of one dispatch window in ascending
/// `(rank, key)` order, regardless of the order the row source produced the
/// keys in. Two coordinators contending on overlapping key sets therefore
/// always approach the shared keys from the same direction and cannot form a
/// wait cycle within a window.
pub fn lock_rank(key: &str) -> u64 {
    key_hash(key)
}

/// Sorts a window of items into the cluster-wide lock acquisition order.
pub fn sort_for_locking(items: &mut [EnlistItem]) {
    items.sort_by(|a, b| {
        lock_rank(&a.key)
            .cmp(&lock_rank(&b.key))
            .then_with(|| a.key.cmp(&b.key))
    });
}

struct Waiter {
    owner: LockOwner,
    /// Receives `true` when the lock is handed over, `false` when the waiter
    /// is turned away to preserve the wait-die order.
    grant: oneshot::Sender<bool>,
}

#[derive(Default)]
struct KeyLock {
    /// Current holder and its reentrancy count.
    holder: Option<(LockOwner, u32)>,
    /// FIFO queue of transactions older than the holder.
    waiters: VecDeque<Waiter>,
}

/// The per-key lock table of one node — the only resource shared between
/// concurrent enlist coordinators.
///
/// At most one transaction holds a key at a time. Deadlocks across windows
/// (where a coordinator already holds keys from an earlier window while
/// queueing for new ones) are avoided with wait-die ordering on
/// [LockOwner]s: a younger transaction that finds a key held by an older one
/// fails immediately with [GridError::LockDeadlockAvoided] instead of
/// queueing, and a queued waiter that would end up younger than the holder
/// after a hand-off is turned away the same way. Every wait edge therefore
/// points from an older transaction to a younger one and no cycle can form.
pub struct LockTable {
    inner: Mutex<HashMap<String, KeyLock>>,
}

impl LockTable {
    /// Creates a new, empty lock table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires the lock for `request.key` on behalf of `request.owner`,
    /// waiting up to `request.timeout_ms`.
    ///
    /// Re-acquiring a key the transaction already holds is granted
    /// immediately; the lock stays held until every handle is released. On
    /// timeout the waiter is withdrawn and nothing stays held for the failed
    /// request.
    pub async fn acquire(self: &Arc<Self>, request: LockRequest) -> Result<LockHandle> {
        let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);

        let pending = {
            let mut table = self.inner.lock();
            let slot = table.entry(request.key.clone()).or_default();
            match &mut slot.holder {
                None => {
                    slot.holder = Some((request.owner, 1));
                    None
                }
                Some((holder, count)) if *holder == request.owner => {
                    *count += 1;
                    None
                }
                Some((holder, _)) => {
                    if request.owner > *holder {
                        // wait-die: the younger transaction backs off.
                        debug!(
                            "tx {:?} denied lock on {} held by older tx {:?}",
                            request.owner, request.key, holder
                        );
                        return Err(GridError::LockDeadlockAvoided(request.key));
                    }
                    let (grant, granted) = oneshot::channel();
                    slot.waiters.push_back(Waiter {
                        owner: request.owner,
                        grant,
                    });
                    Some(granted)
                }
            }
        };

        if let Some(granted) = pending {
            match timeout_at(deadline, granted).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    debug!(
                        "tx {:?} turned away from {} at hand-off",
                        request.owner, request.key
                    );
                    return Err(GridError::LockDeadlockAvoided(request.key));
                }
                _ => {
                    // Withdraw the waiter; the grant may have raced the
                    // timeout, in which case the lock is ours to give back.
                    let granted_late = {
                        let mut table = self.inner.lock();
                        match table.get_mut(&request.key) {
                            Some(slot) => {
                                slot.waiters.retain(|w| w.owner != request.owner);
                                matches!(slot.holder, Some((h, _)) if h == request.owner)
                            }
                            None => false,
                        }
                    };
                    if granted_late {
                        self.release(&request.key, request.owner);
                    }
                    debug!(
                        "tx {:?} timed out waiting for lock on {}",
                        request.owner, request.key
                    );
                    return Err(GridError::LockTimeout(request.key));
                }
            }
        }

        Ok(LockHandle {
            table: Arc::clone(self),
            key: request.key,
            owner: request.owner,
            released: AtomicBool::new(false),
        })
    }

    /// Releases one hold of `key` by `owner`, handing the lock to the next
    /// live waiter once the last hold is gone. Waiters younger than the new
    /// holder are turned away during the hand-off; letting them keep waiting
    /// would create the young-waits-on-old edge wait-die forbids. Releasing
    /// a key the transaction does not hold is a no-op.
    fn release(&self, key: &str, owner: LockOwner) {
        let mut table = self.inner.lock();
        let Some(slot) = table.get_mut(key) else {
            return;
        };
        match &mut slot.holder {
            Some((holder, count)) if *holder == owner => {
                *count -= 1;
                if *count > 0 {
                    return;
                }
                slot.holder = None;
                while let Some(waiter) = slot.waiters.pop_front() {
                    let next = waiter.owner;
                    if waiter.grant.send(true).is_ok() {
                        slot.holder = Some((next, 1));
                        break;
                    }
                }
                if let Some((holder, _)) = slot.holder {
                    let mut kept = VecDeque::new();
                    while let Some(waiter) = slot.waiters.pop_front() {
                        if waiter.owner > holder {
                            let _ = waiter.grant.send(false);
                        } else {
                            kept.push_back(waiter);
                        }
                    }
                    slot.waiters = kept;
                }
                if slot.holder.is_none() && slot.waiters.is_empty() {
                    table.remove(key);
                }
            }
            _ => {}
        }
    }

    /// Number of keys currently held by `owner`.
    pub fn held_by(&self, owner: LockOwner) -> usize {
        let table = self.inner.lock();
        table
            .values()
            .filter(|slot| matches!(slot.holder, Some((h, _)) if h == owner))
            .count()
    }

    /// Total number of held keys across all transactions.
    pub fn outstanding(&self) -> usize {
        let table = self.inner.lock();
        table.values().filter(|slot| slot.holder.is_some()).count()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A held lock. Dropping the handle releases the hold, so the lock is given
/// back on every exit path of the per-key enlistment, including cancellation
/// unwinding. [LockHandle::release] is idempotent.
pub struct LockHandle {
    table: Arc<LockTable>,
    key: String,
    owner: LockOwner,
    released: AtomicBool,
}

impl LockHandle {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The holding transaction's identity.
    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// Releases the hold. Calling this twice has the same effect as once.
    pub fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.table.release(&self.key, self.owner);
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}
