//! Event-Sourced Pool State Store
//!
//! One store owns the snapshot of one pool. The snapshot advances by replaying
//! decoded logs through the pool's registered handlers and is rebuilt from a
//! batched read on cold start, after a rollback, or on explicit invalidation.
//!
//! Lifecycle:
//! ```text
//! Uninitialized -> Syncing -> Ready
//!                     ^         |
//!                     +---------+  rollback / invalidate
//! Syncing | Ready -> Released     (terminal)
//! ```
//!
//! Log application and snapshot reads are synchronous; only rebuilds await the
//! network. At most one rebuild runs per store, concurrent callers wait for it.

use crate::aggregator::BatchAggregator;
use crate::events::EventLog;
use crate::traits::{EventHandlers, PoolStateSource, StateError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// No snapshot has ever been built
    Uninitialized,
    /// Waiting for a rebuild; reads return nothing
    Syncing,
    /// Snapshot is current and logs are being applied
    Ready,
    /// Torn down; terminal
    Released,
}

/// Immutable view of a pool's state at `block_number`
#[derive(Debug)]
pub struct Snapshot<S> {
    pub block_number: u64,
    pub state: Arc<S>,
}

impl<S> Clone for Snapshot<S> {
    fn clone(&self) -> Self {
        Self {
            block_number: self.block_number,
            state: Arc::clone(&self.state),
        }
    }
}

impl<S> Snapshot<S> {
    pub fn new(block_number: u64, state: S) -> Self {
        Self {
            block_number,
            state: Arc::new(state),
        }
    }
}

/// What the snapshot reflects.
///
/// A rebuild or an installed snapshot covers every log up to and including
/// `synced_block`; `last_applied` is the last `(block, log index)` replayed on
/// top of it, always above `synced_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub synced_block: u64,
    pub last_applied: Option<(u64, u64)>,
}

impl LogPosition {
    pub fn rebuilt_at(block_number: u64) -> Self {
        Self {
            synced_block: block_number,
            last_applied: None,
        }
    }

    /// Highest block reflected
    pub fn block_number(&self) -> u64 {
        match self.last_applied {
            Some((block, _)) => block.max(self.synced_block),
            None => self.synced_block,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOrdering {
    /// Strictly after the snapshot; apply it
    Advance,
    /// At or below the synced height, already reflected; drop it
    Stale,
    /// Inconsistent with forward-only progress; resync
    Rollback,
}

/// True when `incoming_block` moves backwards from `current_block`
pub fn is_rollback(current_block: u64, incoming_block: u64) -> bool {
    incoming_block < current_block
}

/// Where a log at `(block_number, log_index)` falls relative to `position`
pub fn classify_log(position: &LogPosition, block_number: u64, log_index: u64) -> LogOrdering {
    if let Some((last_block, last_index)) = position.last_applied {
        if is_rollback(last_block, block_number) {
            return LogOrdering::Rollback;
        }
        if block_number > last_block || log_index > last_index {
            return LogOrdering::Advance;
        }
        // Same block delivered again: the block was replaced
        return LogOrdering::Rollback;
    }

    if block_number <= position.synced_block {
        LogOrdering::Stale
    } else {
        LogOrdering::Advance
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub rebuilds: u64,
    pub failed_rebuilds: u64,
    pub applied_logs: u64,
    pub ignored_logs: u64,
    pub failed_logs: u64,
    pub rollbacks: u64,
}

struct Inner<S> {
    status: SyncStatus,
    snapshot: Option<Snapshot<S>>,
    position: Option<LogPosition>,
}

/// Versioned state of one pool
pub struct EventSourcedStore<P: PoolStateSource> {
    identifier: String,
    source: Arc<P>,
    aggregator: Arc<BatchAggregator>,
    handlers: EventHandlers<P::State>,
    inner: RwLock<Inner<P::State>>,
    /// Set while a rebuild is running; waiters subscribe to it
    in_flight: Mutex<Option<Arc<Notify>>>,
    rebuilds: AtomicU64,
    failed_rebuilds: AtomicU64,
    applied_logs: AtomicU64,
    ignored_logs: AtomicU64,
    failed_logs: AtomicU64,
    rollbacks: AtomicU64,
}

/// Clears the in-flight marker and wakes waiters, also when the rebuild
/// future is dropped mid-flight
struct InFlightGuard<'a> {
    slot: &'a Mutex<Option<Arc<Notify>>>,
    notify: Arc<Notify>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        *slot = None;
        self.notify.notify_waiters();
    }
}

enum RebuildRole {
    Leader(Arc<Notify>),
    Waiter(Arc<Notify>),
}

/// Holds a store's rebuild slot for a read issued elsewhere, such as one
/// batched across many stores. Callers of [`EventSourcedStore::generate_state`]
/// wait on it like on any other rebuild; dropping it without completing wakes
/// them with whatever the store holds.
pub struct RebuildTicket<'a, P: PoolStateSource> {
    store: &'a EventSourcedStore<P>,
    _guard: InFlightGuard<'a>,
}

impl<P: PoolStateSource> RebuildTicket<'_, P> {
    pub fn store(&self) -> &EventSourcedStore<P> {
        self.store
    }

    /// Commit the outcome of the read; the snapshot the store ends up
    /// serving is returned
    pub fn complete(
        self,
        result: Result<Snapshot<P::State>, StateError>,
    ) -> Result<Snapshot<P::State>, StateError> {
        self.store.finish_rebuild(result)
    }
}

impl<P: PoolStateSource> EventSourcedStore<P> {
    pub fn new(identifier: impl Into<String>, source: Arc<P>, aggregator: Arc<BatchAggregator>) -> Self {
        let mut handlers = EventHandlers::new();
        source.register_handlers(&mut handlers);

        let identifier = identifier.into();
        debug!(
            "Created store {} with handlers {:?}",
            identifier,
            handlers.event_names()
        );

        Self {
            identifier,
            source,
            aggregator,
            handlers,
            inner: RwLock::new(Inner {
                status: SyncStatus::Uninitialized,
                snapshot: None,
                position: None,
            }),
            in_flight: Mutex::new(None),
            rebuilds: AtomicU64::new(0),
            failed_rebuilds: AtomicU64::new(0),
            applied_logs: AtomicU64::new(0),
            ignored_logs: AtomicU64::new(0),
            failed_logs: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn source(&self) -> &Arc<P> {
        &self.source
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.read().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == SyncStatus::Ready
    }

    /// Height of the current snapshot, if ready
    pub fn block_number(&self) -> Option<u64> {
        self.get_state().map(|s| s.block_number)
    }

    /// Current snapshot, or `None` when not ready.
    ///
    /// `None` is the cue to call [`Self::generate_state`] rather than wait.
    pub fn get_state(&self) -> Option<Snapshot<P::State>> {
        let inner = self.inner.read();
        match inner.status {
            SyncStatus::Ready => inner.snapshot.clone(),
            _ => None,
        }
    }

    /// Current snapshot, rebuilding on demand when not ready
    pub async fn get_or_generate_state(&self) -> Result<Snapshot<P::State>, StateError> {
        match self.get_state() {
            Some(snapshot) => Ok(snapshot),
            None => self.generate_state(None).await,
        }
    }

    /// Full rebuild via the batch aggregator at `block` (latest when `None`).
    ///
    /// Single-flight: while a rebuild runs, further callers wait for it and
    /// receive its snapshot instead of issuing their own reads. A ready store
    /// stays readable while it refreshes.
    pub async fn generate_state(&self, block: Option<u64>) -> Result<Snapshot<P::State>, StateError> {
        if self.status() == SyncStatus::Released {
            return Err(StateError::Released(self.identifier.clone()));
        }

        let role = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(notify) => RebuildRole::Waiter(Arc::clone(notify)),
                None => {
                    let notify = Arc::new(Notify::new());
                    *slot = Some(Arc::clone(&notify));
                    RebuildRole::Leader(notify)
                }
            }
        };

        match role {
            RebuildRole::Leader(notify) => {
                let _guard = InFlightGuard {
                    slot: &self.in_flight,
                    notify,
                };
                self.rebuild(block).await
            }
            RebuildRole::Waiter(notify) => {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let still_running = self
                    .in_flight
                    .lock()
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &notify));
                if still_running {
                    debug!("Waiting for in-flight rebuild of {}", self.identifier);
                    notified.await;
                }

                self.get_state()
                    .ok_or_else(|| StateError::Unavailable(self.identifier.clone()))
            }
        }
    }

    /// Claim the rebuild slot without reading anything.
    ///
    /// `None` when a rebuild is already in flight or the store is released.
    pub fn try_begin_rebuild(&self) -> Option<RebuildTicket<'_, P>> {
        let notify = {
            let mut slot = self.in_flight.lock();
            if slot.is_some() {
                return None;
            }
            let notify = Arc::new(Notify::new());
            *slot = Some(Arc::clone(&notify));
            notify
        };
        let guard = InFlightGuard {
            slot: &self.in_flight,
            notify,
        };

        self.begin_rebuild().ok()?;
        Some(RebuildTicket {
            store: self,
            _guard: guard,
        })
    }

    fn begin_rebuild(&self) -> Result<(), StateError> {
        let mut inner = self.inner.write();
        match inner.status {
            SyncStatus::Released => Err(StateError::Released(self.identifier.clone())),
            SyncStatus::Uninitialized => {
                inner.status = SyncStatus::Syncing;
                Ok(())
            }
            SyncStatus::Syncing | SyncStatus::Ready => Ok(()),
        }
    }

    async fn rebuild(&self, block: Option<u64>) -> Result<Snapshot<P::State>, StateError> {
        self.begin_rebuild()?;

        debug!("Rebuilding {} at {:?}", self.identifier, block);
        let calls = self.source.on_chain_calls();

        let result = match self.aggregator.aggregate(&calls, block).await {
            Ok(aggregated) => {
                let block_number = aggregated.block_number;
                aggregated
                    .into_values()
                    .map_err(|source| StateError::Rebuild {
                        identifier: self.identifier.clone(),
                        source,
                    })
                    .and_then(|outputs| self.decode_snapshot(block_number, outputs))
            }
            Err(source) => Err(StateError::Rebuild {
                identifier: self.identifier.clone(),
                source,
            }),
        };

        self.finish_rebuild(result)
    }

    /// Decode this pool's share of a batched read taken at `block_number`
    pub fn decode_snapshot(
        &self,
        block_number: u64,
        outputs: Vec<P::CallOutput>,
    ) -> Result<Snapshot<P::State>, StateError> {
        self.source
            .decode_on_chain_calls(outputs)
            .map(|state| Snapshot::new(block_number, state))
            .map_err(|source| StateError::Decode {
                identifier: self.identifier.clone(),
                source,
            })
    }

    fn finish_rebuild(
        &self,
        result: Result<Snapshot<P::State>, StateError>,
    ) -> Result<Snapshot<P::State>, StateError> {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.failed_rebuilds.fetch_add(1, Ordering::Relaxed);
                warn!("{}", e);
                return Err(e);
            }
        };

        let committed = {
            let mut inner = self.inner.write();
            let newer = match inner.status {
                SyncStatus::Released => return Err(StateError::Released(self.identifier.clone())),
                // Logs applied while the read was in flight are ahead of it
                SyncStatus::Ready => inner
                    .snapshot
                    .as_ref()
                    .filter(|current| current.block_number > snapshot.block_number)
                    .cloned(),
                SyncStatus::Uninitialized | SyncStatus::Syncing => None,
            };
            match newer {
                Some(current) => current,
                None => {
                    inner.snapshot = Some(snapshot.clone());
                    inner.position = Some(LogPosition::rebuilt_at(snapshot.block_number));
                    inner.status = SyncStatus::Ready;
                    snapshot.clone()
                }
            }
        };

        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        if committed.block_number > snapshot.block_number {
            debug!(
                "Kept {} at block {} over rebuild at block {}",
                self.identifier, committed.block_number, snapshot.block_number
            );
        } else {
            info!(
                "✅ Rebuilt {} at block {}",
                self.identifier, snapshot.block_number
            );
        }
        Ok(committed)
    }

    /// Apply one decoded log.
    ///
    /// Returns the new snapshot, or `None` when the log is irrelevant, arrives
    /// before the store is ready, is already reflected, signals a rollback, or
    /// fails to decode. None of these cases are errors.
    pub fn apply_log(&self, log: &EventLog) -> Option<Snapshot<P::State>> {
        if !self.source.is_relevant(log) {
            return None;
        }

        let mut inner = self.inner.write();
        if inner.status != SyncStatus::Ready {
            self.ignored_logs.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dropping {} for {} while {:?}",
                log.event_name, self.identifier, inner.status
            );
            return None;
        }

        let position = inner
            .position
            .unwrap_or_else(|| LogPosition::rebuilt_at(0));
        match classify_log(&position, log.block_number, log.log_index) {
            LogOrdering::Advance => {}
            LogOrdering::Stale => {
                self.ignored_logs.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            LogOrdering::Rollback => {
                warn!(
                    "🔄 Rollback detected for {}: log at {}:{} behind {:?}",
                    self.identifier, log.block_number, log.log_index, position
                );
                inner.status = SyncStatus::Syncing;
                inner.snapshot = None;
                self.rollbacks.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let Some(handler) = self.handlers.get(&log.event_name) else {
            self.ignored_logs.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let Some(current) = inner.snapshot.as_ref() else {
            return None;
        };

        let mut next = (*current.state).clone();
        if let Err(e) = handler(&mut next, log) {
            self.failed_logs.fetch_add(1, Ordering::Relaxed);
            error!(
                "Failed to apply {} at {}:{} to {}: {}",
                log.event_name, log.block_number, log.log_index, self.identifier, e
            );
            return None;
        }

        let snapshot = Snapshot::new(log.block_number, next);
        inner.snapshot = Some(snapshot.clone());
        inner.position = Some(LogPosition {
            synced_block: position.synced_block,
            last_applied: Some((log.block_number, log.log_index)),
        });
        self.applied_logs.fetch_add(1, Ordering::Relaxed);
        Some(snapshot)
    }

    /// Install a snapshot built elsewhere (e.g. read from the shared cache).
    ///
    /// A ready store ignores snapshots that are not newer than its own.
    /// Returns whether the snapshot was installed.
    pub fn install_snapshot(&self, snapshot: Snapshot<P::State>) -> bool {
        let mut inner = self.inner.write();
        match inner.status {
            SyncStatus::Released => return false,
            SyncStatus::Ready => {
                let current = inner.position.map(|p| p.block_number()).unwrap_or_default();
                if snapshot.block_number <= current {
                    return false;
                }
            }
            SyncStatus::Uninitialized | SyncStatus::Syncing => {}
        }

        inner.position = Some(LogPosition::rebuilt_at(snapshot.block_number));
        inner.snapshot = Some(snapshot);
        inner.status = SyncStatus::Ready;
        true
    }

    /// Force the next read to rebuild
    pub fn invalidate(&self) {
        let mut inner = self.inner.write();
        if inner.status == SyncStatus::Ready {
            inner.status = SyncStatus::Syncing;
            inner.snapshot = None;
            debug!("Invalidated {}", self.identifier);
        }
    }

    /// Drop the snapshot for good
    pub fn release(&self) {
        let mut inner = self.inner.write();
        inner.status = SyncStatus::Released;
        inner.snapshot = None;
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            failed_rebuilds: self.failed_rebuilds.load(Ordering::Relaxed),
            applied_logs: self.applied_logs.load(Ordering::Relaxed),
            ignored_logs: self.ignored_logs.load(Ordering::Relaxed),
            failed_logs: self.failed_logs.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}
