//! Write-back session tracker.
//!
//! Open sessions and the batch of closed-but-unflushed sessions live in
//! memory; flushes move them to the durable store. Queries merge the store,
//! the batch and the open set.
//!
//! Lock order is always `open` then `closed`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tally_store::{SessionFilter, SessionOrder, SessionRecord, SessionStore, normalize_user_key};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::presence::{NoPresence, Presence};

const MILLIS_PER_HOUR: i64 = 3_600_000;

const PENDING_FLUSH_POLL: std::time::Duration = std::time::Duration::from_millis(5);

/// Which in-memory collection a flush drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    Open,
    Closed,
}

impl fmt::Display for FlushTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Result of one flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending; the store was not called.
    Empty,
    Committed { records: usize },
    /// The commit failed and the snapshot was dropped.
    Failed { records: usize, error: String },
}

impl FlushOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A flush either finished inline or was handed to the background pool.
#[derive(Debug)]
pub enum Flush {
    Completed(FlushOutcome),
    Spawned(JoinHandle<FlushOutcome>),
}

impl Flush {
    /// Wait for the outcome. Fire-and-forget callers simply drop the value.
    pub async fn outcome(self) -> FlushOutcome {
        match self {
            Self::Completed(outcome) => outcome,
            Self::Spawned(handle) => handle.await.unwrap_or_else(|e| FlushOutcome::Failed {
                records: 0,
                error: e.to_string(),
            }),
        }
    }
}

/// Sizes of the in-memory collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerStats {
    pub open: usize,
    pub open_in_flight: usize,
    pub closed: usize,
    pub closed_in_flight: usize,
}

#[derive(Debug, Default)]
struct OpenState {
    /// Normalized user key → open session.
    sessions: HashMap<String, SessionRecord>,
    /// Open sessions handed to a flush whose commit has not finished.
    in_flight: HashMap<Uuid, SessionRecord>,
}

impl OpenState {
    fn find(&self, key: &str, user_key: &str) -> Option<&SessionRecord> {
        self.sessions.get(key).or_else(|| {
            self.in_flight
                .values()
                .filter(|r| r.belongs_to(user_key))
                .max_by_key(|r| r.started_at)
        })
    }

    fn take(&mut self, key: &str, user_key: &str) -> Option<SessionRecord> {
        if let Some(record) = self.sessions.remove(key) {
            return Some(record);
        }
        let session_id = self
            .in_flight
            .values()
            .filter(|r| r.belongs_to(user_key))
            .max_by_key(|r| r.started_at)
            .map(|r| r.session_id)?;
        self.in_flight.remove(&session_id)
    }
}

#[derive(Debug, Default)]
struct ClosedState {
    /// Closed sessions waiting for the next flush, in close order.
    batch: Vec<SessionRecord>,
    /// Closed sessions handed to a flush whose commit has not finished.
    in_flight: HashMap<Uuid, SessionRecord>,
}

impl ClosedState {
    fn records(&self) -> impl Iterator<Item = &SessionRecord> {
        self.batch.iter().chain(self.in_flight.values())
    }

    fn contains(&self, session_id: Uuid) -> bool {
        self.in_flight.contains_key(&session_id)
            || self.batch.iter().any(|r| r.session_id == session_id)
    }
}

struct TrackerInner {
    open: Mutex<OpenState>,
    closed: Mutex<ClosedState>,
    store: Arc<dyn SessionStore>,
    presence: Arc<dyn Presence>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    flush_permits: Arc<Semaphore>,
    flush_capacity: u32,
    config: TrackerConfig,
}

/// Write-back cache of user sessions in front of a [`SessionStore`].
///
/// Cheap to clone; clones share state. Construct one at service start and
/// pass it to the event adapter and the flush scheduler.
#[derive(Clone)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

/// Builder for [`SessionTracker`].
pub struct SessionTrackerBuilder {
    store: Arc<dyn SessionStore>,
    runtime: Handle,
    presence: Arc<dyn Presence>,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
}

impl SessionTrackerBuilder {
    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn presence(mut self, presence: Arc<dyn Presence>) -> Self {
        self.presence = presence;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> SessionTracker {
        let permits = self
            .config
            .max_inflight_flushes
            .clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)) as u32;
        SessionTracker {
            inner: Arc::new(TrackerInner {
                open: Mutex::new(OpenState::default()),
                closed: Mutex::new(ClosedState::default()),
                store: self.store,
                presence: self.presence,
                clock: self.clock,
                runtime: self.runtime,
                flush_permits: Arc::new(Semaphore::new(permits as usize)),
                flush_capacity: permits,
                config: self.config,
            }),
        }
    }
}

impl SessionTracker {
    /// Create a tracker with default configuration, no presence source and
    /// the system clock. Background flushes run on `runtime`.
    pub fn new(store: Arc<dyn SessionStore>, runtime: Handle) -> Self {
        Self::builder(store, runtime).build()
    }

    pub fn builder(store: Arc<dyn SessionStore>, runtime: Handle) -> SessionTrackerBuilder {
        SessionTrackerBuilder {
            store,
            runtime,
            presence: Arc::new(NoPresence),
            clock: Arc::new(SystemClock),
            config: TrackerConfig::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// Runtime used for background flushes.
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn stats(&self) -> TrackerStats {
        let open = self.inner.open.lock();
        let closed = self.inner.closed.lock();
        TrackerStats {
            open: open.sessions.len(),
            open_in_flight: open.in_flight.len(),
            closed: closed.batch.len(),
            closed_in_flight: closed.in_flight.len(),
        }
    }

    // ── Session signals ─────────────────────────────────────────────

    /// Open a session for `user_key`.
    ///
    /// Returns `false` for an empty key. An existing open session for the
    /// same user is replaced and its time is never counted.
    pub fn start(&self, user_key: &str) -> bool {
        let Some(key) = validate(user_key) else {
            debug!("Rejected session start with empty user key");
            return false;
        };

        let record = SessionRecord::open(user_key.trim(), self.inner.clock.now());
        let session_id = record.session_id;

        let mut open = self.inner.open.lock();
        open.in_flight.retain(|_, r| !r.belongs_to(user_key));
        if let Some(previous) = open.sessions.insert(key, record) {
            debug!(
                user_key = %user_key,
                discarded = %previous.session_id,
                "Replaced unclosed session"
            );
        }

        trace!(user_key = %user_key, session_id = %session_id, "Session started");
        true
    }

    /// Close the open session for `user_key` and queue it for the next flush.
    ///
    /// Looks in the open set, then in open sessions being flushed, then in
    /// the store for the newest record without an end time. Returns `false`
    /// for an empty key or when no open session exists anywhere.
    pub fn end(&self, user_key: &str) -> bool {
        let Some(key) = validate(user_key) else {
            debug!("Rejected session end with empty user key");
            return false;
        };

        // Held across the store fallback so two ends cannot both succeed.
        let mut open = self.inner.open.lock();
        let mut record = open.take(&key, user_key);

        // Also held across the fallback: a stored row found here must not be
        // queued a second time by a concurrent flush-and-end.
        let mut closed = self.inner.closed.lock();
        if record.is_none() {
            record = self.stored_open_session(user_key, &closed);
        }

        let Some(mut record) = record else {
            debug!(user_key = %user_key, "No open session to end");
            return false;
        };

        record.close(self.inner.clock.now());
        trace!(
            user_key = %user_key,
            session_id = %record.session_id,
            "Session ended"
        );
        closed.batch.push(record);
        drop(closed);
        drop(open);
        true
    }

    fn stored_open_session(&self, user_key: &str, closed: &ClosedState) -> Option<SessionRecord> {
        let filter = SessionFilter::user(user_key).open();
        match self.inner.store.find_one(&filter, SessionOrder::NewestStart) {
            Ok(Some(record)) if closed.contains(record.session_id) => {
                // Ended in this process already; the commit is still pending.
                None
            }
            Ok(found) => {
                if let Some(record) = &found {
                    debug!(
                        user_key = %user_key,
                        session_id = %record.session_id,
                        "Resuming open session from store"
                    );
                }
                found
            }
            Err(e) => {
                warn!(user_key = %user_key, error = %e, "Open session lookup failed");
                None
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Total tracked time for `user_key` rounded half-up to whole hours.
    pub fn accumulated_hours(&self, user_key: &str) -> u64 {
        round_to_hours(self.accumulated(user_key))
    }

    /// Total tracked time for `user_key` across the store, the unflushed
    /// batch and the running session. Store failures count as no history.
    pub fn accumulated(&self, user_key: &str) -> Duration {
        let Some(key) = validate(user_key) else {
            return Duration::zero();
        };
        let now = self.inner.clock.now();

        // Memory before store: a record leaves memory only after it has been
        // committed, so reading in this order cannot miss it.
        let (running, cached) = {
            let open = self.inner.open.lock();
            let closed = self.inner.closed.lock();
            let running = open.find(&key, user_key).cloned();
            let cached: Vec<SessionRecord> = closed
                .records()
                .filter(|r| r.belongs_to(user_key))
                .cloned()
                .collect();
            (running, cached)
        };

        let mut durable = Duration::zero();
        let mut committed = HashSet::new();
        let filter = SessionFilter::user(user_key).closed();
        let result = self.inner.store.find_all(&filter, &mut |record| {
            if let Some(duration) = record.duration() {
                durable += duration;
            }
            committed.insert(record.session_id);
        });
        if let Err(e) = result {
            warn!(user_key = %user_key, error = %e, "Durable history lookup failed");
            durable = Duration::zero();
            committed.clear();
        }

        let batch = cached
            .iter()
            .filter(|r| !committed.contains(&r.session_id))
            .filter_map(SessionRecord::duration)
            .fold(Duration::zero(), |acc, d| acc + d);

        let running = match running {
            Some(record) => Some(record),
            None if self.inner.presence.is_online(user_key) => self
                .inner
                .store
                .find_one(&SessionFilter::user(user_key).open(), SessionOrder::NewestStart)
                .unwrap_or_else(|e| {
                    warn!(user_key = %user_key, error = %e, "Open session lookup failed");
                    None
                }),
            None => None,
        };
        // Ended and committed while the store was being read: already durable.
        let running = running
            .filter(|r| !committed.contains(&r.session_id))
            .map(|r| r.elapsed(now))
            .filter(|d| *d > Duration::zero())
            .unwrap_or_else(Duration::zero);

        trace!(
            user_key = %user_key,
            durable_ms = durable.num_milliseconds(),
            batch_ms = batch.num_milliseconds(),
            running_ms = running.num_milliseconds(),
            "Accumulated session time"
        );
        durable + batch + running
    }

    /// When `user_key` was last seen: now if online, otherwise the newest
    /// end time in the batch, otherwise the newest committed end time.
    pub fn last_end_time(&self, user_key: &str) -> Result<DateTime<Utc>> {
        let not_found = || TrackerError::NotFound {
            user_key: user_key.to_string(),
        };
        let Some(key) = validate(user_key) else {
            return Err(not_found());
        };
        let now = self.inner.clock.now();

        if self.inner.presence.is_online(user_key) {
            return Ok(now);
        }

        let cached_end = {
            let open = self.inner.open.lock();
            if open.find(&key, user_key).is_some() {
                return Ok(now);
            }
            let closed = self.inner.closed.lock();
            closed
                .records()
                .filter(|r| r.belongs_to(user_key))
                .filter_map(|r| r.ended_at)
                .max()
        };
        if let Some(ended_at) = cached_end {
            return Ok(ended_at);
        }

        self.inner
            .store
            .find_one(&SessionFilter::user(user_key).closed(), SessionOrder::NewestEnd)?
            .and_then(|r| r.ended_at)
            .ok_or_else(not_found)
    }

    // ── Flushing ────────────────────────────────────────────────────

    /// Persist and clear the open sessions.
    ///
    /// With `synchronous` the commit happens before returning; otherwise it
    /// runs on the background pool and the caller never waits.
    pub fn flush_open(&self, synchronous: bool) -> Flush {
        let snapshot: Vec<SessionRecord> = {
            let mut open = self.inner.open.lock();
            let sessions = std::mem::take(&mut open.sessions);
            let snapshot: Vec<SessionRecord> = sessions.into_values().collect();
            for record in &snapshot {
                open.in_flight.insert(record.session_id, record.clone());
            }
            snapshot
        };
        self.dispatch(FlushTarget::Open, snapshot, synchronous)
    }

    /// Persist and clear the batch of closed sessions.
    ///
    /// With `synchronous` the commit happens before returning; otherwise it
    /// runs on the background pool and the caller never waits.
    pub fn flush_closed(&self, synchronous: bool) -> Flush {
        let snapshot: Vec<SessionRecord> = {
            let mut closed = self.inner.closed.lock();
            let snapshot = std::mem::take(&mut closed.batch);
            for record in &snapshot {
                closed.in_flight.insert(record.session_id, record.clone());
            }
            snapshot
        };
        self.dispatch(FlushTarget::Closed, snapshot, synchronous)
    }

    /// Wait until every background commit submitted so far has finished,
    /// including those still queued for a permit.
    pub async fn wait_for_background_flushes(&self) {
        loop {
            let Ok(all) = self
                .inner
                .flush_permits
                .acquire_many(self.inner.flush_capacity)
                .await
            else {
                return;
            };
            // With every permit held no commit is running; anything still in
            // flight belongs to a task that has not reached the semaphore.
            let stats = self.stats();
            drop(all);
            if stats.open_in_flight == 0 && stats.closed_in_flight == 0 {
                return;
            }
            trace!(
                open = stats.open_in_flight,
                closed = stats.closed_in_flight,
                "Waiting for queued flushes"
            );
            tokio::time::sleep(PENDING_FLUSH_POLL).await;
        }
    }

    fn dispatch(&self, target: FlushTarget, snapshot: Vec<SessionRecord>, synchronous: bool) -> Flush {
        if snapshot.is_empty() {
            return Flush::Completed(FlushOutcome::Empty);
        }
        if synchronous {
            return Flush::Completed(self.inner.commit(target, snapshot));
        }

        let inner = Arc::clone(&self.inner);
        let permits = Arc::clone(&self.inner.flush_permits);
        let handle = self.inner.runtime.spawn(async move {
            let records = snapshot.len();
            let session_ids: Vec<Uuid> = snapshot.iter().map(|r| r.session_id).collect();

            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    inner.release(target, &session_ids);
                    error!(collection = %target, records, error = %e, "Flush pool closed; dropping snapshot");
                    return FlushOutcome::Failed {
                        records,
                        error: e.to_string(),
                    };
                }
            };

            let worker = Arc::clone(&inner);
            match tokio::task::spawn_blocking(move || worker.commit(target, snapshot)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    inner.release(target, &session_ids);
                    error!(collection = %target, records, error = %e, "Flush task aborted; dropping snapshot");
                    FlushOutcome::Failed {
                        records,
                        error: e.to_string(),
                    }
                }
            }
        });
        Flush::Spawned(handle)
    }
}

impl TrackerInner {
    fn commit(&self, target: FlushTarget, mut snapshot: Vec<SessionRecord>) -> FlushOutcome {
        let records = snapshot.len();
        let session_ids: Vec<Uuid> = snapshot.iter().map(|r| r.session_id).collect();

        let result = self.store.save_all(&mut snapshot);
        // Success or not, the snapshot is no longer pending.
        self.release(target, &session_ids);

        match result {
            Ok(()) => {
                info!(collection = %target, records, "Flushed sessions");
                FlushOutcome::Committed { records }
            }
            Err(e) => {
                error!(
                    collection = %target,
                    records,
                    error = %e,
                    "Failed to flush sessions; dropping snapshot"
                );
                FlushOutcome::Failed {
                    records,
                    error: e.to_string(),
                }
            }
        }
    }

    fn release(&self, target: FlushTarget, session_ids: &[Uuid]) {
        match target {
            FlushTarget::Open => {
                let mut open = self.open.lock();
                for id in session_ids {
                    open.in_flight.remove(id);
                }
            }
            FlushTarget::Closed => {
                let mut closed = self.closed.lock();
                for id in session_ids {
                    closed.in_flight.remove(id);
                }
            }
        }
    }
}

/// Normalized key, or `None` when the key is blank.
fn validate(user_key: &str) -> Option<String> {
    let key = normalize_user_key(user_key);
    (!key.is_empty()).then_some(key)
}

/// Round half-up to whole hours; non-positive totals are zero.
pub fn round_to_hours(total: Duration) -> u64 {
    let millis = total.num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    ((millis + MILLIS_PER_HOUR / 2) / MILLIS_PER_HOUR) as u64
}
