//! Periodic and shutdown flushing.
//!
//! [`TaskScheduler`] is the "run this every N" capability a host provides;
//! [`TokioScheduler`] implements it on a tokio runtime. [`FlushScheduler`]
//! registers the tracker's flushes with it and performs the final
//! synchronous flush at shutdown.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::tracker::{Flush, FlushOutcome, FlushTarget, SessionTracker};

/// A callback run on every tick.
pub type Task = Box<dyn Fn() + Send + Sync + 'static>;

/// Handle to a registered periodic task. Dropping it stops the task.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    stop: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn new(name: &'static str, stop: oneshot::Sender<()>, join: JoinHandle<()>) -> Self {
        Self { name, stop, join }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the task and wait until its current run, if any, has finished.
    pub async fn cancel(self) {
        // The receiver is gone if the task already exited.
        let _ = self.stop.send(());
        if let Err(e) = self.join.await {
            warn!(task = self.name, error = %e, "Scheduled task ended abnormally");
        }
    }
}

/// Registers callbacks to run at a fixed interval.
pub trait TaskScheduler: Send + Sync {
    fn register(&self, name: &'static str, interval: Duration, task: Task) -> ScheduledTask;
}

/// [`TaskScheduler`] backed by `tokio::time::interval`.
///
/// The first run happens one full interval after registration; ticks missed
/// while a run was slow are delayed rather than bursted.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    runtime: Handle,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl TaskScheduler for TokioScheduler {
    fn register(&self, name: &'static str, interval: Duration, task: Task) -> ScheduledTask {
        let period = interval.max(Duration::from_millis(1));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        debug!(task = name, "Scheduled task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        trace!(task = name, "Running scheduled task");
                        task();
                    }
                }
            }
        });

        debug!(task = name, interval_ms = period.as_millis() as u64, "Registered periodic task");
        ScheduledTask::new(name, stop_tx, join)
    }
}

/// Outcomes of the final flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub open: FlushOutcome,
    pub closed: FlushOutcome,
}

/// Drives the tracker's flushes: periodically in the background, and once,
/// synchronously, at shutdown.
pub struct FlushScheduler {
    tracker: SessionTracker,
    task: Option<ScheduledTask>,
}

impl FlushScheduler {
    /// Register the periodic flush with `scheduler` using the tracker's
    /// configured interval.
    pub fn start<S>(tracker: SessionTracker, scheduler: &S) -> Self
    where
        S: TaskScheduler + ?Sized,
    {
        let config = tracker.config().clone();
        let periodic = tracker.clone();
        let task = scheduler.register(
            "session-flush",
            config.flush_interval,
            Box::new(move || run_periodic_flush(&periodic, config.flush_open_sessions)),
        );

        info!(
            interval_secs = config.flush_interval.as_secs(),
            flush_open = config.flush_open_sessions,
            "Session flush scheduled"
        );
        Self {
            tracker,
            task: Some(task),
        }
    }

    /// Stop the periodic flush, wait for background commits already
    /// submitted, then flush open sessions and the closed batch
    /// synchronously, in that order. Nothing here has a timeout.
    pub async fn shutdown(mut self) -> ShutdownReport {
        if let Some(task) = self.task.take() {
            task.cancel().await;
        }
        self.tracker.wait_for_background_flushes().await;

        let tracker = self.tracker.clone();
        let flushed =
            tokio::task::spawn_blocking(move || (tracker.flush_open(true), tracker.flush_closed(true)))
                .await;

        let report = match flushed {
            Ok((open, closed)) => ShutdownReport {
                open: open.outcome().await,
                closed: closed.outcome().await,
            },
            Err(e) => {
                warn!(error = %e, "Shutdown flush aborted");
                let failed = FlushOutcome::Failed {
                    records: 0,
                    error: e.to_string(),
                };
                ShutdownReport {
                    open: failed.clone(),
                    closed: failed,
                }
            }
        };

        info!(open = ?report.open, closed = ?report.closed, "Session tracker flushed for shutdown");
        report
    }
}

fn run_periodic_flush(tracker: &SessionTracker, flush_open: bool) {
    if flush_open {
        watch(tracker, FlushTarget::Open, tracker.flush_open(false));
    }
    watch(tracker, FlushTarget::Closed, tracker.flush_closed(false));
}

/// Log a background flush's outcome once it lands. Nothing waits on it.
fn watch(tracker: &SessionTracker, target: FlushTarget, flush: Flush) {
    match flush {
        Flush::Completed(FlushOutcome::Empty) => {}
        Flush::Completed(outcome) => {
            debug!(collection = %target, outcome = ?outcome, "Periodic flush finished")
        }
        Flush::Spawned(handle) => {
            tracker.runtime().spawn(async move {
                let outcome = Flush::Spawned(handle).outcome().await;
                debug!(collection = %target, outcome = ?outcome, "Periodic flush finished");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tally_store::{
        MockSessionStore, SessionFilter, SessionOrder, SessionRecord, SessionStore,
    };

    use super::*;
    use crate::config::TrackerConfig;

    fn tracker_with(store: Arc<MockSessionStore>, config: TrackerConfig) -> SessionTracker {
        SessionTracker::builder(store, Handle::current())
            .config(config)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_runs_on_interval() {
        let scheduler = TokioScheduler::new(Handle::current());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let task = scheduler.register(
            "counter",
            Duration::from_secs(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(task.name(), "counter");

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.cancel().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_periodic_flush_persists_batch() {
        let store = Arc::new(MockSessionStore::new());
        let tracker = tracker_with(
            store.clone(),
            TrackerConfig::new()
                .with_flush_interval(Duration::from_millis(20))
                .with_flush_open_sessions(false),
        );
        let flusher = FlushScheduler::start(tracker.clone(), &TokioScheduler::new(Handle::current()));

        assert!(tracker.start("alice"));
        assert!(tracker.start("bob"));
        assert!(tracker.end("alice"));

        let mut waited = 0;
        while store.rows().is_empty() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(store.rows().len(), 1);
        assert_eq!(tracker.stats().open, 1);

        let report = flusher.shutdown().await;
        assert_eq!(report.open, FlushOutcome::Committed { records: 1 });
        assert_eq!(report.closed, FlushOutcome::Empty);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_flushes_open_then_closed() {
        let store = Arc::new(MockSessionStore::new());
        let tracker = tracker_with(store.clone(), TrackerConfig::default());
        let flusher = FlushScheduler::start(tracker.clone(), &TokioScheduler::new(Handle::current()));

        assert!(tracker.start("alice"));
        assert!(tracker.start("bob"));
        assert!(tracker.end("bob"));

        let report = flusher.shutdown().await;
        assert_eq!(report.open, FlushOutcome::Committed { records: 1 });
        assert_eq!(report.closed, FlushOutcome::Committed { records: 1 });
        assert_eq!(store.save_calls(), 2);

        let rows = store.rows();
        assert_eq!(rows.len(), 2);
        // Open sessions are committed first.
        assert!(rows[0].is_open());
        assert!(!rows[1].is_open());
    }

    /// Store whose saves take a while.
    struct SlowStore {
        rows: MockSessionStore,
        delay: Duration,
    }

    impl SessionStore for SlowStore {
        fn save_all(&self, records: &mut [SessionRecord]) -> tally_store::Result<()> {
            std::thread::sleep(self.delay);
            self.rows.save_all(records)
        }

        fn find_one(
            &self,
            filter: &SessionFilter,
            order: SessionOrder,
        ) -> tally_store::Result<Option<SessionRecord>> {
            self.rows.find_one(filter, order)
        }

        fn find_all(
            &self,
            filter: &SessionFilter,
            visit: &mut dyn FnMut(SessionRecord),
        ) -> tally_store::Result<usize> {
            self.rows.find_all(filter, visit)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_queued_background_flushes() {
        let store = Arc::new(SlowStore {
            rows: MockSessionStore::new(),
            delay: Duration::from_millis(300),
        });
        let tracker = SessionTracker::builder(store.clone(), Handle::current())
            .config(TrackerConfig::new().with_max_inflight_flushes(1))
            .build();
        let flusher = FlushScheduler::start(tracker.clone(), &TokioScheduler::new(Handle::current()));

        // The second commit queues behind the first for the single permit.
        for user in ["alice", "bob"] {
            assert!(tracker.start(user));
            assert!(tracker.end(user));
            drop(tracker.flush_closed(false));
        }
        assert_eq!(tracker.stats().closed_in_flight, 2);

        let report = flusher.shutdown().await;

        assert_eq!(report.closed, FlushOutcome::Empty);
        assert_eq!(tracker.stats(), Default::default());
        let rows = store.rows.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| !r.is_open()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_absorbs_store_failures() {
        let store = Arc::new(MockSessionStore::new());
        store.set_fail_saves(true);
        let tracker = tracker_with(store.clone(), TrackerConfig::default());
        let flusher = FlushScheduler::start(tracker.clone(), &TokioScheduler::new(Handle::current()));

        assert!(tracker.start("alice"));
        let report = flusher.shutdown().await;

        assert!(report.open.is_failure());
        assert_eq!(report.closed, FlushOutcome::Empty);
        assert_eq!(tracker.stats().open, 0);
        assert!(store.rows().is_empty());
    }
}
