//! Write-back session tracking.
//!
//! This crate keeps per-user session time in memory and writes it back to a
//! [`tally_store::SessionStore`] in batches:
//! - open sessions, one per user, started and ended by host signals
//! - a batch of closed sessions waiting for the next flush
//! - periodic background flushes plus a final synchronous flush at shutdown
//! - queries that merge durable history with everything still in memory
//!
//! # Example
//!
//! ```rust,ignore
//! use tally_session::{FlushScheduler, SessionTracker, TokioScheduler};
//!
//! let tracker = SessionTracker::new(store, Handle::current());
//! let flusher = FlushScheduler::start(tracker.clone(), &TokioScheduler::new(Handle::current()));
//!
//! tracker.start("alice");
//! tracker.end("alice");
//! let hours = tracker.accumulated_hours("alice");
//!
//! flusher.shutdown().await;
//! ```

mod clock;
mod config;
mod error;
mod events;
mod presence;
mod scheduler;
mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_INFLIGHT_FLUSHES, TrackerConfig};
pub use error::{Result, TrackerError};
pub use events::{SessionEvent, SessionEventAdapter};
pub use presence::{NoPresence, OnlineRoster, Presence};
pub use scheduler::{
    FlushScheduler, ScheduledTask, ShutdownReport, Task, TaskScheduler, TokioScheduler,
};
pub use tracker::{
    Flush, FlushOutcome, FlushTarget, SessionTracker, SessionTrackerBuilder, TrackerStats,
    round_to_hours,
};
