//! Translates external session start/end notifications into tracker calls.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::presence::OnlineRoster;
use crate::tracker::SessionTracker;

/// A session notification from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Start(String),
    End(String),
}

/// Feeds start/end signals to the tracker and keeps the online roster in
/// step with them.
#[derive(Clone)]
pub struct SessionEventAdapter {
    tracker: SessionTracker,
    roster: Arc<OnlineRoster>,
}

impl SessionEventAdapter {
    pub fn new(tracker: SessionTracker, roster: Arc<OnlineRoster>) -> Self {
        Self { tracker, roster }
    }

    pub fn roster(&self) -> &Arc<OnlineRoster> {
        &self.roster
    }

    pub fn on_session_start(&self, user_key: &str) {
        if self.tracker.start(user_key) {
            self.roster.mark_online(user_key);
        } else {
            debug!(user_key = %user_key, "Ignored session start");
        }
    }

    pub fn on_session_end(&self, user_key: &str) {
        // Offline first, so a query racing the end never reports "now".
        self.roster.mark_offline(user_key);
        if !self.tracker.end(user_key) {
            debug!(user_key = %user_key, "Ignored session end");
        }
    }

    pub fn handle(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Start(user_key) => self.on_session_start(user_key),
            SessionEvent::End(user_key) => self.on_session_end(user_key),
        }
    }

    /// Apply events in arrival order until the channel closes.
    ///
    /// Each tracker call runs on the blocking pool and finishes before the
    /// next event is taken. Returns the number of events handled.
    pub async fn run(self, mut events: mpsc::Receiver<SessionEvent>) -> usize {
        let mut handled = 0;
        while let Some(event) = events.recv().await {
            let adapter = self.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || adapter.handle(&event)).await {
                warn!(error = %e, "Session event handler failed");
                continue;
            }
            handled += 1;
        }
        debug!(handled, "Session event stream closed");
        handled
    }
}
