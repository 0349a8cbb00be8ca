//! Run command - tracks sessions from a line-oriented event feed on stdin.
//!
//! Each line is one of `start <user>`, `end <user>`, `hours <user>` or
//! `last <user>`. Blank lines and lines starting with `#` are skipped.
//! End of input or Ctrl+C stops the tracker after a final flush.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use clap::Args;
use tally_session::{
    FlushScheduler, OnlineRoster, SessionEvent, SessionEventAdapter, SessionTracker,
    TokioScheduler,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Context, report};

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Session database (overrides config)
    #[arg(long)]
    pub db: Option<PathBuf>,
}

/// Capacity of the channel between the stdin reader and the event worker.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, PartialEq, Eq)]
enum Request {
    Event(SessionEvent),
    Hours(String),
    Last(String),
}

/// Run the tracker until stdin closes or the process is interrupted.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let store = ctx.open_store(args.db)?;
    let runtime = Handle::current();
    let roster = Arc::new(OnlineRoster::new());

    let tracker = SessionTracker::builder(store, runtime.clone())
        .config(ctx.config.flush().to_tracker_config())
        .presence(roster.clone())
        .build();
    let flusher = FlushScheduler::start(tracker.clone(), &TokioScheduler::new(runtime));
    let mut feed = EventFeed::new(SessionEventAdapter::new(tracker.clone(), roster));

    if ctx.verbose {
        eprintln!("Reading session events from stdin, Ctrl+C to stop");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break Ok(());
            }
        };

        match line {
            Ok(Some(line)) => {
                if let Err(e) = handle_line(&line, &mut feed, &tracker, ctx).await {
                    break Err(e);
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        }
    };

    let settled = feed.settle().await;
    let result = result.and(settled.map(|_| ()));

    let report = flusher.shutdown().await;
    if report.open.is_failure() || report.closed.is_failure() {
        warn!(open = ?report.open, closed = ?report.closed, "Shutdown flush incomplete");
        eprintln!("warning: some sessions could not be saved");
    }

    result
}

/// Hands events to the adapter's worker in arrival order. Queries call
/// [`EventFeed::settle`] first so they see every event read before them.
struct EventFeed {
    adapter: SessionEventAdapter,
    events: Option<mpsc::Sender<SessionEvent>>,
    worker: Option<JoinHandle<usize>>,
}

impl EventFeed {
    fn new(adapter: SessionEventAdapter) -> Self {
        Self {
            adapter,
            events: None,
            worker: None,
        }
    }

    async fn send(&mut self, event: SessionEvent) -> Result<()> {
        if self.events.is_none() {
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            self.worker = Some(tokio::spawn(self.adapter.clone().run(rx)));
            self.events = Some(tx);
        }
        let Some(events) = &self.events else {
            bail!("session event channel is closed");
        };
        events
            .send(event)
            .await
            .map_err(|_| anyhow!("session event worker stopped"))
    }

    /// Close the channel and wait until the worker has applied everything
    /// sent so far. Returns the number of events applied.
    async fn settle(&mut self) -> Result<usize> {
        self.events = None;
        let Some(worker) = self.worker.take() else {
            return Ok(0);
        };
        let handled = worker.await?;
        debug!(handled, "Session events applied");
        Ok(handled)
    }
}

async fn handle_line(
    line: &str,
    feed: &mut EventFeed,
    tracker: &SessionTracker,
    ctx: &Context,
) -> Result<()> {
    let request = match parse_line(line) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e) => {
            eprintln!("warning: {}", e);
            return Ok(());
        }
    };

    match request {
        Request::Event(event) => feed.send(event).await?,
        Request::Hours(user) => {
            feed.settle().await?;
            let tracker = tracker.clone();
            let (user, hours) = tokio::task::spawn_blocking(move || {
                let hours = tracker.accumulated_hours(&user);
                (user, hours)
            })
            .await?;
            report::print_hours(ctx, &user, hours)?;
        }
        Request::Last(user) => {
            feed.settle().await?;
            let tracker = tracker.clone();
            let (user, last_end) = tokio::task::spawn_blocking(move || {
                let last_end = tracker.last_end_time(&user);
                (user, last_end)
            })
            .await?;
            match last_end {
                Ok(at) => report::print_last(ctx, &user, at)?,
                Err(e) => eprintln!("{}", e),
            }
        }
    }
    Ok(())
}

fn parse_line(line: &str) -> Result<Option<Request>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (verb, user) = match line.split_once(char::is_whitespace) {
        Some((verb, user)) => (verb, user.trim()),
        None => (line, ""),
    };
    if user.is_empty() {
        bail!("missing user for '{}'", verb);
    }
    let user = user.to_string();

    let request = match verb.to_ascii_lowercase().as_str() {
        "start" => Request::Event(SessionEvent::Start(user)),
        "end" => Request::Event(SessionEvent::End(user)),
        "hours" => Request::Hours(user),
        "last" => Request::Last(user),
        _ => bail!("unknown command '{}'", verb),
    };
    Ok(Some(request))
}
