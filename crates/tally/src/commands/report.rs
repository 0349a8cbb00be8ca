//! One-shot reports from durable session history.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Args;
use console::style;
use serde::Serialize;
use tally_session::SessionTracker;
use tokio::runtime::Handle;

use super::Context;

/// Arguments for the report commands.
#[derive(Args, Debug)]
pub struct ReportArgs {
    /// User to report on (case-insensitive)
    pub user: String,

    /// Session database (overrides config)
    #[arg(long)]
    pub db: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct HoursOutput<'a> {
    user: &'a str,
    hours: u64,
}

#[derive(Debug, Serialize)]
struct LastOutput<'a> {
    user: &'a str,
    last_end: String,
}

/// Run the hours command.
pub async fn hours(args: ReportArgs, ctx: &Context) -> Result<()> {
    let tracker = SessionTracker::new(ctx.open_store(args.db)?, Handle::current());
    let user = args.user;

    let (user, hours) = tokio::task::spawn_blocking(move || {
        let hours = tracker.accumulated_hours(&user);
        (user, hours)
    })
    .await?;

    print_hours(ctx, &user, hours)
}

/// Run the last command. Fails when the user has no ended session.
pub async fn last(args: ReportArgs, ctx: &Context) -> Result<()> {
    let tracker = SessionTracker::new(ctx.open_store(args.db)?, Handle::current());
    let user = args.user;

    let (user, last_end) = tokio::task::spawn_blocking(move || {
        let last_end = tracker.last_end_time(&user);
        (user, last_end)
    })
    .await?;

    print_last(ctx, &user, last_end?)
}

pub(crate) fn print_hours(ctx: &Context, user: &str, hours: u64) -> Result<()> {
    if ctx.json_output {
        println!("{}", serde_json::to_string(&HoursOutput { user, hours })?);
    } else {
        println!("{} {}", style(user).bold(), hours);
    }
    Ok(())
}

pub(crate) fn print_last(ctx: &Context, user: &str, last_end: DateTime<Utc>) -> Result<()> {
    let last_end = last_end.to_rfc3339_opts(SecondsFormat::Secs, true);
    if ctx.json_output {
        println!("{}", serde_json::to_string(&LastOutput { user, last_end })?);
    } else {
        println!("{} {}", style(user).bold(), last_end);
    }
    Ok(())
}
