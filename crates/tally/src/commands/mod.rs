//! CLI command handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tally_config::TallyConfig;
use tally_store::SqliteSessionStore;

pub mod report;
pub mod run;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration.
    pub config: TallyConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Open the session database, preferring `--db` over the config.
    pub fn open_store(&self, db: Option<PathBuf>) -> Result<Arc<SqliteSessionStore>> {
        let path = db.unwrap_or_else(|| self.config.storage().resolved_path());
        if self.verbose {
            eprintln!("Database: {}", path.display());
        }
        let store = SqliteSessionStore::open(&path)
            .with_context(|| format!("failed to open session database {}", path.display()))?;
        Ok(Arc::new(store))
    }
}
