//! CLI integration tests for the tally command-line interface.
//!
//! Each test runs against a fresh database and an empty config directory
//! inside a temp dir, so no user config is picked up.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("sessions.db")
    }

    fn tally(&self) -> Command {
        let mut cmd = Command::cargo_bin("tally").unwrap();
        cmd.current_dir(self.dir.path())
            .env("TALLY_CONFIG_DIR", self.dir.path().join("config"))
            .env_remove("TALLY_CONFIG")
            .env_remove("RUST_LOG");
        cmd
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    Sandbox::new()
        .tally()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("session time tracking"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("hours"))
        .stdout(predicate::str::contains("last"));
}

#[test]
fn test_version_displays() {
    Sandbox::new()
        .tally()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tally"));
}

#[test]
fn test_global_flags_accepted() {
    Sandbox::new()
        .tally()
        .args(["--verbose", "--json", "hours", "--help"])
        .assert()
        .success();
}

#[test]
fn test_hours_requires_user() {
    Sandbox::new().tally().arg("hours").assert().failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Report Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_hours_on_empty_database() {
    let sandbox = Sandbox::new();
    sandbox
        .tally()
        .args(["hours", "alice", "--db"])
        .arg(sandbox.db())
        .assert()
        .success()
        .stdout(predicate::str::contains("alice 0"));
}

#[test]
fn test_hours_json_output() {
    let sandbox = Sandbox::new();
    sandbox
        .tally()
        .args(["--json", "hours", "alice", "--db"])
        .arg(sandbox.db())
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"user":"alice","hours":0}"#));
}

#[test]
fn test_last_for_unknown_user_fails() {
    let sandbox = Sandbox::new();
    sandbox
        .tally()
        .args(["last", "bob", "--db"])
        .arg(sandbox.db())
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "no last session end time found for user bob",
        ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Run Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_run_answers_queries_inline() {
    let sandbox = Sandbox::new();
    sandbox
        .tally()
        .args(["run", "--db"])
        .arg(sandbox.db())
        .write_stdin("start alice\nend alice\nhours alice\nlast ALICE\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("alice 0"))
        .stdout(predicate::str::contains("ALICE 20"));
}

#[test]
fn test_run_flushes_on_eof() {
    let sandbox = Sandbox::new();
    sandbox
        .tally()
        .args(["run", "--db"])
        .arg(sandbox.db())
        .write_stdin("start alice\nend alice\nstart bob\n")
        .assert()
        .success();

    sandbox
        .tally()
        .args(["last", "alice", "--db"])
        .arg(sandbox.db())
        .assert()
        .success()
        .stdout(predicate::str::starts_with("alice 20"));

    // bob was still online at shutdown; his session is stored open.
    sandbox
        .tally()
        .args(["last", "bob", "--db"])
        .arg(sandbox.db())
        .assert()
        .failure();
}

#[test]
fn test_run_skips_bad_lines() {
    let sandbox = Sandbox::new();
    sandbox
        .tally()
        .args(["run", "--db"])
        .arg(sandbox.db())
        .write_stdin("# comment\npause alice\nend nobody\nhours nobody\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("nobody 0"))
        .stderr(predicate::str::contains("unknown command 'pause'"));
}

#[test]
fn test_config_file_sets_database() {
    let sandbox = Sandbox::new();
    let config = sandbox.dir.path().join("custom.toml");
    std::fs::write(
        &config,
        format!("[storage]\npath = {:?}\n", sandbox.db().display().to_string()),
    )
    .unwrap();

    sandbox
        .tally()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .write_stdin("start carol\nend carol\n")
        .assert()
        .success();

    assert!(sandbox.db().is_file());
    sandbox
        .tally()
        .args(["last", "carol", "--db"])
        .arg(sandbox.db())
        .assert()
        .success();
}
