//! CLI integration tests for the Memoria command-line interface.
//!
//! These tests verify:
//! - Help text and argument parsing
//! - Store, read and search round trips against a temporary data directory
//! - Exit codes for validation and not-found errors
//!
//! Every test runs with its own config and data directories so nothing
//! touches the user's real memory.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

/// Isolated config and data directories for one test.
struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// A sandbox whose config enables the deterministic mock embedder.
    fn with_mock_embedder() -> Self {
        let sandbox = Self::new();
        std::fs::write(
            sandbox.config_file(),
            r#"
[embedding]
dimensions = 64

[[embedding.providers]]
kind = "mock"

[logging]
file = false
"#,
        )
        .unwrap();
        sandbox
    }

    fn config_file(&self) -> PathBuf {
        self.dir.path().join("memoria-test.toml")
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn config_dir(&self) -> PathBuf {
        self.dir.path().join("config")
    }

    /// A `memoria` command pointed at this sandbox.
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("memoria").unwrap();
        cmd.current_dir(self.dir.path())
            .env("MEMORIA_CONFIG_DIR", self.config_dir())
            .env_remove("MEMORIA_DATA_DIR")
            .env_remove("MEMORIA_CONFIG")
            .env_remove("RUST_LOG")
            .arg("--data-dir")
            .arg(self.data_dir());
        if self.config_file().exists() {
            cmd.arg("--config").arg(self.config_file());
        }
        cmd
    }

    /// Run with `--json` and parse stdout.
    fn json(&self, args: &[&str]) -> Value {
        let output = self.cmd().arg("--json").args(args).output().unwrap();
        assert!(
            output.status.success(),
            "memoria {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }

    fn store(&self, args: &[&str]) -> String {
        let mut full = vec!["store"];
        full.extend_from_slice(args);
        let outcome = self.json(&full);
        outcome["fact"]["id"].as_str().unwrap().to_string()
    }
}

fn memoria() -> Command {
    Command::cargo_bin("memoria").unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_displays() {
    memoria()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("long-term memory"));
}

#[test]
fn test_version_displays() {
    memoria()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("memoria"));
}

#[test]
fn test_help_lists_subcommands() {
    memoria()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("store"))
        .stdout(predicate::str::contains("lookup"))
        .stdout(predicate::str::contains("search"))
        .stdout(predicate::str::contains("traverse"))
        .stdout(predicate::str::contains("consolidate"))
        .stdout(predicate::str::contains("backfill"))
        .stdout(predicate::str::contains("wal"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_store_help_shows_triple_flags() {
    memoria()
        .args(["store", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--entity"))
        .stdout(predicate::str::contains("--decay"))
        .stdout(predicate::str::contains("--supersedes"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument Validation Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_store_requires_text_or_batch() {
    Sandbox::new().cmd().arg("store").assert().code(2);
}

#[test]
fn test_triple_flags_must_come_together() {
    Sandbox::new()
        .cmd()
        .args(["store", "User likes tea", "--entity", "user"])
        .assert()
        .code(2);
}

#[test]
fn test_unknown_decay_class_rejected() {
    Sandbox::new()
        .cmd()
        .args(["store", "hello", "--decay", "forever"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("forever"));
}

#[test]
fn test_get_rejects_malformed_id() {
    Sandbox::new().cmd().args(["get", "not-a-uuid"]).assert().code(2);
}

#[test]
fn test_update_requires_a_field() {
    Sandbox::new()
        .cmd()
        .args(["update", "00000000-0000-4000-8000-000000000000"])
        .assert()
        .code(2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Round Trip Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_store_then_get() {
    let sandbox = Sandbox::new();
    let id = sandbox.store(&["Project deadline is March 1st", "--category", "fact"]);

    let fact = sandbox.json(&["get", &id]);
    assert_eq!(fact["id"], id.as_str());
    assert_eq!(fact["text"], "Project deadline is March 1st");
    assert_eq!(fact["category"], "fact");
    assert!(sandbox.data_dir().exists());
}

#[test]
fn test_store_prints_confirmation() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["store", "User prefers tabs over spaces"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stored"));
}

#[test]
fn test_keyword_search_without_embedder() {
    let sandbox = Sandbox::new();
    sandbox.store(&["The staging database runs on port 5433"]);
    sandbox.store(&["User prefers dark roast coffee"]);

    let results = sandbox.json(&["search", "staging database"]);
    let hits = results["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["fact"]["text"], "The staging database runs on port 5433");
    assert_eq!(hits[0]["source"], "full_text");
    assert_eq!(results["degraded"], false);
}

#[test]
fn test_hybrid_search_with_mock_embedder() {
    let sandbox = Sandbox::with_mock_embedder();
    sandbox.store(&["The staging database runs on port 5433"]);

    let results = sandbox.json(&["search", "The staging database runs on port 5433"]);
    let hits = results["hits"].as_array().unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0]["source"], "both");
}

#[test]
fn test_supersession_through_cli() {
    let sandbox = Sandbox::new();
    let old = sandbox.store(&[
        "User prefers dark mode",
        "--entity",
        "user",
        "--key",
        "theme",
        "--value",
        "dark",
    ]);
    let outcome = sandbox.json(&[
        "store",
        "User prefers light mode",
        "--entity",
        "user",
        "--key",
        "theme",
        "--value",
        "light",
    ]);
    assert_eq!(outcome["action"]["kind"], "superseded");
    assert_eq!(outcome["action"]["previous"][0], old.as_str());

    let current = sandbox.json(&["lookup", "user", "--key", "theme"]);
    assert_eq!(current.as_array().unwrap().len(), 1);
    assert_eq!(current[0]["value"], "light");

    let history = sandbox.json(&[
        "lookup",
        "user",
        "--key",
        "theme",
        "--include-superseded",
        "--order",
        "oldest",
    ]);
    assert_eq!(history.as_array().unwrap().len(), 2);
    assert_eq!(history[0]["value"], "dark");
}

#[test]
fn test_update_and_delete() {
    let sandbox = Sandbox::new();
    let id = sandbox.store(&["Standup is at 9am"]);

    let updated = sandbox.json(&[
        "update",
        &id,
        "--text",
        "Standup is at 10am",
        "--tags",
        "team,meetings",
    ]);
    assert_eq!(updated["text"], "Standup is at 10am");
    assert_eq!(updated["tags"][1], "meetings");

    sandbox.cmd().args(["delete", &id]).assert().success();
    sandbox.cmd().args(["get", &id]).assert().code(3);
}

#[test]
fn test_link_and_traverse() {
    let sandbox = Sandbox::new();
    let a = sandbox.store(&["Service A calls service B"]);
    let b = sandbox.store(&["Service B owns the billing table"]);

    sandbox
        .cmd()
        .args(["link", &a, &b, "--type", "depends_on", "--strength", "0.8"])
        .assert()
        .success();

    let hits = sandbox.json(&["traverse", &a]);
    assert_eq!(hits.as_array().unwrap().len(), 1);
    assert_eq!(hits[0]["factId"], b.as_str());
    assert_eq!(hits[0]["linkType"], "depends_on");

    let removed = sandbox.json(&["unlink", &a, &b]);
    assert_eq!(removed["removed"], 1);
}

#[test]
fn test_batch_store() {
    let sandbox = Sandbox::new();
    let batch = sandbox.dir.path().join("facts.jsonl");
    std::fs::write(
        &batch,
        concat!(
            r#"{"text": "Alice leads the platform team", "category": "entity"}"#,
            "\n",
            r#"{"text": "Releases ship on Tuesdays", "decayClass": "permanent"}"#,
            "\n",
        ),
    )
    .unwrap();

    let outcomes = sandbox.json(&["store", "--batch", batch.to_str().unwrap()]);
    assert_eq!(outcomes.as_array().unwrap().len(), 2);

    let stats = sandbox.json(&["stats"]);
    assert_eq!(stats["store"]["facts"], 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Exit Code Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_get_unknown_id_exits_not_found() {
    Sandbox::new()
        .cmd()
        .args(["get", "00000000-0000-4000-8000-000000000000"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_empty_text_exits_validation() {
    Sandbox::new()
        .cmd()
        .args(["store", "   "])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("empty"));
}

#[test]
fn test_importance_out_of_range_exits_validation() {
    Sandbox::new()
        .cmd()
        .args(["store", "Something", "--importance", "1.5"])
        .assert()
        .code(2);
}

#[test]
fn test_traverse_depth_over_cap_exits_validation() {
    let sandbox = Sandbox::new();
    let id = sandbox.store(&["Lonely fact"]);
    sandbox
        .cmd()
        .args(["traverse", &id, "--depth", "99"])
        .assert()
        .code(2);
}

#[test]
fn test_malformed_config_exits_validation() {
    let sandbox = Sandbox::new();
    std::fs::write(sandbox.config_file(), "[search]\nno_such_key = 1\n").unwrap();
    sandbox.cmd().arg("stats").assert().code(2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Maintenance Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_stats_on_empty_store() {
    let stats = Sandbox::new().json(&["stats"]);
    assert_eq!(stats["store"]["facts"], 0);
    assert_eq!(stats["walPending"], 0);
}

#[test]
fn test_wal_status_and_compact() {
    let sandbox = Sandbox::new();
    sandbox.store(&["Written through the log"]);

    let status = sandbox.json(&["wal", "status"]);
    assert_eq!(status["pending"], 0);

    let report = sandbox.json(&["wal", "compact"]);
    assert_eq!(report["kept"], 0);
}

#[test]
fn test_prune_reports_counts() {
    let report = Sandbox::new().json(&["prune", "--mode", "hard"]);
    assert_eq!(report["expired"], 0);
}

#[test]
fn test_backfill_without_embedder_exits_validation() {
    Sandbox::new().cmd().arg("backfill").assert().code(2);
}

#[test]
fn test_backfill_embeds_facts_stored_text_only() {
    let sandbox = Sandbox::new();
    sandbox.store(&["Stored before embeddings were configured"]);

    std::fs::write(
        sandbox.config_file(),
        "[embedding]\ndimensions = 64\n\n[[embedding.providers]]\nkind = \"mock\"\n",
    )
    .unwrap();
    let report = sandbox.json(&["backfill", "--rebuild"]);
    assert_eq!(report["embedded"], 1);
    assert_eq!(report["rebuilt"], true);
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_init_writes_user_file() {
    let sandbox = Sandbox::new();
    sandbox.cmd().args(["config", "init"]).assert().success();
    assert!(sandbox.config_dir().join("config.toml").exists());

    // A second init without --force refuses to overwrite
    sandbox.cmd().args(["config", "init"]).assert().failure();
    sandbox
        .cmd()
        .args(["config", "init", "--force"])
        .assert()
        .success();
}

#[test]
fn test_config_path_reports_data_dir() {
    let sandbox = Sandbox::new();
    let paths = sandbox.json(&["config", "path"]);
    assert_eq!(
        paths["dataDir"],
        sandbox.data_dir().to_string_lossy().as_ref()
    );
}

#[test]
fn test_config_show_emits_toml() {
    Sandbox::new()
        .cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[search]"));
}
