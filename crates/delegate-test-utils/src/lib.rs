//! Shared test utilities for delegate integration tests.
//!
//! SQLite runs in-process, so every test can have its own private
//! database: either fully in memory (single-connection pool) or as a file
//! in a temp directory when a test exercises concurrent writers.

use std::path::PathBuf;
use std::process::Command;

use sqlx::SqlitePool;
use tempfile::TempDir;

use delegate_db::config::DbConfig;
use delegate_db::pool;

/// An in-memory database with the schema applied.
///
/// Single-connection by construction; fine for everything except tests
/// that need genuinely concurrent writers.
pub async fn create_test_pool() -> SqlitePool {
    pool::create_memory_pool()
        .await
        .expect("failed to create in-memory test database")
}

/// A file-backed database in a fresh temp dir, for tests that need more
/// than one concurrent connection. The `TempDir` guard must be kept alive
/// for the lifetime of the pool.
pub async fn create_file_test_pool() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let pool = pool::create_pool(&DbConfig::new(dir.path().join("tasks.db")))
        .await
        .expect("failed to create file-backed test database");
    (pool, dir)
}

/// Initialise a git repository with one commit in a fresh temp dir.
///
/// Used by checkpoint and resume tests that capture git state.
pub fn create_temp_git_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(&repo_path)
            .output()
            .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    };

    run(&["init", "--initial-branch=main"]);
    run(&["config", "user.email", "test@localhost"]);
    run(&["config", "user.name", "test"]);
    std::fs::write(repo_path.join("README.md"), "# test repo\n").unwrap();
    run(&["add", "-A"]);
    run(&["commit", "-m", "initial"]);

    (dir, repo_path)
}
