//! Writes a checkpoint row at every task terminal event.
//!
//! A checkpoint summarises the tail of the task's stdout, the last error
//! message, and -- when the working directory is a git repository -- the
//! branch, HEAD sha, and dirty-file list. Git state is captured with
//! argv-style process invocation only; branch and path names never pass
//! through a shell.

use std::path::Path;

use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use delegate_db::models::{CheckpointType, NewCheckpoint};
use delegate_db::queries::{checkpoints, outputs, tasks};

use crate::error::DelegateError;
use crate::events::{Event, EventBus, Topic};

/// Lines of stdout kept in the checkpoint's output summary.
const SUMMARY_LINES: usize = 20;

/// Git state of a working directory at checkpoint time.
#[derive(Debug, Clone, Default)]
pub struct GitState {
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub dirty_files: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct CheckpointHandler {
    db: SqlitePool,
    bus: EventBus,
}

impl CheckpointHandler {
    pub fn new(db: SqlitePool, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Subscribe to all four terminal topics.
    pub fn register(&self) -> Result<(), DelegateError> {
        for topic in Topic::TASK_TERMINAL {
            let handler = self.clone();
            self.bus.subscribe(topic, "checkpoint-handler", move |event, _replier| {
                let handler = handler.clone();
                Box::pin(async move {
                    handler.on_terminal(&event).await?;
                    Ok(())
                })
            })?;
        }
        Ok(())
    }

    async fn on_terminal(&self, event: &Event) -> anyhow::Result<()> {
        let (task_id, checkpoint_type, error_summary) = match event {
            Event::TaskCompleted { task_id, .. } => (*task_id, CheckpointType::Completed, None),
            Event::TaskFailed { task_id, error } => {
                (*task_id, CheckpointType::Failed, Some(error.clone()))
            }
            Event::TaskTimeout {
                task_id,
                timeout_ms,
            } => (
                *task_id,
                CheckpointType::Timeout,
                Some(format!("timed out after {timeout_ms} ms")),
            ),
            Event::TaskCancelled { task_id } => (*task_id, CheckpointType::Cancelled, None),
            _ => return Ok(()),
        };

        let checkpoint = self
            .record(task_id, checkpoint_type, error_summary)
            .await?;
        self.bus
            .emit(Event::CheckpointCreated {
                checkpoint_id: checkpoint,
                task_id,
            })
            .await;
        Ok(())
    }

    /// Build and insert one checkpoint; returns its id.
    pub async fn record(
        &self,
        task_id: Uuid,
        checkpoint_type: CheckpointType,
        error_summary: Option<String>,
    ) -> anyhow::Result<Uuid> {
        let task = tasks::get_task(&self.db, task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;

        let output_summary = match outputs::get_output(&self.db, task_id).await {
            Ok(Some(output)) if output.file_path.is_none() => {
                let tail = tail_lines(&output.stdout.0, SUMMARY_LINES);
                (!tail.is_empty()).then(|| tail.join("\n"))
            }
            Ok(Some(output)) => output
                .file_path
                .as_deref()
                .and_then(|p| read_spilled_tail(p, SUMMARY_LINES)),
            Ok(None) => None,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to load output for checkpoint");
                None
            }
        };

        let git = git_snapshot(Path::new(&task.working_directory)).await;
        let checkpoint = checkpoints::insert_checkpoint(
            &self.db,
            task_id,
            checkpoint_type,
            &NewCheckpoint {
                output_summary,
                error_summary,
                git_branch: git.branch,
                git_commit_sha: git.commit_sha,
                git_dirty_files: git.dirty_files,
            },
        )
        .await?;

        debug!(
            task_id = %task_id,
            checkpoint_id = %checkpoint.id,
            checkpoint_type = %checkpoint_type,
            "checkpoint recorded"
        );
        Ok(checkpoint.id)
    }
}

fn tail_lines(chunks: &[String], n: usize) -> Vec<String> {
    let joined = chunks.concat();
    let lines: Vec<&str> = joined.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|s| s.to_string()).collect()
}

fn read_spilled_tail(path: &str, n: usize) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let parsed: crate::capture::CapturedOutput = serde_json::from_str(&contents).ok()?;
    let tail = tail_lines(&parsed.stdout, n);
    (!tail.is_empty()).then(|| tail.join("\n"))
}

/// Capture git state for a directory.
///
/// Non-git directories (or missing git) yield all-null fields, no error.
pub async fn git_snapshot(dir: &Path) -> GitState {
    async fn git(dir: &Path, args: &[&str]) -> Option<String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    if !dir.is_dir() {
        return GitState::default();
    }

    let Some(branch) = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await else {
        return GitState::default();
    };
    let commit_sha = git(dir, &["rev-parse", "HEAD"]).await;
    let dirty_files = git(dir, &["status", "--porcelain"]).await.map(|out| {
        out.lines()
            .filter_map(|line| line.get(3..).map(str::to_string))
            .collect::<Vec<_>>()
    });

    GitState {
        branch: Some(branch),
        commit_sha,
        dirty_files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_lines_takes_last_n() {
        let chunks = vec!["a\nb\n".to_string(), "c\nd\n".to_string()];
        assert_eq!(tail_lines(&chunks, 2), vec!["c", "d"]);
        assert_eq!(tail_lines(&chunks, 10).len(), 4);
    }

    #[tokio::test]
    async fn git_snapshot_of_non_git_dir_is_all_null() {
        let tmp = tempfile::tempdir().unwrap();
        let state = git_snapshot(tmp.path()).await;
        assert!(state.branch.is_none());
        assert!(state.commit_sha.is_none());
        assert!(state.dirty_files.is_none());
    }

    #[tokio::test]
    async fn git_snapshot_of_missing_dir_is_all_null() {
        let state = git_snapshot(Path::new("/definitely/not/a/dir")).await;
        assert!(state.branch.is_none());
    }
}
