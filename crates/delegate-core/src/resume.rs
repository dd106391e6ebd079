//! Resume a terminal task as a new task with an enriched prompt.
//!
//! The new prompt opens with a `PREVIOUS TASK CONTEXT` block assembled
//! from the source task and its latest checkpoint; without a checkpoint a
//! basic-context fallback uses the source task alone. The new task is
//! linked into the resume chain (`parent_task_id` points at the chain
//! root, `retry_of` at the source) and delegated through the normal path.

use std::fmt::Write as _;

use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use delegate_db::models::{Checkpoint, Task};
use delegate_db::queries::{checkpoints, tasks};

use crate::error::DelegateError;
use crate::events::{Event, EventBus};
use crate::handlers::{DelegateRequest, DelegationService, ResumeChain};

#[derive(Clone)]
pub struct ResumeService {
    db: SqlitePool,
    bus: EventBus,
    delegation: DelegationService,
}

impl ResumeService {
    pub fn new(db: SqlitePool, bus: EventBus, delegation: DelegationService) -> Self {
        Self {
            db,
            bus,
            delegation,
        }
    }

    /// Resume `task_id`. The source task must be terminal.
    pub async fn resume(
        &self,
        task_id: Uuid,
        additional_context: Option<String>,
    ) -> Result<Task, DelegateError> {
        let source = tasks::get_task(&self.db, task_id)
            .await?
            .ok_or(DelegateError::TaskNotFound(task_id))?;
        if !source.status.is_terminal() {
            return Err(DelegateError::InvalidOperation(format!(
                "task {task_id} is {}; only terminal tasks can be resumed",
                source.status
            )));
        }

        let checkpoint = checkpoints::find_latest(&self.db, task_id).await?;
        let checkpoint_used = checkpoint.is_some();
        let prompt = build_resume_prompt(&source, checkpoint.as_ref(), additional_context.as_deref());

        let root = source.parent_task_id.unwrap_or(source.id);
        let new_task = self
            .delegation
            .delegate(DelegateRequest {
                prompt,
                priority: source.priority,
                working_directory: source.working_directory.clone(),
                use_worktree: source.use_worktree,
                timeout_ms: source.timeout_ms,
                depends_on: Vec::new(),
                chain: Some(ResumeChain {
                    parent_task_id: root,
                    retry_of: source.id,
                    retry_count: source.retry_count + 1,
                }),
            })
            .await?;

        info!(
            original_task_id = %task_id,
            new_task_id = %new_task.id,
            checkpoint_used,
            "task resumed"
        );
        self.bus
            .emit(Event::TaskResumed {
                original_task_id: task_id,
                new_task_id: new_task.id,
                checkpoint_used,
            })
            .await;

        Ok(new_task)
    }
}

/// Assemble the enriched prompt for a resumed task.
fn build_resume_prompt(
    source: &Task,
    checkpoint: Option<&Checkpoint>,
    additional_context: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("PREVIOUS TASK CONTEXT\n");
    prompt.push_str("=====================\n\n");
    let _ = writeln!(prompt, "Original prompt:\n{}\n", source.prompt);
    let _ = writeln!(prompt, "Final status: {}", source.status);
    if let Some(code) = source.exit_code {
        let _ = writeln!(prompt, "Exit code: {code}");
    }

    if let Some(cp) = checkpoint {
        if let Some(summary) = &cp.output_summary {
            let _ = writeln!(prompt, "\nOutput summary:\n{summary}");
        }
        if let Some(error) = &cp.error_summary {
            let _ = writeln!(prompt, "\nError summary:\n{error}");
        }
        if let Some(branch) = &cp.git_branch {
            let _ = writeln!(prompt, "\nGit branch: {branch}");
        }
        if let Some(sha) = &cp.git_commit_sha {
            let _ = writeln!(prompt, "Git commit: {sha}");
        }
        if let Some(dirty) = &cp.git_dirty_files {
            if !dirty.0.is_empty() {
                let _ = writeln!(prompt, "Dirty files: {}", dirty.0.join(", "));
            }
        }
    }

    if let Some(context) = additional_context {
        let _ = writeln!(prompt, "\nAdditional context:\n{context}");
    }

    prompt.push_str("\nPlease continue or retry the task described above.\n");
    prompt
}
