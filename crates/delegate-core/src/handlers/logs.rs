//! Request/reply handler for captured task output.
//!
//! `LogsRequested` is a bus request: the reply carries the task's stdout
//! and stderr tails as JSON. Live tasks answer from the in-memory capture
//! buffer; finished tasks from the persisted row (or its spill file).

use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use delegate_db::queries::outputs;

use crate::capture::{CapturedOutput, OutputCapture};
use crate::error::DelegateError;
use crate::events::{Event, EventBus, Topic};

#[derive(Clone)]
pub struct LogsHandler {
    db: SqlitePool,
    bus: EventBus,
    capture: Arc<OutputCapture>,
}

impl LogsHandler {
    pub fn new(db: SqlitePool, bus: EventBus, capture: Arc<OutputCapture>) -> Self {
        Self { db, bus, capture }
    }

    pub fn register(&self) -> Result<(), DelegateError> {
        let handler = self.clone();
        self.bus
            .subscribe(Topic::LogsRequested, "logs-handler", move |event, replier| {
                let handler = handler.clone();
                Box::pin(async move {
                    let Event::LogsRequested { task_id, tail } = event else {
                        return Ok(());
                    };
                    match handler.lookup(task_id, tail).await {
                        Ok(Some(output)) => replier.respond(serde_json::to_value(&output)?),
                        Ok(None) => replier.respond_error(DelegateError::TaskNotFound(task_id)),
                        Err(e) => replier.respond_error(e),
                    }
                    Ok(())
                })
            })?;
        Ok(())
    }

    async fn lookup(
        &self,
        task_id: Uuid,
        tail: Option<usize>,
    ) -> Result<Option<CapturedOutput>, DelegateError> {
        // Live buffer first: the task may still be running.
        if let Some(output) = self.capture.get_output(task_id, tail) {
            return Ok(Some(output));
        }

        let Some(row) = outputs::get_output(&self.db, task_id).await? else {
            return Ok(None);
        };

        let mut output = if let Some(path) = row.file_path.as_deref() {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                DelegateError::System(anyhow::anyhow!("failed to read spilled output: {e}"))
            })?;
            serde_json::from_str::<CapturedOutput>(&contents)
                .map_err(|e| DelegateError::System(e.into()))?
        } else {
            CapturedOutput {
                task_id,
                stdout: row.stdout.0,
                stderr: row.stderr.0,
                total_size: row.total_size as usize,
                truncated: row.truncated,
            }
        };

        if let Some(n) = tail {
            output.stdout = tail_lines(&output.stdout, n);
            output.stderr = tail_lines(&output.stderr, n);
        }
        Ok(Some(output))
    }
}

fn tail_lines(chunks: &[String], n: usize) -> Vec<String> {
    let joined = chunks.concat();
    let lines: Vec<&str> = joined.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|s| s.to_string()).collect()
}
