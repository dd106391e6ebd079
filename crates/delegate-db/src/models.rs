use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Priority of a task. `P0` is the highest and is dequeued first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    P0,
    P1,
    P2,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::P0 => "p0",
            Self::P1 => "p1",
            Self::P2 => "p2",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p0" | "P0" => Ok(Self::P0),
            "p1" | "P1" => Ok(Self::P1),
            "p2" | "P2" => Ok(Self::P2),
            other => Err(TaskPriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPriority`] string.
#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `completed`, `failed`, `cancelled`, and `timeout` are terminal and sticky:
/// no repository operation transitions a task out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Blocked,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    /// Whether this status is terminal (no transitions out).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "blocked" => Ok(Self::Blocked),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Terminal decision on a dependency edge.
///
/// Resolution is monotonic: `pending` moves to exactly one of the terminal
/// values and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DependencyResolution {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for DependencyResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for DependencyResolution {
    type Err = DependencyResolutionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DependencyResolutionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DependencyResolution`] string.
#[derive(Debug, Clone)]
pub struct DependencyResolutionParseError(pub String);

impl fmt::Display for DependencyResolutionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid dependency resolution: {:?}", self.0)
    }
}

impl std::error::Error for DependencyResolutionParseError {}

// ---------------------------------------------------------------------------

/// Kind of schedule: recurring cron or a single future firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Cron,
    OneTime,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cron => "cron",
            Self::OneTime => "one_time",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleType {
    type Err = ScheduleTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(Self::Cron),
            "one_time" => Ok(Self::OneTime),
            other => Err(ScheduleTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScheduleType`] string.
#[derive(Debug, Clone)]
pub struct ScheduleTypeParseError(pub String);

impl fmt::Display for ScheduleTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule type: {:?}", self.0)
    }
}

impl std::error::Error for ScheduleTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a schedule.
///
/// `next_run_at` is non-null only while the schedule is `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
    Expired,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleStatus {
    type Err = ScheduleStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            other => Err(ScheduleStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScheduleStatus`] string.
#[derive(Debug, Clone)]
pub struct ScheduleStatusParseError(pub String);

impl fmt::Display for ScheduleStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule status: {:?}", self.0)
    }
}

impl std::error::Error for ScheduleStatusParseError {}

// ---------------------------------------------------------------------------

/// Behaviour applied when a schedule's `next_run_at` was already in the past
/// at tick time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MissedRunPolicy {
    Skip,
    Catchup,
    Fail,
}

impl fmt::Display for MissedRunPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skip => "skip",
            Self::Catchup => "catchup",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

impl FromStr for MissedRunPolicy {
    type Err = MissedRunPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "catchup" => Ok(Self::Catchup),
            "fail" => Ok(Self::Fail),
            other => Err(MissedRunPolicyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MissedRunPolicy`] string.
#[derive(Debug, Clone)]
pub struct MissedRunPolicyParseError(pub String);

impl fmt::Display for MissedRunPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid missed-run policy: {:?}", self.0)
    }
}

impl std::error::Error for MissedRunPolicyParseError {}

// ---------------------------------------------------------------------------

/// Outcome recorded for a single schedule firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Triggered,
    Skipped,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Triggered => "triggered",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triggered" => Ok(Self::Triggered),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------

/// Terminal event that produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointType {
    type Err = CheckpointTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(CheckpointTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CheckpointType`] string.
#[derive(Debug, Clone)]
pub struct CheckpointTypeParseError(pub String);

impl fmt::Display for CheckpointTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid checkpoint type: {:?}", self.0)
    }
}

impl std::error::Error for CheckpointTypeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- one unit of prompt-driven work executed by a subprocess worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub prompt: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub working_directory: String,
    pub use_worktree: bool,
    pub timeout_ms: Option<i64>,
    pub worker_id: Option<Uuid>,
    pub exit_code: Option<i64>,
    /// Root of the resume chain this task belongs to, if any.
    pub parent_task_id: Option<Uuid>,
    /// Immediate predecessor in the resume chain, if any.
    pub retry_of: Option<Uuid>,
    pub retry_count: i64,
    /// Number of times a worker has been spawned for this task.
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub prompt: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub working_directory: String,
    pub use_worktree: bool,
    pub timeout_ms: Option<i64>,
    pub parent_task_id: Option<Uuid>,
    pub retry_of: Option<Uuid>,
    pub retry_count: i64,
}

impl NewTask {
    /// A fresh queued task with default priority for the given prompt.
    pub fn new(prompt: impl Into<String>, working_directory: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            priority: TaskPriority::P1,
            status: TaskStatus::Queued,
            working_directory: working_directory.into(),
            use_worktree: false,
            timeout_ms: None,
            parent_task_id: None,
            retry_of: None,
            retry_count: 0,
        }
    }
}

/// Captured output for a task, split by stream.
///
/// When `file_path` is set the chunk arrays are empty and the full content
/// lives in the referenced JSON file on disk.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskOutput {
    pub task_id: Uuid,
    pub stdout: Json<Vec<String>>,
    pub stderr: Json<Vec<String>>,
    pub total_size: i64,
    pub truncated: bool,
    pub file_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// An edge in the dependency DAG: `task_id` must not run until
/// `depends_on_task_id` is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub id: i64,
    pub task_id: Uuid,
    pub depends_on_task_id: Uuid,
    pub resolution: DependencyResolution,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Everything needed to materialise a task from a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub prompt: String,
    pub working_directory: String,
    #[serde(default)]
    pub use_worktree: bool,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
}

/// A schedule -- a rule that periodically materialises a task from its
/// template.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Schedule {
    pub id: Uuid,
    pub schedule_type: ScheduleType,
    /// 5-field cron expression; present only for `cron` schedules.
    pub cron_expression: Option<String>,
    /// Firing instant; present only for `one_time` schedules.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// IANA timezone name, e.g. "UTC" or "Europe/Warsaw".
    pub timezone: String,
    pub status: ScheduleStatus,
    pub missed_run_policy: MissedRunPolicy,
    pub task_template: Json<TaskTemplate>,
    pub priority: TaskPriority,
    pub max_runs: Option<i64>,
    pub run_count: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Audit record for one schedule firing decision.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduleExecution {
    pub id: i64,
    pub schedule_id: Uuid,
    pub task_id: Option<Uuid>,
    pub scheduled_for: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persistent snapshot written at a task's terminal event.
///
/// Immutable once written. "Latest" lookups order by
/// `created_at DESC, id DESC`; the id column only breaks exact-timestamp
/// ties deterministically.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: Uuid,
    pub checkpoint_type: CheckpointType,
    pub output_summary: Option<String>,
    pub error_summary: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit_sha: Option<String>,
    pub git_dirty_files: Option<Json<Vec<String>>>,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a new checkpoint.
#[derive(Debug, Clone, Default)]
pub struct NewCheckpoint {
    pub output_summary: Option<String>,
    pub error_summary: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit_sha: Option<String>,
    pub git_dirty_files: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_priority_display_roundtrip() {
        let variants = [TaskPriority::P0, TaskPriority::P1, TaskPriority::P2];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskPriority = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_priority_orders_p0_first() {
        assert!(TaskPriority::P0 < TaskPriority::P1);
        assert!(TaskPriority::P1 < TaskPriority::P2);
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::Blocked,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_terminal_set() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn dependency_resolution_display_roundtrip() {
        let variants = [
            DependencyResolution::Pending,
            DependencyResolution::Completed,
            DependencyResolution::Failed,
            DependencyResolution::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: DependencyResolution = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn schedule_type_display_roundtrip() {
        for v in &[ScheduleType::Cron, ScheduleType::OneTime] {
            let parsed: ScheduleType = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn schedule_status_display_roundtrip() {
        let variants = [
            ScheduleStatus::Active,
            ScheduleStatus::Paused,
            ScheduleStatus::Cancelled,
            ScheduleStatus::Completed,
            ScheduleStatus::Expired,
        ];
        for v in &variants {
            let parsed: ScheduleStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn missed_run_policy_display_roundtrip() {
        let variants = [
            MissedRunPolicy::Skip,
            MissedRunPolicy::Catchup,
            MissedRunPolicy::Fail,
        ];
        for v in &variants {
            let parsed: MissedRunPolicy = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn execution_status_invalid() {
        assert!("retried".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn checkpoint_type_display_roundtrip() {
        let variants = [
            CheckpointType::Completed,
            CheckpointType::Failed,
            CheckpointType::Cancelled,
            CheckpointType::Timeout,
        ];
        for v in &variants {
            let parsed: CheckpointType = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_template_json_roundtrip() {
        let template = TaskTemplate {
            prompt: "run the nightly report".to_string(),
            working_directory: "/srv/reports".to_string(),
            use_worktree: true,
            timeout_ms: Some(60_000),
        };
        let json = serde_json::to_string(&template).unwrap();
        let back: TaskTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(template, back);
    }

    #[test]
    fn new_task_defaults() {
        let t = NewTask::new("do a thing", "/tmp");
        assert_eq!(t.priority, TaskPriority::P1);
        assert_eq!(t.status, TaskStatus::Queued);
        assert_eq!(t.retry_count, 0);
        assert!(t.parent_task_id.is_none());
    }
}
