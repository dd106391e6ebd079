//! Event topics and tagged payloads.
//!
//! Events are an enumerated set of variants with explicit payload fields,
//! dispatched by topic. Handlers register against a single topic and
//! receive the whole [`Event`] value.

pub mod bus;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use delegate_db::models::{Schedule, ScheduleStatus, Task};

pub use bus::{EventBus, Replier, SubscriptionHandle};

/// Which output stream a captured chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

// ---------------------------------------------------------------------------

/// Every topic the bus dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    TaskDelegated,
    TaskQueued,
    TaskUnblocked,
    WorkerSpawned,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskTimeout,
    TaskResumed,
    CheckpointCreated,
    OutputCaptured,
    LogsRequested,
    ScheduleCreated,
    ScheduleTriggered,
    ScheduleExecuted,
    SchedulePaused,
    ScheduleResumed,
    ScheduleCancelled,
    ScheduleUpdated,
    ScheduleQuery,
    ScheduleQueryResponse,
    ShutdownInitiated,
    WorkersTerminating,
    DatabaseClosing,
}

impl Topic {
    /// The four topics that mark a task's terminal event.
    pub const TASK_TERMINAL: [Topic; 4] = [
        Topic::TaskCompleted,
        Topic::TaskFailed,
        Topic::TaskCancelled,
        Topic::TaskTimeout,
    ];
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskDelegated => "TaskDelegated",
            Self::TaskQueued => "TaskQueued",
            Self::TaskUnblocked => "TaskUnblocked",
            Self::WorkerSpawned => "WorkerSpawned",
            Self::TaskCompleted => "TaskCompleted",
            Self::TaskFailed => "TaskFailed",
            Self::TaskCancelled => "TaskCancelled",
            Self::TaskTimeout => "TaskTimeout",
            Self::TaskResumed => "TaskResumed",
            Self::CheckpointCreated => "CheckpointCreated",
            Self::OutputCaptured => "OutputCaptured",
            Self::LogsRequested => "LogsRequested",
            Self::ScheduleCreated => "ScheduleCreated",
            Self::ScheduleTriggered => "ScheduleTriggered",
            Self::ScheduleExecuted => "ScheduleExecuted",
            Self::SchedulePaused => "SchedulePaused",
            Self::ScheduleResumed => "ScheduleResumed",
            Self::ScheduleCancelled => "ScheduleCancelled",
            Self::ScheduleUpdated => "ScheduleUpdated",
            Self::ScheduleQuery => "ScheduleQuery",
            Self::ScheduleQueryResponse => "ScheduleQueryResponse",
            Self::ShutdownInitiated => "ShutdownInitiated",
            Self::WorkersTerminating => "WorkersTerminating",
            Self::DatabaseClosing => "DatabaseClosing",
        };
        f.write_str(s)
    }
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TaskDelegated" => Ok(Self::TaskDelegated),
            "TaskQueued" => Ok(Self::TaskQueued),
            "TaskUnblocked" => Ok(Self::TaskUnblocked),
            "WorkerSpawned" => Ok(Self::WorkerSpawned),
            "TaskCompleted" => Ok(Self::TaskCompleted),
            "TaskFailed" => Ok(Self::TaskFailed),
            "TaskCancelled" => Ok(Self::TaskCancelled),
            "TaskTimeout" => Ok(Self::TaskTimeout),
            "TaskResumed" => Ok(Self::TaskResumed),
            "CheckpointCreated" => Ok(Self::CheckpointCreated),
            "OutputCaptured" => Ok(Self::OutputCaptured),
            "LogsRequested" => Ok(Self::LogsRequested),
            "ScheduleCreated" => Ok(Self::ScheduleCreated),
            "ScheduleTriggered" => Ok(Self::ScheduleTriggered),
            "ScheduleExecuted" => Ok(Self::ScheduleExecuted),
            "SchedulePaused" => Ok(Self::SchedulePaused),
            "ScheduleResumed" => Ok(Self::ScheduleResumed),
            "ScheduleCancelled" => Ok(Self::ScheduleCancelled),
            "ScheduleUpdated" => Ok(Self::ScheduleUpdated),
            "ScheduleQuery" => Ok(Self::ScheduleQuery),
            "ScheduleQueryResponse" => Ok(Self::ScheduleQueryResponse),
            "ShutdownInitiated" => Ok(Self::ShutdownInitiated),
            "WorkersTerminating" => Ok(Self::WorkersTerminating),
            "DatabaseClosing" => Ok(Self::DatabaseClosing),
            other => Err(TopicParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Topic`] string.
#[derive(Debug, Clone)]
pub struct TopicParseError(pub String);

impl fmt::Display for TopicParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid topic: {:?}", self.0)
    }
}

impl std::error::Error for TopicParseError {}

// ---------------------------------------------------------------------------

/// A tagged event with an explicit payload.
#[derive(Debug, Clone)]
pub enum Event {
    TaskDelegated {
        task: Task,
    },
    TaskQueued {
        task_id: Uuid,
    },
    TaskUnblocked {
        task_id: Uuid,
    },
    WorkerSpawned {
        worker_id: Uuid,
        task_id: Uuid,
    },
    TaskCompleted {
        task_id: Uuid,
        exit_code: i64,
        duration_ms: i64,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    TaskTimeout {
        task_id: Uuid,
        timeout_ms: i64,
    },
    TaskResumed {
        original_task_id: Uuid,
        new_task_id: Uuid,
        checkpoint_used: bool,
    },
    CheckpointCreated {
        checkpoint_id: Uuid,
        task_id: Uuid,
    },
    OutputCaptured {
        task_id: Uuid,
        stream: OutputStream,
        bytes: usize,
    },
    LogsRequested {
        task_id: Uuid,
        tail: Option<usize>,
    },
    ScheduleCreated {
        schedule_id: Uuid,
    },
    ScheduleTriggered {
        schedule_id: Uuid,
        triggered_at: DateTime<Utc>,
        scheduled_for: DateTime<Utc>,
    },
    ScheduleExecuted {
        schedule_id: Uuid,
        task_id: Option<Uuid>,
    },
    SchedulePaused {
        schedule_id: Uuid,
    },
    ScheduleResumed {
        schedule_id: Uuid,
    },
    ScheduleCancelled {
        schedule_id: Uuid,
    },
    ScheduleUpdated {
        schedule_id: Uuid,
    },
    ScheduleQuery {
        status: Option<ScheduleStatus>,
    },
    ScheduleQueryResponse {
        schedules: Vec<Schedule>,
    },
    ShutdownInitiated,
    WorkersTerminating {
        count: usize,
    },
    DatabaseClosing,
}

impl Event {
    /// The topic this event dispatches on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::TaskDelegated { .. } => Topic::TaskDelegated,
            Self::TaskQueued { .. } => Topic::TaskQueued,
            Self::TaskUnblocked { .. } => Topic::TaskUnblocked,
            Self::WorkerSpawned { .. } => Topic::WorkerSpawned,
            Self::TaskCompleted { .. } => Topic::TaskCompleted,
            Self::TaskFailed { .. } => Topic::TaskFailed,
            Self::TaskCancelled { .. } => Topic::TaskCancelled,
            Self::TaskTimeout { .. } => Topic::TaskTimeout,
            Self::TaskResumed { .. } => Topic::TaskResumed,
            Self::CheckpointCreated { .. } => Topic::CheckpointCreated,
            Self::OutputCaptured { .. } => Topic::OutputCaptured,
            Self::LogsRequested { .. } => Topic::LogsRequested,
            Self::ScheduleCreated { .. } => Topic::ScheduleCreated,
            Self::ScheduleTriggered { .. } => Topic::ScheduleTriggered,
            Self::ScheduleExecuted { .. } => Topic::ScheduleExecuted,
            Self::SchedulePaused { .. } => Topic::SchedulePaused,
            Self::ScheduleResumed { .. } => Topic::ScheduleResumed,
            Self::ScheduleCancelled { .. } => Topic::ScheduleCancelled,
            Self::ScheduleUpdated { .. } => Topic::ScheduleUpdated,
            Self::ScheduleQuery { .. } => Topic::ScheduleQuery,
            Self::ScheduleQueryResponse { .. } => Topic::ScheduleQueryResponse,
            Self::ShutdownInitiated => Topic::ShutdownInitiated,
            Self::WorkersTerminating { .. } => Topic::WorkersTerminating,
            Self::DatabaseClosing => Topic::DatabaseClosing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_display_roundtrip() {
        let topics = [
            Topic::TaskDelegated,
            Topic::TaskQueued,
            Topic::WorkerSpawned,
            Topic::TaskCompleted,
            Topic::ScheduleTriggered,
            Topic::ShutdownInitiated,
            Topic::DatabaseClosing,
        ];
        for t in &topics {
            let parsed: Topic = t.to_string().parse().expect("should parse");
            assert_eq!(*t, parsed);
        }
    }

    #[test]
    fn topic_invalid() {
        assert!("NotATopic".parse::<Topic>().is_err());
    }

    #[test]
    fn event_topic_matches_variant() {
        let id = Uuid::new_v4();
        assert_eq!(Event::TaskQueued { task_id: id }.topic(), Topic::TaskQueued);
        assert_eq!(
            Event::TaskCompleted {
                task_id: id,
                exit_code: 0,
                duration_ms: 10
            }
            .topic(),
            Topic::TaskCompleted
        );
        assert_eq!(Event::ShutdownInitiated.topic(), Topic::ShutdownInitiated);
    }
}
