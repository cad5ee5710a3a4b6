use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Flow;

pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Lifecycle state shared by flows, executions and reported tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "running")]
    Running,
    #[serde(alias = "completed")]
    Completed,
    #[serde(alias = "failed")]
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    /// Unknown values read back from storage degrade to `Pending`.
    pub fn from_db(value: &str) -> Self {
        match value {
            "RUNNING" => RunStatus::Running,
            "COMPLETED" => RunStatus::Completed,
            "FAILED" => RunStatus::Failed,
            _ => RunStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Scheduled => "scheduled",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "scheduled" => RunTrigger::Scheduled,
            _ => RunTrigger::Manual,
        }
    }
}

/// One run of a flow. `flow_name` is a snapshot taken at launch so the
/// record stays readable after the flow is renamed or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub flow_id: String,
    pub flow_name: String,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskExecution>,
}

impl Execution {
    pub fn running(flow: &Flow, trigger: RunTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flow_id: flow.id.clone(),
            flow_name: flow.name.clone(),
            trigger,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            output: None,
            error_message: None,
            tasks: vec![],
        }
    }
}

/// A sub-result reported by the executable through its result file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub execution_id: String,
    pub task_id: String,
    pub name: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Terminal state to write for an execution.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub tasks: Vec<TaskExecution>,
}

impl RunOutcome {
    pub fn completed(output: String, tasks: Vec<TaskExecution>) -> Self {
        Self {
            status: RunStatus::Completed,
            completed_at: Utc::now(),
            output: Some(output),
            error_message: None,
            tasks,
        }
    }

    pub fn failed(error_message: impl Into<String>, output: Option<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            completed_at: Utc::now(),
            output: output.filter(|o| !o.is_empty()),
            error_message: Some(error_message.into()),
            tasks: vec![],
        }
    }
}
