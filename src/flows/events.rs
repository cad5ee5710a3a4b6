use chrono::{DateTime, Utc};
use serde::Serialize;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub flow_id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: RunEventType,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStarted,
    RunCompleted,
    RunFailed,
}

impl RunEventType {
    pub fn as_sse_event(&self) -> &'static str {
        match self {
            RunEventType::RunStarted => "run_started",
            RunEventType::RunCompleted => "run_completed",
            RunEventType::RunFailed => "run_failed",
        }
    }
}
