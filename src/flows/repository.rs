use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Flow;
use super::history::{Execution, RunOutcome, RunTrigger};

/// Returned (wrapped in `anyhow::Error`) when a create or rename collides
/// with an existing flow name.
#[derive(thiserror::Error, Debug)]
#[error("a flow named '{0}' already exists")]
pub struct DuplicateFlowName(pub String);

/// Result of the atomic "mark flow running + create execution" step.
#[derive(Debug)]
pub enum BeginOutcome {
    Started { flow: Flow, execution: Execution },
    FlowNotFound,
    /// The flow is already `RUNNING`; nothing was written.
    AlreadyRunning(Flow),
}

#[async_trait]
pub trait FlowRepository: Send + Sync {
    // Flows
    async fn list_flows(&self) -> Result<Vec<Flow>>;
    async fn get_flow(&self, id: &str) -> Result<Option<Flow>>;
    async fn create_flow(&self, flow: Flow) -> Result<()>;
    /// Inserts or updates the flow's definition. On update, `next_run` is only
    /// replaced when the schedule changed, and `status` and `last_run` are
    /// left alone; they belong to the scheduler and the run lifecycle.
    async fn save_flow(&self, flow: Flow) -> Result<()>;
    /// Removes the flow only; its executions are kept for audit.
    async fn delete_flow(&self, id: &str) -> Result<bool>;

    // Scheduling
    async fn due_flows(&self, now: DateTime<Utc>) -> Result<Vec<Flow>>;
    async fn set_next_run(&self, flow_id: &str, next_run: Option<DateTime<Utc>>) -> Result<()>;

    // Executions
    async fn begin_execution(
        &self,
        flow_id: &str,
        trigger: RunTrigger,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome>;
    /// Writes the terminal state of a `RUNNING` execution, its tasks and the
    /// parent flow's status. Returns `false` without writing anything when
    /// the execution is missing or already terminal.
    async fn finish_execution(&self, execution_id: &str, outcome: &RunOutcome) -> Result<bool>;
    async fn get_execution(&self, id: &str) -> Result<Option<Execution>>;
    async fn list_executions(&self, limit: usize) -> Result<Vec<Execution>>;
    async fn list_flow_executions(&self, flow_id: &str, limit: usize) -> Result<Vec<Execution>>;
    async fn delete_execution(&self, id: &str) -> Result<bool>;

    // Lifecycle
    /// Fails every execution still marked `RUNNING` (and flows stuck in
    /// `RUNNING`). Only valid at startup, before any run is launched.
    async fn recover_interrupted(&self, now: DateTime<Utc>, message: &str) -> Result<usize>;
}
