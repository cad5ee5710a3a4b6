use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::Flow;
use super::collector::{self, ReportedTask};
use super::events::{RunEvent, RunEventType};
use super::history::{Execution, RunOutcome, RunStatus, RunTrigger, TaskExecution};
use super::process::{ProcessOutcome, ProcessRunner};
use super::repository::{BeginOutcome, FlowRepository};

const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_BACKOFF: Duration = Duration::from_millis(250);

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("flow '{0}' is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Starts runs and drives each one to a terminal state in its own task.
#[derive(Clone)]
pub struct FlowRunner {
    store: Arc<dyn FlowRepository>,
    process: Arc<ProcessRunner>,
    scratch_dir: PathBuf,
    events_tx: Option<broadcast::Sender<RunEvent>>,
    in_flight: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl FlowRunner {
    pub fn new(
        store: Arc<dyn FlowRepository>,
        process: Arc<ProcessRunner>,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            process,
            scratch_dir,
            events_tx: None,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_events(mut self, tx: broadcast::Sender<RunEvent>) -> Self {
        self.events_tx = Some(tx);
        self
    }

    /// Mark the flow running, record a new execution and launch the
    /// executable in the background. Returns as soon as the execution is
    /// persisted; the run itself is not awaited.
    pub async fn start(&self, flow_id: &str, trigger: RunTrigger) -> Result<Execution, RunError> {
        let (flow, execution) = match self
            .store
            .begin_execution(flow_id, trigger, Utc::now())
            .await?
        {
            BeginOutcome::Started { flow, execution } => (flow, execution),
            BeginOutcome::FlowNotFound => return Err(RunError::FlowNotFound(flow_id.to_string())),
            BeginOutcome::AlreadyRunning(flow) => return Err(RunError::AlreadyRunning(flow.name)),
        };

        tracing::info!(
            flow = %flow.name,
            execution_id = %execution.id,
            trigger = trigger.as_str(),
            "Run started"
        );
        self.emit(
            &execution,
            RunEventType::RunStarted,
            format!("{} run started", trigger.as_str()),
        );

        let runner = self.clone();
        let spawned = execution.clone();
        let handle = tokio::spawn(async move {
            runner.run_to_completion(flow, spawned).await;
        });

        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|_, h| !h.is_finished());
        in_flight.insert(execution.id.clone(), handle);

        Ok(execution)
    }

    /// Execution ids whose background task has not finished yet.
    pub async fn active_runs(&self) -> Vec<String> {
        let in_flight = self.in_flight.lock().await;
        in_flight
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Wait for every run started so far (and any they race with) to finalize.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut in_flight = self.in_flight.lock().await;
                in_flight.drain().map(|(_, h)| h).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    pub fn result_path(&self, execution_id: &str) -> PathBuf {
        self.scratch_dir.join(format!("flow_{execution_id}.json"))
    }

    async fn run_to_completion(&self, flow: Flow, execution: Execution) {
        let result_path = self.result_path(&execution.id);
        let args = vec![
            "--flow-name".to_string(),
            flow.name.clone(),
            "--description".to_string(),
            flow.description.clone().unwrap_or_default(),
            "--output".to_string(),
            result_path.to_string_lossy().into_owned(),
        ];

        let outcome = self
            .process
            .launch(Path::new(&flow.binary_path), &args)
            .await;
        let outcome = self.settle(&execution.id, outcome, &result_path).await;
        self.finalize(&flow, &execution, outcome).await;
    }

    /// Turn a process result into the execution's terminal state.
    async fn settle(
        &self,
        execution_id: &str,
        outcome: ProcessOutcome,
        result_path: &Path,
    ) -> RunOutcome {
        match outcome {
            ProcessOutcome::LaunchFailed(msg) => RunOutcome::failed(msg, None),
            ProcessOutcome::Exited {
                code: Some(0),
                stdout,
                ..
            } => match collector::collect(result_path).await {
                Ok(reported) => {
                    let tasks = reported
                        .into_iter()
                        .map(|task| task_record(execution_id, task))
                        .collect();
                    RunOutcome::completed(stdout, tasks)
                }
                Err(e) => RunOutcome::failed(
                    format!("error processing execution results: {e}"),
                    Some(stdout),
                ),
            },
            ProcessOutcome::Exited {
                code: Some(code),
                stdout,
                stderr,
                ..
            } => {
                collector::discard(result_path).await;
                RunOutcome::failed(
                    with_stderr(format!("process exited with code {code}"), &stderr),
                    Some(stdout),
                )
            }
            ProcessOutcome::Exited {
                code: None,
                signal,
                stdout,
                stderr,
            } => {
                collector::discard(result_path).await;
                let cause = match signal {
                    Some(signal) => format!("process terminated by signal {signal}"),
                    None => "process terminated by signal".to_string(),
                };
                RunOutcome::failed(with_stderr(cause, &stderr), Some(stdout))
            }
            ProcessOutcome::TimedOut {
                after,
                stdout,
                stderr,
            } => {
                collector::discard(result_path).await;
                RunOutcome::failed(
                    with_stderr(format!("process timed out after {after:?}"), &stderr),
                    Some(stdout),
                )
            }
        }
    }

    async fn finalize(&self, flow: &Flow, execution: &Execution, outcome: RunOutcome) {
        let mut attempt = 0;
        loop {
            match self.store.finish_execution(&execution.id, &outcome).await {
                Ok(true) => break,
                Ok(false) => {
                    tracing::warn!(
                        execution_id = %execution.id,
                        "Execution was already finalized, dropping outcome"
                    );
                    return;
                }
                Err(e) if attempt + 1 < FINALIZE_ATTEMPTS => {
                    let backoff = FINALIZE_BACKOFF * 2u32.pow(attempt);
                    tracing::warn!(
                        execution_id = %execution.id,
                        error = %e,
                        attempt = attempt + 1,
                        "Failed to finalize run, retrying in {}ms",
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        execution_id = %execution.id,
                        error = %e,
                        "Giving up finalizing run"
                    );
                    return;
                }
            }
        }

        match outcome.status {
            RunStatus::Completed => {
                tracing::info!(
                    flow = %flow.name,
                    execution_id = %execution.id,
                    tasks = outcome.tasks.len(),
                    "Run completed"
                );
                self.emit(
                    execution,
                    RunEventType::RunCompleted,
                    format!("{} task(s) reported", outcome.tasks.len()),
                );
            }
            _ => {
                let message = outcome.error_message.clone().unwrap_or_default();
                tracing::warn!(
                    flow = %flow.name,
                    execution_id = %execution.id,
                    error = %message,
                    "Run failed"
                );
                self.emit(execution, RunEventType::RunFailed, message);
            }
        }
    }

    fn emit(&self, execution: &Execution, event_type: RunEventType, message: String) {
        if let Some(tx) = &self.events_tx {
            // No subscribers is fine.
            let _ = tx.send(RunEvent {
                flow_id: execution.flow_id.clone(),
                execution_id: execution.id.clone(),
                timestamp: Utc::now(),
                event_type,
                message,
            });
        }
    }
}

fn task_record(execution_id: &str, task: ReportedTask) -> TaskExecution {
    TaskExecution {
        id: Uuid::new_v4().to_string(),
        execution_id: execution_id.to_string(),
        task_id: task.id,
        name: task.name,
        status: task.status,
        started_at: task.started_at,
        completed_at: task.completed_at,
        error_message: task.error_message,
    }
}

fn with_stderr(cause: String, stderr: &str) -> String {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        cause
    } else {
        format!("{cause}: {stderr}")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::flows::testing::{Harness, write_script};

    const WRITE_RESULT: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift ;;
  esac
  shift
done
"#;

    fn result_script(payload: &str) -> String {
        format!("{WRITE_RESULT}printf '%s' '{payload}' > \"$out\"\necho done\n")
    }

    #[tokio::test]
    async fn test_missing_binary_fails_run() {
        let h = Harness::new(None);
        let flow = h
            .add_flow("ghost", Path::new("/nonexistent/ghost-flow"), None)
            .await;

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        let done = h.finished(&execution.id).await;

        assert_eq!(done.status, RunStatus::Failed);
        assert!(
            done.error_message
                .as_deref()
                .unwrap()
                .contains("/nonexistent/ghost-flow")
        );
        assert!(done.tasks.is_empty());
        assert_eq!(h.flow_status(&flow.id).await, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_reported_tasks_are_recorded() {
        let h = Harness::new(None);
        let script = write_script(
            h.scratch.path(),
            "flow.sh",
            &result_script(r#"{"tasks":[{"id":"t1","name":"load","status":"COMPLETED"}]}"#),
        );
        let flow = h.add_flow("etl", &script, None).await;

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        let done = h.finished(&execution.id).await;

        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("done\n"));
        assert!(done.completed_at.is_some());
        assert_eq!(done.tasks.len(), 1);
        assert_eq!(done.tasks[0].task_id, "t1");
        assert_eq!(done.tasks[0].name, "load");
        assert_eq!(done.tasks[0].status, RunStatus::Completed);
        assert_eq!(h.flow_status(&flow.id).await, RunStatus::Completed);
        assert!(!h.runner.result_path(&execution.id).exists());
    }

    #[tokio::test]
    async fn test_no_result_file_completes_without_tasks() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "exit 0\n");
        let flow = h.add_flow("quiet", &script, None).await;

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        let done = h.finished(&execution.id).await;

        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_code_and_stderr() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "echo 'disk full' >&2\nexit 2\n");
        let flow = h.add_flow("full", &script, None).await;

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        let done = h.finished(&execution.id).await;

        assert_eq!(done.status, RunStatus::Failed);
        let message = done.error_message.unwrap();
        assert!(message.contains("code 2"), "{message}");
        assert!(message.contains("disk full"), "{message}");
        assert!(done.tasks.is_empty());
        assert_eq!(h.flow_status(&flow.id).await, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_malformed_result_fails_and_cleans_up() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", &result_script("{ nope"));
        let flow = h.add_flow("garbled", &script, None).await;

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        let done = h.finished(&execution.id).await;

        assert_eq!(done.status, RunStatus::Failed);
        assert!(
            done.error_message
                .as_deref()
                .unwrap()
                .starts_with("error processing execution results: malformed result payload")
        );
        assert_eq!(done.output.as_deref(), Some("done\n"));
        assert!(!h.runner.result_path(&execution.id).exists());
    }

    #[tokio::test]
    async fn test_timeout_fails_run() {
        let h = Harness::new(Some(Duration::from_millis(300)));
        let script = write_script(h.scratch.path(), "flow.sh", "exec sleep 30\n");
        let flow = h.add_flow("slow", &script, None).await;

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        let done = h.finished(&execution.id).await;

        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error_message.unwrap().contains("timed out after 300ms"));
    }

    #[tokio::test]
    async fn test_backgrounded_child_does_not_keep_run_open() {
        let h = Harness::new(Some(Duration::from_millis(500)));
        let script = write_script(h.scratch.path(), "flow.sh", "sleep 6 &\nexit 0\n");
        let flow = h.add_flow("daemonizing", &script, None).await;

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        tokio::time::timeout(Duration::from_secs(4), h.runner.wait_idle())
            .await
            .expect("run stayed open behind its background child");

        let done = h.finished(&execution.id).await;
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(h.flow_status(&flow.id).await, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_flow_deleted_mid_run_still_finalizes() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "sleep 1\necho done\n");
        let flow = h.add_flow("doomed", &script, None).await;

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        assert!(h.store.delete_flow(&flow.id).await.unwrap());

        let done = h.finished(&execution.id).await;
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.flow_id, flow.id);
        assert_eq!(done.flow_name, "doomed");
        assert_eq!(done.output.as_deref(), Some("done\n"));
        assert!(h.store.get_flow(&flow.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_returns_while_running_and_refuses_overlap() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "sleep 1\n");
        let flow = h.add_flow("long", &script, None).await;

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        assert_eq!(execution.status, RunStatus::Running);
        assert_eq!(h.flow_status(&flow.id).await, RunStatus::Running);

        let err = h
            .runner
            .start(&flow.id, RunTrigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::AlreadyRunning(name) if name == "long"));

        assert_eq!(h.finished(&execution.id).await.status, RunStatus::Completed);
        // Once finished the flow can run again.
        let again = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        assert_eq!(h.finished(&again.id).await.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_flow() {
        let h = Harness::new(None);
        let err = h
            .runner
            .start("does-not-exist", RunTrigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::FlowNotFound(_)));
    }

    #[tokio::test]
    async fn test_arguments_passed_to_executable() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "printf '%s|' \"$@\"\n");
        let flow = Flow::new(
            "args",
            script.to_string_lossy(),
            Some("nightly load".to_string()),
            None,
        );
        h.store.create_flow(flow.clone()).await.unwrap();

        let execution = h.runner.start(&flow.id, RunTrigger::Manual).await.unwrap();
        let done = h.finished(&execution.id).await;

        let expected = format!(
            "--flow-name|args|--description|nightly load|--output|{}|",
            h.runner.result_path(&execution.id).display()
        );
        assert_eq!(done.output.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_events_published_in_order() {
        let mut h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "exit 3\n");
        let flow = h.add_flow("evented", &script, None).await;

        let execution = h.runner.start(&flow.id, RunTrigger::Scheduled).await.unwrap();
        h.finished(&execution.id).await;

        let started = h.events.recv().await.unwrap();
        assert_eq!(started.event_type, RunEventType::RunStarted);
        assert_eq!(started.execution_id, execution.id);
        assert_eq!(started.message, "scheduled run started");

        let failed = h.events.recv().await.unwrap();
        assert_eq!(failed.event_type, RunEventType::RunFailed);
        assert_eq!(failed.flow_id, flow.id);
        assert!(failed.message.contains("code 3"));
    }

    #[tokio::test]
    async fn test_concurrent_flows_use_distinct_result_files() {
        let h = Harness::new(None);
        let script = write_script(
            h.scratch.path(),
            "flow.sh",
            &result_script(r#"{"tasks":[{"id":"t","name":"n","status":"COMPLETED"}]}"#),
        );
        let a = h.add_flow("a", &script, None).await;
        let b = h.add_flow("b", &script, None).await;

        let ea = h.runner.start(&a.id, RunTrigger::Manual).await.unwrap();
        let eb = h.runner.start(&b.id, RunTrigger::Manual).await.unwrap();
        assert_ne!(h.runner.result_path(&ea.id), h.runner.result_path(&eb.id));

        assert_eq!(h.finished(&ea.id).await.tasks.len(), 1);
        assert_eq!(h.finished(&eb.id).await.tasks.len(), 1);
        assert!(h.runner.active_runs().await.is_empty());
    }

    #[test]
    fn test_with_stderr_skips_empty_stream() {
        assert_eq!(with_stderr("boom".into(), "  \n"), "boom");
        assert_eq!(with_stderr("boom".into(), "bad\n"), "boom: bad");
    }
}
