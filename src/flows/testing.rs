use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use super::Flow;
use super::events::{EVENT_CHANNEL_CAPACITY, RunEvent};
use super::history::{Execution, RunStatus};
use super::process::ProcessRunner;
use super::repository::FlowRepository;
use super::runner::FlowRunner;
use super::sqlite_repository::SqliteFlowRepository;

/// Write an executable `/bin/sh` script into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub struct Harness {
    pub store: Arc<SqliteFlowRepository>,
    pub runner: FlowRunner,
    pub events: broadcast::Receiver<RunEvent>,
    pub scratch: tempfile::TempDir,
}

impl Harness {
    pub fn new(timeout: Option<Duration>) -> Self {
        let store = Arc::new(SqliteFlowRepository::in_memory().unwrap());
        let scratch = tempfile::tempdir().unwrap();
        let (tx, events) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let runner = FlowRunner::new(
            store.clone(),
            Arc::new(ProcessRunner::new(timeout)),
            scratch.path().to_path_buf(),
        )
        .with_events(tx);
        Self {
            store,
            runner,
            events,
            scratch,
        }
    }

    pub async fn add_flow(&self, name: &str, binary: &Path, schedule: Option<&str>) -> Flow {
        let flow = Flow::new(
            name,
            binary.to_string_lossy(),
            None,
            schedule.map(String::from),
        );
        self.store.create_flow(flow.clone()).await.unwrap();
        flow
    }

    /// Wait until every spawned run has finalized, then reload `execution_id`.
    pub async fn finished(&self, execution_id: &str) -> Execution {
        tokio::time::timeout(Duration::from_secs(10), self.runner.wait_idle())
            .await
            .expect("runs did not finish in time");
        let execution = self
            .store
            .get_execution(execution_id)
            .await
            .unwrap()
            .unwrap();
        assert!(
            execution.status.is_terminal(),
            "execution left in {}",
            execution.status
        );
        execution
    }

    pub async fn flow_status(&self, flow_id: &str) -> RunStatus {
        self.store.get_flow(flow_id).await.unwrap().unwrap().status
    }
}
