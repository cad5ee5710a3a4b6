use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Flow;
use super::history::RunTrigger;
use super::next_run_after;
use super::repository::FlowRepository;
use super::runner::{FlowRunner, RunError};

/// What a single scheduler pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub started: usize,
    /// Due but already running, or deleted between query and start.
    pub skipped: usize,
    pub failed: usize,
}

/// Periodically starts every flow whose `next_run` has passed.
pub struct FlowScheduler {
    store: Arc<dyn FlowRepository>,
    runner: FlowRunner,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

impl FlowScheduler {
    pub fn new(store: Arc<dyn FlowRepository>, runner: FlowRunner, interval: Duration) -> Self {
        Self {
            store,
            runner,
            interval,
            handle: Mutex::new(None),
            last_tick: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the timer loop. Calling this while it is already running does
    /// nothing. The first pass runs immediately.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let scheduler = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            scheduler.run_loop().await;
        }));
        tracing::info!(interval_secs = self.interval.as_secs(), "Started scheduler");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            tracing::info!("Stopped scheduler");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub async fn last_tick(&self) -> Option<DateTime<Utc>> {
        *self.last_tick.lock().await
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = self.tick().await;
            if report != TickReport::default() {
                tracing::info!(
                    started = report.started,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Scheduler pass"
                );
            }
        }
    }

    /// One scan: start every due flow in query order, then advance its
    /// `next_run` past now. A flow that is still running is skipped but
    /// still advanced. Per-flow failures never abort the pass.
    pub async fn tick(&self) -> TickReport {
        let now = Utc::now();
        *self.last_tick.lock().await = Some(now);

        let mut report = TickReport::default();
        let due = match self.store.due_flows(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to query due flows");
                return report;
            }
        };

        for flow in due {
            match self.runner.start(&flow.id, RunTrigger::Scheduled).await {
                Ok(_) => report.started += 1,
                Err(RunError::AlreadyRunning(_)) => {
                    tracing::info!(flow = %flow.name, "Flow still running, skipping this occurrence");
                    report.skipped += 1;
                }
                Err(RunError::FlowNotFound(_)) => {
                    tracing::debug!(flow_id = %flow.id, "Flow deleted before it could start");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    // Left due so the next pass retries it.
                    tracing::error!(flow = %flow.name, error = %e, "Failed to start scheduled run");
                    report.failed += 1;
                    continue;
                }
            }
            self.reschedule(&flow).await;
        }

        report
    }

    async fn reschedule(&self, flow: &Flow) {
        let Some(schedule) = flow.schedule.as_deref() else {
            return;
        };
        let next = match next_run_after(schedule, &Utc::now()) {
            Ok(next) => Some(next),
            Err(e) => {
                tracing::warn!(flow = %flow.name, error = %e, "Could not compute next run");
                None
            }
        };
        if let Err(e) = self.store.set_next_run(&flow.id, next).await {
            tracing::error!(flow = %flow.name, error = %e, "Failed to store next run");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::flows::history::RunStatus;
    use crate::flows::testing::{Harness, write_script};
    use chrono::Duration as ChronoDuration;

    fn scheduler(h: &Harness) -> Arc<FlowScheduler> {
        Arc::new(FlowScheduler::new(
            h.store.clone(),
            h.runner.clone(),
            Duration::from_secs(60),
        ))
    }

    async fn make_due(h: &Harness, flow: &Flow) {
        h.store
            .set_next_run(&flow.id, Some(Utc::now() - ChronoDuration::minutes(5)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tick_starts_due_flow_and_advances_next_run() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "exit 0\n");
        let flow = h.add_flow("every-minute", &script, Some("* * * * *")).await;
        make_due(&h, &flow).await;

        let before = Utc::now();
        let report = scheduler(&h).tick().await;
        assert_eq!(report.started, 1);

        let stored = h.store.get_flow(&flow.id).await.unwrap().unwrap();
        assert!(stored.next_run.unwrap() > before);

        h.runner.wait_idle().await;
        let runs = h.store.list_flow_executions(&flow.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, RunTrigger::Scheduled);
        assert_eq!(runs[0].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_tick_ignores_flows_not_yet_due() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "exit 0\n");
        let flow = h.add_flow("hourly", &script, Some("0 * * * *")).await;
        let next_run = h.store.get_flow(&flow.id).await.unwrap().unwrap().next_run;

        let report = scheduler(&h).tick().await;
        assert_eq!(report, TickReport::default());
        assert_eq!(
            h.store.get_flow(&flow.id).await.unwrap().unwrap().next_run,
            next_run
        );
    }

    #[tokio::test]
    async fn test_tick_skips_running_flow_but_advances() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "exit 0\n");
        let flow = h.add_flow("busy", &script, Some("* * * * *")).await;
        // Mark it running without a process behind it.
        h.store
            .begin_execution(&flow.id, RunTrigger::Manual, Utc::now())
            .await
            .unwrap();
        make_due(&h, &flow).await;

        let before = Utc::now();
        let report = scheduler(&h).tick().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.started, 0);

        let stored = h.store.get_flow(&flow.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert!(stored.next_run.unwrap() > before);
        assert_eq!(
            h.store.list_flow_executions(&flow.id, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_tick_never_selects_invalid_schedule() {
        let h = Harness::new(None);
        let script = write_script(h.scratch.path(), "flow.sh", "exit 0\n");
        let flow = h.add_flow("broken", &script, Some("not a cron")).await;
        assert!(flow.next_run.is_none());

        assert_eq!(scheduler(&h).tick().await, TickReport::default());
    }

    #[tokio::test]
    async fn test_failing_flow_does_not_abort_pass() {
        let h = Harness::new(None);
        let ok = write_script(h.scratch.path(), "ok.sh", "exit 0\n");
        let ghost = h
            .add_flow("ghost", std::path::Path::new("/nonexistent/bin"), Some("* * * * *"))
            .await;
        let good = h.add_flow("good", &ok, Some("* * * * *")).await;
        make_due(&h, &ghost).await;
        make_due(&h, &good).await;

        let report = scheduler(&h).tick().await;
        assert_eq!(report.started, 2);
        h.runner.wait_idle().await;

        assert_eq!(h.flow_status(&ghost.id).await, RunStatus::Failed);
        assert_eq!(h.flow_status(&good.id).await, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let h = Harness::new(None);
        let scheduler = scheduler(&h);
        assert!(!scheduler.is_running().await);

        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.is_running().await);

        // The first pass fires immediately.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while scheduler.last_tick().await.is_none() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }
}
