pub mod collector;
pub mod events;
pub mod history;
pub mod process;
pub mod repository;
pub mod runner;
pub mod scheduler;
pub mod sqlite_repository;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use self::history::RunStatus;

/// A named unit of work bound to one external executable and an optional
/// cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub binary_path: String,
    #[serde(default)]
    pub schedule: Option<String>,
    /// Why `schedule` could not be evaluated, if it couldn't.
    #[serde(default)]
    pub schedule_error: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(
        name: impl Into<String>,
        binary_path: impl Into<String>,
        description: Option<String>,
        schedule: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let mut flow = Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description,
            binary_path: binary_path.into(),
            schedule: None,
            schedule_error: None,
            last_run: None,
            next_run: None,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        flow.set_schedule(schedule, now);
        flow
    }

    /// Replace the schedule and re-derive `next_run` from it as of `now`.
    ///
    /// Blank schedules are stored as `None`. An unparsable schedule is kept
    /// as written, with `next_run = None` and the parse failure recorded in
    /// `schedule_error`, so the scheduler never selects the flow until the
    /// schedule is corrected.
    pub fn set_schedule(&mut self, schedule: Option<String>, now: DateTime<Utc>) {
        let schedule = schedule
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        match schedule.as_deref().map(|s| next_run_after(s, &now)) {
            None => {
                self.next_run = None;
                self.schedule_error = None;
            }
            Some(Ok(next)) => {
                self.next_run = Some(next);
                self.schedule_error = None;
            }
            Some(Err(e)) => {
                tracing::warn!(flow = %self.name, error = %e, "Unparsable schedule, flow will not be scheduled");
                self.next_run = None;
                self.schedule_error = Some(e.to_string());
            }
        }
        self.schedule = schedule;
        self.updated_at = now;
    }
}

pub fn parse_schedule(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .parse()
        .map_err(|e| anyhow!("invalid cron expression '{expression}': {e}"))
}

/// Next fire time of `expression` strictly after `after`.
pub fn next_run_after(expression: &str, after: &DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = parse_schedule(expression)?;
    cron.find_next_occurrence(after, false)
        .map_err(|e| anyhow!("no next occurrence for '{expression}': {e}"))
}

/// The next `count` fire times of `expression` after `after`.
pub fn upcoming_runs(
    expression: &str,
    after: &DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let cron = parse_schedule(expression)?;
    let mut runs = Vec::with_capacity(count);
    let mut cursor = *after;
    for _ in 0..count {
        match cron.find_next_occurrence(&cursor, false) {
            Ok(next) => {
                runs.push(next);
                cursor = next;
            }
            Err(_) => break,
        }
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Timelike};

    #[test]
    fn test_new_flow_defaults() {
        let flow = Flow::new("nightly", "/bin/true", None, None);
        assert_eq!(flow.status, RunStatus::Pending);
        assert!(flow.last_run.is_none());
        assert!(flow.next_run.is_none());
        assert!(flow.schedule.is_none());
        assert!(!flow.id.is_empty());
    }

    #[test]
    fn test_next_run_is_strictly_after_now() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();
        let next = next_run_after("*/5 * * * *", &now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 10, 20, 0).unwrap());
    }

    #[test]
    fn test_set_schedule_computes_next_run() {
        let mut flow = Flow::new("hourly", "/bin/true", None, None);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 30).unwrap();
        flow.set_schedule(Some("0 * * * *".to_string()), now);
        assert_eq!(
            flow.next_run,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap())
        );
        assert!(flow.schedule_error.is_none());
        assert_eq!(flow.updated_at, now);
    }

    #[test]
    fn test_invalid_schedule_clears_next_run() {
        let mut flow = Flow::new("broken", "/bin/true", None, Some("* * * * *".to_string()));
        assert!(flow.next_run.is_some());

        flow.set_schedule(Some("not a cron".to_string()), Utc::now());
        assert!(flow.next_run.is_none());
        assert_eq!(flow.schedule.as_deref(), Some("not a cron"));
        assert!(flow.schedule_error.as_deref().unwrap().contains("not a cron"));
    }

    #[test]
    fn test_blank_schedule_is_none() {
        let flow = Flow::new("manual", "/bin/true", None, Some("   ".to_string()));
        assert!(flow.schedule.is_none());
        assert!(flow.next_run.is_none());
        assert!(flow.schedule_error.is_none());
    }

    #[test]
    fn test_clearing_schedule_clears_error() {
        let mut flow = Flow::new("x", "/bin/true", None, Some("bogus".to_string()));
        assert!(flow.schedule_error.is_some());
        flow.set_schedule(None, Utc::now());
        assert!(flow.schedule_error.is_none());
        assert!(flow.next_run.is_none());
    }

    #[test]
    fn test_every_minute_lands_on_minute_boundary() {
        let now = Utc::now();
        let next = next_run_after("* * * * *", &now).unwrap();
        assert!(next > now);
        assert!(next - now <= Duration::minutes(1));
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn test_upcoming_runs_are_increasing() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap();
        let runs = upcoming_runs("30 * * * *", &now, 5).unwrap();
        assert_eq!(runs.len(), 5);
        assert_eq!(runs[0], Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap());
        assert!(runs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_parse_schedule_rejects_garbage() {
        assert!(parse_schedule("every tuesday").is_err());
        assert!(parse_schedule("61 * * * *").is_err());
    }
}
