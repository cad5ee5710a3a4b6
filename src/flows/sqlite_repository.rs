use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Flow;
use super::history::{Execution, RunOutcome, RunStatus, RunTrigger, TaskExecution};
use super::repository::{BeginOutcome, DuplicateFlowName, FlowRepository};

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS flows (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL UNIQUE,
    description    TEXT,
    binary_path    TEXT NOT NULL,
    schedule       TEXT,
    schedule_error TEXT,
    last_run       INTEGER,
    next_run       INTEGER,
    status         TEXT NOT NULL DEFAULT 'PENDING',
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_flows_next_run ON flows (next_run);

-- No foreign key on flow_id: executions outlive their flow.
CREATE TABLE IF NOT EXISTS executions (
    id            TEXT PRIMARY KEY,
    flow_id       TEXT NOT NULL,
    flow_name     TEXT NOT NULL,
    triggered_by  TEXT NOT NULL,
    status        TEXT NOT NULL,
    started_at    INTEGER NOT NULL,
    completed_at  INTEGER,
    output        TEXT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_executions_flow ON executions (flow_id, started_at);

CREATE TABLE IF NOT EXISTS task_executions (
    id            TEXT PRIMARY KEY,
    execution_id  TEXT NOT NULL REFERENCES executions (id) ON DELETE CASCADE,
    task_id       TEXT NOT NULL,
    name          TEXT NOT NULL,
    status        TEXT NOT NULL,
    started_at    INTEGER,
    completed_at  INTEGER,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_executions_execution ON task_executions (execution_id);
"#;

const FLOW_COLUMNS: &str = "id, name, description, binary_path, schedule, schedule_error, \
     last_run, next_run, status, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, flow_id, flow_name, triggered_by, status, started_at, \
     completed_at, output, error_message";

/// SQLite-backed run store. A single connection behind a mutex serializes
/// every operation, so each method body is atomic. Queries run on the
/// blocking pool.
pub struct SqliteFlowRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFlowRepository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database: {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        tracing::info!(path = %path.display(), "Opened run store");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialise database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| anyhow!("run store connection lock poisoned"))?;
            f(&mut conn)
        })
        .await
        .context("run store task panicked")?
    }
}

// ── Row mapping ──────────────────────────────────────────────────

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn flow_from_row(row: &Row<'_>) -> rusqlite::Result<Flow> {
    Ok(Flow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        binary_path: row.get(3)?,
        schedule: row.get(4)?,
        schedule_error: row.get(5)?,
        last_run: row.get::<_, Option<i64>>(6)?.map(from_millis),
        next_run: row.get::<_, Option<i64>>(7)?.map(from_millis),
        status: RunStatus::from_db(&row.get::<_, String>(8)?),
        created_at: from_millis(row.get(9)?),
        updated_at: from_millis(row.get(10)?),
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: row.get(0)?,
        flow_id: row.get(1)?,
        flow_name: row.get(2)?,
        trigger: RunTrigger::from_db(&row.get::<_, String>(3)?),
        status: RunStatus::from_db(&row.get::<_, String>(4)?),
        started_at: from_millis(row.get(5)?),
        completed_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        output: row.get(7)?,
        error_message: row.get(8)?,
        tasks: vec![],
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskExecution> {
    Ok(TaskExecution {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        task_id: row.get(2)?,
        name: row.get(3)?,
        status: RunStatus::from_db(&row.get::<_, String>(4)?),
        started_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        completed_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        error_message: row.get(7)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn write_flow(conn: &Connection, sql: &str, flow: &Flow) -> Result<()> {
    let result = conn.execute(
        sql,
        params![
            flow.id,
            flow.name,
            flow.description,
            flow.binary_path,
            flow.schedule,
            flow.schedule_error,
            flow.last_run.map(millis),
            flow.next_run.map(millis),
            flow.status.as_str(),
            millis(flow.created_at),
            millis(flow.updated_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(DuplicateFlowName(flow.name.clone()).into()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("failed to write flow {}", flow.id))),
    }
}

fn insert_execution(conn: &Connection, execution: &Execution) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT INTO executions ({EXECUTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            execution.id,
            execution.flow_id,
            execution.flow_name,
            execution.trigger.as_str(),
            execution.status.as_str(),
            millis(execution.started_at),
            execution.completed_at.map(millis),
            execution.output,
            execution.error_message,
        ],
    )?;
    Ok(())
}

fn insert_task(conn: &Connection, task: &TaskExecution) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO task_executions \
         (id, execution_id, task_id, name, status, started_at, completed_at, error_message) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            task.id,
            task.execution_id,
            task.task_id,
            task.name,
            task.status.as_str(),
            task.started_at.map(millis),
            task.completed_at.map(millis),
            task.error_message,
        ],
    )?;
    Ok(())
}

fn load_tasks(conn: &Connection, execution_id: &str) -> rusqlite::Result<Vec<TaskExecution>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, execution_id, task_id, name, status, started_at, completed_at, error_message \
         FROM task_executions WHERE execution_id = ?1 ORDER BY rowid",
    )?;
    let tasks = stmt
        .query_map(params![execution_id], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

fn query_executions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<Execution>> {
    let mut stmt = conn.prepare(sql)?;
    let mut executions = stmt
        .query_map(params, execution_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for execution in &mut executions {
        execution.tasks = load_tasks(conn, &execution.id)?;
    }
    Ok(executions)
}

#[async_trait]
impl FlowRepository for SqliteFlowRepository {
    async fn list_flows(&self) -> Result<Vec<Flow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FLOW_COLUMNS} FROM flows ORDER BY created_at DESC"
            ))?;
            let flows = stmt
                .query_map([], flow_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(flows)
        })
        .await
    }

    async fn get_flow(&self, id: &str) -> Result<Option<Flow>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let flow = conn
                .query_row(
                    &format!("SELECT {FLOW_COLUMNS} FROM flows WHERE id = ?1"),
                    params![id],
                    flow_from_row,
                )
                .optional()?;
            Ok(flow)
        })
        .await
    }

    async fn create_flow(&self, flow: Flow) -> Result<()> {
        let flow = self
            .with_conn(move |conn| {
                write_flow(
                    conn,
                    &format!("INSERT INTO flows ({FLOW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                    &flow,
                )?;
                Ok(flow)
            })
            .await?;
        tracing::info!(flow_id = %flow.id, name = %flow.name, "Registered flow");
        Ok(())
    }

    async fn save_flow(&self, flow: Flow) -> Result<()> {
        // next_run is kept unless the schedule itself changed: the scheduler
        // may have advanced it since the caller loaded the flow.
        self.with_conn(move |conn| {
            write_flow(
                conn,
                &format!(
                    "INSERT INTO flows ({FLOW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT (id) DO UPDATE SET \
                     name = excluded.name, description = excluded.description, \
                     binary_path = excluded.binary_path, \
                     next_run = CASE WHEN flows.schedule IS excluded.schedule \
                         THEN flows.next_run ELSE excluded.next_run END, \
                     schedule = excluded.schedule, schedule_error = excluded.schedule_error, \
                     updated_at = excluded.updated_at"
                ),
                &flow,
            )
        })
        .await
    }

    async fn delete_flow(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM flows WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn due_flows(&self, now: DateTime<Utc>) -> Result<Vec<Flow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FLOW_COLUMNS} FROM flows \
                 WHERE schedule IS NOT NULL AND next_run IS NOT NULL AND next_run <= ?1 \
                 ORDER BY next_run"
            ))?;
            let flows = stmt
                .query_map(params![millis(now)], flow_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(flows)
        })
        .await
    }

    async fn set_next_run(&self, flow_id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let flow_id = flow_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE flows SET next_run = ?2 WHERE id = ?1",
                params![flow_id, next_run.map(millis)],
            )
            .with_context(|| format!("failed to update next run of flow {flow_id}"))?;
            Ok(())
        })
        .await
    }

    async fn begin_execution(
        &self,
        flow_id: &str,
        trigger: RunTrigger,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome> {
        let flow_id = flow_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let flow = tx
                .query_row(
                    &format!("SELECT {FLOW_COLUMNS} FROM flows WHERE id = ?1"),
                    params![flow_id],
                    flow_from_row,
                )
                .optional()?;
            let Some(mut flow) = flow else {
                return Ok(BeginOutcome::FlowNotFound);
            };
            if flow.status == RunStatus::Running {
                return Ok(BeginOutcome::AlreadyRunning(flow));
            }

            flow.status = RunStatus::Running;
            flow.last_run = Some(now);
            flow.updated_at = now;
            tx.execute(
                "UPDATE flows SET status = ?2, last_run = ?3, updated_at = ?3 WHERE id = ?1",
                params![flow.id, flow.status.as_str(), millis(now)],
            )?;

            let execution = Execution::running(&flow, trigger, now);
            insert_execution(&tx, &execution)?;
            tx.commit()?;

            Ok(BeginOutcome::Started { flow, execution })
        })
        .await
    }

    async fn finish_execution(&self, execution_id: &str, outcome: &RunOutcome) -> Result<bool> {
        let execution_id = execution_id.to_string();
        let outcome = outcome.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let flow_id: Option<String> = tx
                .query_row(
                    "SELECT flow_id FROM executions WHERE id = ?1 AND status = 'RUNNING'",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(flow_id) = flow_id else {
                return Ok(false);
            };

            tx.execute(
                "UPDATE executions SET status = ?2, completed_at = ?3, output = ?4, error_message = ?5 \
                 WHERE id = ?1",
                params![
                    execution_id,
                    outcome.status.as_str(),
                    millis(outcome.completed_at),
                    outcome.output,
                    outcome.error_message,
                ],
            )?;
            for task in &outcome.tasks {
                insert_task(&tx, task)?;
            }
            tx.execute(
                "UPDATE flows SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![flow_id, outcome.status.as_str(), millis(outcome.completed_at)],
            )?;
            tx.commit()?;

            Ok(true)
        })
        .await
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let execution = conn
                .query_row(
                    &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                    params![id],
                    execution_from_row,
                )
                .optional()?;
            match execution {
                Some(mut execution) => {
                    execution.tasks = load_tasks(conn, &execution.id)?;
                    Ok(Some(execution))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<Execution>> {
        self.with_conn(move |conn| {
            let executions = query_executions(
                conn,
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions ORDER BY started_at DESC, rowid DESC LIMIT ?1"),
                params![limit as i64],
            )?;
            Ok(executions)
        })
        .await
    }

    async fn list_flow_executions(&self, flow_id: &str, limit: usize) -> Result<Vec<Execution>> {
        let flow_id = flow_id.to_string();
        self.with_conn(move |conn| {
            let executions = query_executions(
                conn,
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions WHERE flow_id = ?1 \
                     ORDER BY started_at DESC, rowid DESC LIMIT ?2"
                ),
                params![flow_id, limit as i64],
            )?;
            Ok(executions)
        })
        .await
    }

    async fn delete_execution(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM executions WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn recover_interrupted(&self, now: DateTime<Utc>, message: &str) -> Result<usize> {
        let message = message.to_string();
        let (executions, flows) = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let executions = tx.execute(
                    "UPDATE executions SET status = 'FAILED', completed_at = ?1, error_message = ?2 \
                     WHERE status = 'RUNNING'",
                    params![millis(now), message],
                )?;
                let flows = tx.execute(
                    "UPDATE flows SET status = 'FAILED', updated_at = ?1 WHERE status = 'RUNNING'",
                    params![millis(now)],
                )?;
                tx.commit()?;
                Ok((executions, flows))
            })
            .await?;

        if executions > 0 || flows > 0 {
            tracing::warn!(executions, flows, "Recovered runs interrupted by a restart");
        }
        Ok(executions)
    }
}
