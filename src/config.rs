use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8081;
const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 60;
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 3600;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    /// Directory holding `flowd.db`.
    pub data_dir: PathBuf,
    /// Where per-run result files are written.
    pub scratch_dir: PathBuf,
    pub scheduler_interval: Duration,
    /// `None` lets runs go on indefinitely.
    pub run_timeout: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from a variable lookup. Used directly in tests to
    /// avoid mutating process-global environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = get("PORT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let sentry_dsn = get("SENTRY_DSN");

        let environment = get("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        let data_dir = get("FLOWD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let scratch_dir = get("FLOWD_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let scheduler_interval = get("FLOWD_SCHEDULER_INTERVAL_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs >= 1)
            .unwrap_or(DEFAULT_SCHEDULER_INTERVAL_SECS);

        let run_timeout = get("FLOWD_RUN_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RUN_TIMEOUT_SECS);

        Config {
            port,
            sentry_dsn,
            environment,
            data_dir,
            scratch_dir,
            scheduler_interval: Duration::from_secs(scheduler_interval),
            run_timeout: (run_timeout > 0).then(|| Duration::from_secs(run_timeout)),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("flowd.db")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".flowd")
}
