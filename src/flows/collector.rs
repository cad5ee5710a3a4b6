use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use super::history::RunStatus;

#[derive(thiserror::Error, Debug)]
pub enum CollectError {
    #[error("failed to read result file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed result payload: {0}")]
    Parse(String),
}

/// One task as reported by the executable in its result file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportedTask {
    #[serde(alias = "taskId")]
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: RunStatus,
    #[serde(default, alias = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "completedAt")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "errorMessage")]
    pub error_message: Option<String>,
}

#[derive(Deserialize)]
struct ResultPayload {
    #[serde(default)]
    tasks: Option<Vec<ReportedTask>>,
}

/// Statuses outside the known set read as `Pending`, matching how stored
/// values are decoded.
fn lenient_status<'de, D>(deserializer: D) -> Result<RunStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .map(|s| RunStatus::from_db(&s.to_ascii_uppercase()))
        .unwrap_or_default())
}

/// Decode a result payload. The top level must be a JSON object; a missing
/// or null `tasks` field is an empty list.
pub fn decode(contents: &str) -> Result<Vec<ReportedTask>, CollectError> {
    let value: serde_json::Value =
        serde_json::from_str(contents).map_err(|e| CollectError::Parse(e.to_string()))?;
    if !value.is_object() {
        return Err(CollectError::Parse(
            "top-level value is not an object".to_string(),
        ));
    }
    let payload: ResultPayload =
        serde_json::from_value(value).map_err(|e| CollectError::Parse(e.to_string()))?;
    Ok(payload.tasks.unwrap_or_default())
}

/// Read and decode the result file at `path` without touching it.
/// A missing file is an empty result.
pub async fn parse(path: &Path) -> Result<Vec<ReportedTask>, CollectError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(source) => {
            return Err(CollectError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    decode(&contents)
}

/// `parse`, then remove the file. The file is removed whenever it existed,
/// including when its contents were malformed.
pub async fn collect(path: &Path) -> Result<Vec<ReportedTask>, CollectError> {
    let result = parse(path).await;
    discard(path).await;
    result
}

/// Best-effort removal of a scratch result file.
pub async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove result file");
        }
    }
}
