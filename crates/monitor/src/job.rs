use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{MonitorError, Result};
use crate::status::{normalize, CanonicalStatus};

/// Opaque, stable job identifier
///
/// Backends hand out either strings or integers; both are kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => JobId(s),
            RawId::Unsigned(n) => JobId(n.to_string()),
            RawId::Signed(n) => JobId(n.to_string()),
        })
    }
}

/// Timestamp as delivered by the backend: epoch seconds or RFC 3339 text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTime {
    Seconds(f64),
    Text(String),
}

impl WireTime {
    /// Epoch seconds, or None if the value cannot be interpreted
    pub fn epoch_secs(&self) -> Option<i64> {
        match self {
            WireTime::Seconds(secs) if secs.is_finite() => Some(secs.trunc() as i64),
            WireTime::Seconds(_) => None,
            WireTime::Text(text) => {
                let text = text.trim();
                if let Ok(secs) = text.parse::<f64>() {
                    return WireTime::Seconds(secs).epoch_secs();
                }
                chrono::DateTime::parse_from_rfc3339(text)
                    .map(|dt| dt.timestamp())
                    .ok()
            }
        }
    }
}

/// One job entry exactly as the backend reports it
///
/// Every field is optional; absence means "unknown", never zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default)]
    pub id: Option<JobId>,
    #[serde(default, alias = "type")]
    pub task: Option<String>,
    #[serde(default, alias = "path")]
    pub target: Option<String>,
    /// Status label, or an object carrying `status`/`state`
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    /// Result label, or an object carrying `status`
    #[serde(default)]
    pub result: Option<Value>,
    /// Explicit progress in percent
    #[serde(default, alias = "progress_percent")]
    pub progress: Option<f64>,
    #[serde(default)]
    pub processed: Option<f64>,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default, alias = "created_at")]
    pub created_time: Option<WireTime>,
    #[serde(default, alias = "started_at")]
    pub start_time: Option<WireTime>,
    #[serde(default, alias = "end_time", alias = "finished_at")]
    pub ended_time: Option<WireTime>,
    #[serde(default)]
    pub paused: Option<bool>,
}

/// Aggregate counts the backend may attach to a job list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    #[serde(default)]
    pub running: Option<u64>,
    #[serde(default)]
    pub queued: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub failed: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Job-list fetch response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobListResponse {
    /// Required: a body without a job list is malformed, not empty
    pub jobs: Vec<JobRecord>,
    #[serde(default)]
    pub stats: Option<JobStats>,
}

/// Restricts a job-list fetch to a selection of targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobScope {
    pub targets: Vec<String>,
}

/// Administrative commands accepted by the job backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    Cancel(JobId),
    CancelQueued,
    CancelAll,
    /// true holds the queue, false releases it
    PauseQueue(bool),
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobCommand::Cancel(id) => write!(f, "cancel job {}", id),
            JobCommand::CancelQueued => f.write_str("cancel queued jobs"),
            JobCommand::CancelAll => f.write_str("cancel all jobs"),
            JobCommand::PauseQueue(true) => f.write_str("pause queue"),
            JobCommand::PauseQueue(false) => f.write_str("resume queue"),
        }
    }
}

/// A job as tracked by the engine
///
/// `canonical_status` and `progress_percent` are derived from the record on
/// every ingest; nothing here is patched incrementally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub task: Option<String>,
    pub target: Option<String>,
    /// Untranslated status as delivered, kept for diagnostics
    pub raw_status: Value,
    pub canonical_status: CanonicalStatus,
    pub progress_percent: Option<f64>,
    pub created_time: Option<i64>,
    pub start_time: Option<i64>,
    pub ended_time: Option<i64>,
    pub paused: bool,
    pub error: Option<String>,
}

impl Job {
    /// Build a job from a backend record, rejecting records without an id
    pub fn from_record(record: JobRecord) -> Result<Job> {
        let id = match record.id {
            Some(id) if !id.as_str().trim().is_empty() => id,
            _ => return Err(MonitorError::Data("job record without an id".to_string())),
        };

        let raw_status = record.status.unwrap_or(Value::Null);
        let error = record.error.as_ref().and_then(value_text);
        let result_status = record.result.as_ref().and_then(status_text);

        let canonical_status = normalize(
            status_text(&raw_status).as_deref(),
            error.as_deref(),
            result_status.as_deref(),
        );

        let progress_percent =
            derive_progress(canonical_status, record.progress, record.processed, record.total);

        Ok(Job {
            id,
            task: record.task,
            target: record.target,
            raw_status,
            canonical_status,
            progress_percent,
            created_time: record.created_time.as_ref().and_then(WireTime::epoch_secs),
            start_time: record.start_time.as_ref().and_then(WireTime::epoch_secs),
            ended_time: record.ended_time.as_ref().and_then(WireTime::epoch_secs),
            paused: record.paused.unwrap_or(false),
            error: error.filter(|e| !e.trim().is_empty()),
        })
    }

    pub fn is_active(&self) -> bool {
        self.canonical_status.is_active()
    }

    /// Most recent of start, end and creation time
    pub fn freshest_time(&self) -> Option<i64> {
        [self.start_time, self.ended_time, self.created_time]
            .into_iter()
            .flatten()
            .max()
    }

    /// Wall time spent so far; unknown when the job never reported a start
    pub fn duration_secs(&self, now: i64) -> Option<i64> {
        let started = self.start_time?;
        match self.ended_time {
            Some(ended) => Some((ended - started).max(0)),
            None if self.canonical_status == CanonicalStatus::Running => Some((now - started).max(0)),
            None => None,
        }
    }

    /// File name part of the target, for compact display
    pub fn target_name(&self) -> Option<&str> {
        self.target
            .as_deref()
            .map(|t| t.rsplit(['/', '\\']).next().unwrap_or(t))
    }
}

/// Progress in percent: 0 while queued, 100 once completed, otherwise the
/// explicit value or processed/total, unknown when neither is usable
fn derive_progress(
    status: CanonicalStatus,
    explicit: Option<f64>,
    processed: Option<f64>,
    total: Option<f64>,
) -> Option<f64> {
    match status {
        CanonicalStatus::Queued => return Some(0.0),
        CanonicalStatus::Completed => return Some(100.0),
        _ => {}
    }

    if let Some(pct) = explicit.filter(|p| p.is_finite()) {
        return Some(pct.clamp(0.0, 100.0));
    }

    match (processed, total) {
        (Some(done), Some(total)) if done.is_finite() && total.is_finite() && total > 0.0 => {
            Some((done / total * 100.0).clamp(0.0, 100.0))
        }
        _ => None,
    }
}

/// Label from a status field that is either text or an object with `status`/`state`
fn status_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("status")
            .or_else(|| map.get("state"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> JobRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_integer_and_string_ids() {
        let a = Job::from_record(record(json!({"id": 7, "status": "running"}))).unwrap();
        let b = Job::from_record(record(json!({"id": "7", "status": "running"}))).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.as_str(), "7");
    }

    #[test]
    fn test_missing_id_is_data_error() {
        let err = Job::from_record(record(json!({"status": "running"}))).unwrap_err();
        assert!(matches!(err, MonitorError::Data(_)));
        let err = Job::from_record(record(json!({"id": " ", "status": "running"}))).unwrap_err();
        assert!(matches!(err, MonitorError::Data(_)));
    }

    #[test]
    fn test_queued_progress_is_zero_and_completed_is_hundred() {
        let queued = Job::from_record(record(json!({"id": 1, "status": "pending", "progress": 40.0}))).unwrap();
        assert_eq!(queued.progress_percent, Some(0.0));
        let done = Job::from_record(record(json!({"id": 2, "status": "done", "progress": 40.0}))).unwrap();
        assert_eq!(done.progress_percent, Some(100.0));
    }

    #[test]
    fn test_progress_falls_back_to_ratio() {
        let job = Job::from_record(record(json!({
            "id": 1, "status": "running", "processed": 25, "total": 200
        })))
        .unwrap();
        assert_eq!(job.progress_percent, Some(12.5));
    }

    #[test]
    fn test_progress_unknown_without_values() {
        let job = Job::from_record(record(json!({"id": 1, "status": "running", "total": 0}))).unwrap();
        assert_eq!(job.progress_percent, None);
    }

    #[test]
    fn test_object_status_and_result() {
        let job = Job::from_record(record(json!({
            "id": "a", "status": {"state": "done"}, "result": {"status": "partial"}
        })))
        .unwrap();
        assert_eq!(job.canonical_status, CanonicalStatus::Failed);
        assert_eq!(job.raw_status, json!({"state": "done"}));
    }

    #[test]
    fn test_structured_error_forces_failed() {
        let job = Job::from_record(record(json!({
            "id": "a", "status": "queued", "error": {"code": 137}
        })))
        .unwrap();
        assert_eq!(job.canonical_status, CanonicalStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(r#"{"code":137}"#));
    }

    #[test]
    fn test_times_parse_and_absence_is_not_zero() {
        let job = Job::from_record(record(json!({
            "id": 1,
            "status": "completed",
            "created_time": "2024-05-01T10:00:00Z",
            "start_time": 1714557660.9,
        })))
        .unwrap();
        assert_eq!(job.created_time, Some(1714557600));
        assert_eq!(job.start_time, Some(1714557660));
        assert_eq!(job.ended_time, None);
        assert_eq!(job.freshest_time(), Some(1714557660));
        // Completed without an end time: duration is unknown, not "now - start"
        assert_eq!(job.duration_secs(1714560000), None);
    }

    #[test]
    fn test_running_duration_uses_now() {
        let job = Job::from_record(record(json!({"id": 1, "status": "running", "start_time": 100}))).unwrap();
        assert_eq!(job.duration_secs(160), Some(60));
        let unstarted = Job::from_record(record(json!({"id": 2, "status": "running"}))).unwrap();
        assert_eq!(unstarted.duration_secs(160), None);
    }

    #[test]
    fn test_target_name() {
        let job = Job::from_record(record(json!({"id": 1, "path": "/media/movies/a.mkv"}))).unwrap();
        assert_eq!(job.target_name(), Some("a.mkv"));
    }

    #[test]
    fn test_command_display() {
        assert_eq!(JobCommand::Cancel(JobId::from("9")).to_string(), "cancel job 9");
        assert_eq!(JobCommand::PauseQueue(false).to_string(), "resume queue");
    }
}
