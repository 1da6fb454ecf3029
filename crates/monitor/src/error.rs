use thiserror::Error;

/// Errors produced by the monitor engine and its backends
///
/// Every variant carries owned text so the error can be cloned and handed
/// to each caller waiting on a coalesced refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// Push channel drop, poll request failure, stream read failure
    #[error("transport error: {0}")]
    Transport(String),
    /// A job command (cancel/pause/resume) was rejected by the backend
    #[error("command rejected: {0}")]
    Command(String),
    /// Malformed snapshot or payload
    #[error("malformed data: {0}")]
    Data(String),
    /// The requested operation is not offered by the connected backend
    #[error("unsupported operation: {0}")]
    Capability(String),
    /// The engine task is no longer running
    #[error("monitor engine has shut down")]
    Stopped,
}

impl MonitorError {
    /// Whether this failure degrades to "try again later"
    pub fn is_transient(&self) -> bool {
        matches!(self, MonitorError::Transport(_) | MonitorError::Data(_))
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            MonitorError::Data(e.to_string())
        } else {
            MonitorError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(e: serde_json::Error) -> Self {
        MonitorError::Data(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
