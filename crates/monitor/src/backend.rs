use std::sync::Arc;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::coverage::{CoverageRecord, FileStatusRecord};
use crate::error::{MonitorError, Result};
use crate::job::{JobCommand, JobListResponse, JobScope};
use crate::stream::RepairRequest;

/// Raw byte chunks of a long-running response body
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Messages from an open push subscription
pub type PushStream = BoxStream<'static, Result<PushMessage>>;

/// Operations the connected backend says it offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// A push-event stream is available
    pub push: bool,
    /// A processing backend is attached, so job commands can be honored
    pub processing: bool,
    /// Repair preview streams are available
    pub repair_preview: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            push: false,
            processing: true,
            repair_preview: true,
        }
    }
}

/// One typed push message; its content only ever means "refresh now"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub kind: String,
    pub data: String,
}

/// Job list fetches and administrative commands
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities::default())
    }

    async fn fetch_jobs(&self, scope: Option<&JobScope>) -> Result<JobListResponse>;

    async fn send_command(&self, command: &JobCommand) -> Result<()>;
}

/// Optional push-event subscription
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Resolves once the subscription is established
    async fn open(&self) -> Result<PushStream>;
}

/// Whole-library coverage and per-file artifact status
#[async_trait]
pub trait CoverageBackend: Send + Sync {
    async fn fetch_coverage(&self) -> Result<Vec<CoverageRecord>>;

    async fn fetch_file_status(&self, paths: &[String]) -> Result<Vec<FileStatusRecord>> {
        let _ = paths;
        Err(MonitorError::Capability("per-file artifact status is not offered".to_string()))
    }
}

/// Long-running repair preview operations
#[async_trait]
pub trait RepairBackend: Send + Sync {
    /// Starts the operation and returns its newline-delimited body
    async fn open_preview(&self, request: &RepairRequest) -> Result<ByteStream>;
}

/// The collaborators an engine talks to
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobBackend>,
    pub coverage: Arc<dyn CoverageBackend>,
    pub repair: Arc<dyn RepairBackend>,
    pub push: Option<Arc<dyn PushChannel>>,
}

impl Backends {
    /// Use one implementation for every role
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: JobBackend + CoverageBackend + RepairBackend + PushChannel + 'static,
    {
        Self {
            jobs: backend.clone(),
            coverage: backend.clone(),
            repair: backend.clone(),
            push: Some(backend),
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use futures::StreamExt;
    use tokio::sync::mpsc;

    /// Scripted backend for engine and aggregator tests
    pub(crate) struct FakeBackend {
        pub caps: Mutex<Capabilities>,
        pub jobs: Mutex<Result<JobListResponse>>,
        pub job_calls: AtomicUsize,
        pub job_delay: Mutex<Duration>,
        pub coverage: Mutex<Vec<CoverageRecord>>,
        pub coverage_calls: AtomicUsize,
        pub file_status: Mutex<Vec<FileStatusRecord>>,
        pub file_status_calls: AtomicUsize,
        pub file_status_error: Mutex<Option<MonitorError>>,
        pub commands: Mutex<Vec<JobCommand>>,
        pub command_error: Mutex<Option<MonitorError>>,
        pub push_streams: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<PushMessage>>>>,
        pub push_opens: AtomicUsize,
        pub preview: Mutex<Option<mpsc::UnboundedReceiver<Result<Vec<u8>>>>>,
    }

    impl FakeBackend {
        pub(crate) fn new() -> Self {
            Self {
                caps: Mutex::new(Capabilities::default()),
                jobs: Mutex::new(Ok(JobListResponse::default())),
                job_calls: AtomicUsize::new(0),
                job_delay: Mutex::new(Duration::ZERO),
                coverage: Mutex::new(Vec::new()),
                coverage_calls: AtomicUsize::new(0),
                file_status: Mutex::new(Vec::new()),
                file_status_calls: AtomicUsize::new(0),
                file_status_error: Mutex::new(None),
                commands: Mutex::new(Vec::new()),
                command_error: Mutex::new(None),
                push_streams: Mutex::new(VecDeque::new()),
                push_opens: AtomicUsize::new(0),
                preview: Mutex::new(None),
            }
        }

        pub(crate) fn set_jobs(&self, jobs: serde_json::Value) {
            let response: JobListResponse =
                serde_json::from_value(serde_json::json!({ "jobs": jobs })).unwrap();
            *self.jobs.lock().unwrap() = Ok(response);
        }

        pub(crate) fn fail_jobs(&self, error: MonitorError) {
            *self.jobs.lock().unwrap() = Err(error);
        }

        pub(crate) fn job_calls(&self) -> usize {
            self.job_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn coverage_calls(&self) -> usize {
            self.coverage_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn file_status_calls(&self) -> usize {
            self.file_status_calls.load(Ordering::SeqCst)
        }

        /// Queue a push subscription; returns the sender that feeds it
        pub(crate) fn offer_push(&self) -> mpsc::UnboundedSender<Result<PushMessage>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.push_streams.lock().unwrap().push_back(rx);
            tx
        }

        /// Arm the next repair preview; returns the sender that feeds its body
        pub(crate) fn arm_preview(&self) -> mpsc::UnboundedSender<Result<Vec<u8>>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.preview.lock().unwrap() = Some(rx);
            tx
        }
    }

    pub(crate) fn receiver_stream<T: Send + 'static>(
        rx: mpsc::UnboundedReceiver<T>,
    ) -> BoxStream<'static, T> {
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    #[async_trait]
    impl JobBackend for FakeBackend {
        async fn capabilities(&self) -> Result<Capabilities> {
            Ok(*self.caps.lock().unwrap())
        }

        async fn fetch_jobs(&self, _scope: Option<&JobScope>) -> Result<JobListResponse> {
            self.job_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.job_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.jobs.lock().unwrap().clone()
        }

        async fn send_command(&self, command: &JobCommand) -> Result<()> {
            self.commands.lock().unwrap().push(command.clone());
            match self.command_error.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl CoverageBackend for FakeBackend {
        async fn fetch_coverage(&self) -> Result<Vec<CoverageRecord>> {
            self.coverage_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.coverage.lock().unwrap().clone())
        }

        async fn fetch_file_status(&self, paths: &[String]) -> Result<Vec<FileStatusRecord>> {
            self.file_status_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.file_status_error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(self
                .file_status
                .lock()
                .unwrap()
                .iter()
                .filter(|r| paths.contains(&r.path))
                .cloned()
                .collect())
        }
    }

    #[async_trait]
    impl RepairBackend for FakeBackend {
        async fn open_preview(&self, _request: &RepairRequest) -> Result<ByteStream> {
            match self.preview.lock().unwrap().take() {
                Some(rx) => Ok(receiver_stream(rx)),
                None => Err(MonitorError::Transport("no preview armed".to_string())),
            }
        }
    }

    #[async_trait]
    impl PushChannel for FakeBackend {
        async fn open(&self) -> Result<PushStream> {
            self.push_opens.fetch_add(1, Ordering::SeqCst);
            match self.push_streams.lock().unwrap().pop_front() {
                Some(rx) => Ok(receiver_stream(rx)),
                None => Err(MonitorError::Transport("connection refused".to_string())),
            }
        }
    }
}
