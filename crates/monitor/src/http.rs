use std::time::Duration;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use reqwest_eventsource::{Event, EventSource};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::backend::{
    ByteStream, Capabilities, CoverageBackend, JobBackend, PushChannel, PushMessage, PushStream, RepairBackend,
};
use crate::config::MonitorConfig;
use crate::coverage::{CoverageRecord, FileStatusRecord};
use crate::error::{MonitorError, Result};
use crate::job::{JobCommand, JobListResponse, JobRecord, JobScope};
use crate::stream::RepairRequest;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend reached over the job server's HTTP API
///
/// Short requests (job list, coverage, commands) carry the configured
/// timeout; the event stream and repair previews are long-lived and do not.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("jobwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).timeout(self.request_timeout)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path)).timeout(self.request_timeout)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JobListWire {
    Bare(Vec<JobRecord>),
    Wrapped(JobListResponse),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListWire<T> {
    Bare(Vec<T>),
    Coverage { coverage: Vec<T> },
    Files { files: Vec<T> },
}

impl<T> ListWire<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            ListWire::Bare(items) => items,
            ListWire::Coverage { coverage } => coverage,
            ListWire::Files { files } => files,
        }
    }
}

/// Accepts `{"jobs": [...], "stats": {...}}` or a bare array of jobs
pub fn parse_job_list(body: &[u8]) -> Result<JobListResponse> {
    Ok(match serde_json::from_slice::<JobListWire>(body)? {
        JobListWire::Bare(jobs) => JobListResponse { jobs, stats: None },
        JobListWire::Wrapped(response) => response,
    })
}

fn parse_list<T: DeserializeOwned>(body: &[u8]) -> Result<Vec<T>> {
    Ok(serde_json::from_slice::<ListWire<T>>(body)?.into_vec())
}

/// Fail non-2xx responses with the status line and body text
async fn expect_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(MonitorError::Transport(describe_failure(status, &body)))
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    }
}

/// Command endpoint under `base_url`; job ids are opaque and get their own encoded segment
fn command_url(base_url: &str, command: &JobCommand) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| MonitorError::Transport(format!("invalid server URL {}: {}", base_url, e)))?;
    let segments: Vec<&str> = match command {
        JobCommand::Cancel(id) => vec!["api", "jobs", id.as_str(), "cancel"],
        JobCommand::CancelQueued => vec!["api", "jobs", "cancel-queued"],
        JobCommand::CancelAll => vec!["api", "jobs", "cancel-all"],
        JobCommand::PauseQueue(_) => vec!["api", "queue", "pause"],
    };
    url.path_segments_mut()
        .map_err(|_| MonitorError::Transport(format!("server URL {} cannot carry a path", base_url)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Keepalive/ping events carry no job information
fn is_keepalive(kind: &str, data: &str) -> bool {
    matches!(kind, "keepalive" | "ping" | "heartbeat") || data.trim() == "keepalive"
}

fn push_message(kind: String, data: String) -> Option<PushMessage> {
    if is_keepalive(&kind, &data) {
        return None;
    }
    Some(PushMessage { kind, data })
}

#[async_trait]
impl JobBackend for HttpBackend {
    async fn capabilities(&self) -> Result<Capabilities> {
        let response = self.get("/api/capabilities").send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Backend does not advertise capabilities, using defaults");
            return Ok(Capabilities::default());
        }
        let body = expect_success(response).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn fetch_jobs(&self, scope: Option<&JobScope>) -> Result<JobListResponse> {
        let mut request = self.get("/api/jobs");
        if let Some(scope) = scope {
            let query: Vec<(&str, &str)> = scope.targets.iter().map(|t| ("target", t.as_str())).collect();
            request = request.query(&query);
        }
        let body = expect_success(request.send().await?).await?.bytes().await?;
        parse_job_list(&body)
    }

    async fn send_command(&self, command: &JobCommand) -> Result<()> {
        let url = command_url(&self.base_url, command)?;
        let mut request = self.client.post(url).timeout(self.request_timeout);
        if let JobCommand::PauseQueue(paused) = command {
            request = request.json(&serde_json::json!({ "paused": paused }));
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(MonitorError::Command(describe_failure(status, &body)))
    }
}

#[async_trait]
impl CoverageBackend for HttpBackend {
    async fn fetch_coverage(&self) -> Result<Vec<CoverageRecord>> {
        let body = expect_success(self.get("/api/coverage").send().await?)
            .await?
            .bytes()
            .await?;
        parse_list(&body)
    }

    async fn fetch_file_status(&self, paths: &[String]) -> Result<Vec<FileStatusRecord>> {
        let response = self
            .post("/api/coverage/files")
            .json(&serde_json::json!({ "paths": paths }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(MonitorError::Capability(
                "per-file artifact status is not offered".to_string(),
            ));
        }
        let body = expect_success(response).await?.bytes().await?;
        parse_list(&body)
    }
}

#[async_trait]
impl RepairBackend for HttpBackend {
    async fn open_preview(&self, request: &RepairRequest) -> Result<ByteStream> {
        let response = self
            .client
            .post(self.url("/api/repair/preview"))
            .json(request)
            .send()
            .await?;
        let response = expect_success(response).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(MonitorError::from))
            .boxed())
    }
}

#[async_trait]
impl PushChannel for HttpBackend {
    async fn open(&self) -> Result<PushStream> {
        let url = self.url("/api/events");
        let mut source = EventSource::new(self.client.get(&url))
            .map_err(|e| MonitorError::Transport(e.to_string()))?;

        let mut first = None;
        match source.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(message))) => first = push_message(message.event, message.data),
            Some(Err(e)) => {
                source.close();
                return Err(MonitorError::Transport(e.to_string()));
            }
            None => {
                return Err(MonitorError::Transport("event stream ended before opening".to_string()));
            }
        }
        info!("Subscribed to {}", url);

        // The source would reconnect on its own; one failure ends the subscription instead
        let stream = futures::stream::unfold(Some(source), |state| async move {
            let mut source = state?;
            loop {
                match source.next().await {
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(message))) => {
                        if let Some(push) = push_message(message.event, message.data) {
                            return Some((Ok(push), Some(source)));
                        }
                    }
                    Some(Err(e)) => {
                        source.close();
                        return Some((Err(MonitorError::Transport(e.to_string())), None));
                    }
                    None => return None,
                }
            }
        });
        Ok(futures::stream::iter(first.map(Ok)).chain(stream).boxed())
    }
}
