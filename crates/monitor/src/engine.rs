use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backends, Capabilities, PushMessage, PushStream};
use crate::coalesce::{RequestCoalescer, ResourceClass};
use crate::config::MonitorConfig;
use crate::coverage::{CoverageAggregator, CoverageEntry};
use crate::error::{MonitorError, Result};
use crate::job::{Job, JobCommand, JobId, JobListResponse, JobScope, JobStats};
use crate::reconcile::{JobDelta, Reconciler};
use crate::stream::{RepairPreview, RepairRequest};
use crate::transport::{TimerFired, TimerKind, TransportConfig, TransportController, TransportMode, TransportState};

type CoverageList = Arc<Vec<CoverageEntry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeKind {
    /// Refreshes keep failing; shown once until the next success
    Degraded,
    Recovered,
    CommandFailed,
    Unsupported,
}

/// A user-facing message from the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

/// Changes to the job population since the previous update
#[derive(Debug, Clone)]
pub struct JobsUpdate {
    pub deltas: Vec<JobDelta>,
    /// Full display order after applying `deltas`
    pub order: Vec<JobId>,
    pub stats: Option<JobStats>,
}

/// Everything the presentation layer is told, in order, over one channel
#[derive(Debug, Clone)]
pub enum EngineUpdate {
    Jobs(JobsUpdate),
    /// The complete replacement coverage list
    Coverage(CoverageList),
    Transport(TransportMode),
    Notice(Notice),
}

/// Point-in-time copy of engine state for (re)synchronizing a view
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub jobs: Vec<Job>,
    pub stats: Option<JobStats>,
    pub transport: TransportState,
    pub running: bool,
    pub active_timers: usize,
    pub coverage: Option<CoverageList>,
}

enum Control {
    Start {
        push_permitted: bool,
        ack: oneshot::Sender<()>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
    Refresh {
        force: bool,
        ack: oneshot::Sender<Result<()>>,
    },
    RefreshCoverage {
        force: bool,
        ack: oneshot::Sender<Result<CoverageList>>,
    },
    SetJobScope {
        scope: Option<JobScope>,
        ack: oneshot::Sender<Result<()>>,
    },
    SetCoverageScope {
        scope: Option<BTreeSet<String>>,
        ack: oneshot::Sender<Result<CoverageList>>,
    },
    Snapshot {
        ack: oneshot::Sender<EngineSnapshot>,
    },
}

enum DriverEvent {
    JobsFetched {
        generation: u64,
        outcome: Result<Arc<JobListResponse>>,
    },
    CoverageComputed {
        generation: u64,
        outcome: Result<CoverageList>,
    },
    PushOpened {
        session: u64,
        outcome: Result<PushStream>,
    },
}

/// Callers waiting for a result at or after a given generation
struct Waiters<T: Clone> {
    pending: Vec<(u64, oneshot::Sender<Result<T>>)>,
}

impl<T: Clone> Waiters<T> {
    fn new() -> Self {
        Self { pending: Vec::new() }
    }

    fn add(&mut self, min_generation: u64, ack: oneshot::Sender<Result<T>>) {
        self.pending.push((min_generation, ack));
    }

    fn settle(&mut self, generation: u64, outcome: &Result<T>) {
        let (ready, waiting): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|(min, _)| *min <= generation);
        self.pending = waiting;
        for (_, ack) in ready {
            let _ = ack.send(outcome.clone());
        }
    }
}

/// Job monitor coordinator: one per view
///
/// All mutable state (job cache, transport, push subscription, scopes) lives
/// in a single driver task; this handle talks to it over a control channel.
/// Dropping the handle stops the driver and cancels its timers.
pub struct Engine {
    control: mpsc::UnboundedSender<Control>,
    updates: broadcast::Sender<EngineUpdate>,
    backends: Backends,
    capabilities: OnceCell<Capabilities>,
    push_enabled: bool,
    preview: Mutex<Option<CancellationToken>>,
    driver: JoinHandle<()>,
}

impl Engine {
    /// Create the engine and spawn its driver; must be called within a tokio runtime
    pub fn new(config: &MonitorConfig, backends: Backends) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));

        let coverage = Arc::new(CoverageAggregator::new(
            Arc::clone(&backends.coverage),
            config.coverage_categories.clone(),
            config.coverage_cooldown(),
        ));

        let driver = Driver {
            backends: backends.clone(),
            coverage,
            transport: TransportController::new(TransportConfig::from_config(config), timers_tx),
            reconciler: Reconciler::new(),
            jobs_calls: RequestCoalescer::new(),
            coverage_calls: RequestCoalescer::new(),
            updates: updates.clone(),
            events_tx,
            job_scope: None,
            coverage_scope: None,
            push: None,
            session: 0,
            jobs_waiters: Waiters::new(),
            coverage_waiters: Waiters::new(),
            rerun_jobs_after: None,
            rerun_coverage_after: None,
            stats: None,
            published_mode: None,
            published_coverage: None,
        };
        let driver = tokio::spawn(driver.run(control_rx, events_rx, timers_rx));

        Self {
            control: control_tx,
            updates,
            backends,
            capabilities: OnceCell::new(),
            push_enabled: config.push_enabled,
            preview: Mutex::new(None),
            driver,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.updates.subscribe()
    }

    /// Negotiated once per engine; a failed negotiation falls back to defaults without caching
    pub async fn capabilities(&self) -> Capabilities {
        if let Some(caps) = self.capabilities.get() {
            return *caps;
        }
        match self.backends.jobs.capabilities().await {
            Ok(caps) => {
                info!(
                    "Backend capabilities: push={} processing={} repair_preview={}",
                    caps.push, caps.processing, caps.repair_preview
                );
                let _ = self.capabilities.set(caps);
                caps
            }
            Err(e) => {
                warn!("Capability negotiation failed, assuming defaults: {}", e);
                Capabilities::default()
            }
        }
    }

    /// Begin delivering updates (the view became visible)
    pub async fn start(&self) -> Result<()> {
        let caps = self.capabilities().await;
        let push_permitted = self.push_enabled && caps.push && self.backends.push.is_some();
        self.request(|ack| Control::Start { push_permitted, ack }).await
    }

    /// Cancel every timer and close the push channel; state is kept for the next start
    pub async fn stop(&self) -> Result<()> {
        self.request(|ack| Control::Stop { ack }).await
    }

    /// Refresh the job list, joining a fetch already in flight
    pub async fn refresh(&self) -> Result<()> {
        self.request(|ack| Control::Refresh { force: false, ack }).await?
    }

    /// Refresh the job list with a fetch issued after this call
    pub async fn force_refresh(&self) -> Result<()> {
        self.request(|ack| Control::Refresh { force: true, ack }).await?
    }

    pub async fn refresh_coverage(&self, force: bool) -> Result<CoverageList> {
        self.request(|ack| Control::RefreshCoverage { force, ack }).await?
    }

    /// Restrict job-list fetches to the given targets and refresh
    pub async fn set_job_scope(&self, scope: Option<JobScope>) -> Result<()> {
        self.request(|ack| Control::SetJobScope { scope, ack }).await?
    }

    /// Restrict coverage to a file subset (None for the whole library) and recompute
    pub async fn set_coverage_scope(&self, scope: Option<BTreeSet<String>>) -> Result<CoverageList> {
        self.request(|ack| Control::SetCoverageScope { scope, ack }).await?
    }

    /// Send an administrative command; success forces a refresh, failure only notifies
    pub async fn send_command(&self, command: JobCommand) -> Result<()> {
        let caps = self.capabilities().await;
        if !caps.processing {
            return Err(self.unsupported(format!("cannot {}: no processing backend is available", command)));
        }

        info!("Sending command: {}", command);
        if let Err(e) = self.backends.jobs.send_command(&command).await {
            warn!("Command '{}' failed: {}", command, e);
            self.publish(EngineUpdate::Notice(Notice {
                kind: NoticeKind::CommandFailed,
                message: format!("Could not {}: {}", command, e),
            }));
            return Err(e);
        }

        if let Err(e) = self.force_refresh().await {
            debug!("Refresh after '{}' failed: {}", command, e);
        }
        if let Err(e) = self.refresh_coverage(true).await {
            debug!("Coverage refresh after '{}' failed: {}", command, e);
        }
        Ok(())
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        self.send_command(JobCommand::Cancel(id)).await
    }

    pub async fn cancel_queued(&self) -> Result<()> {
        self.send_command(JobCommand::CancelQueued).await
    }

    pub async fn cancel_all(&self) -> Result<()> {
        self.send_command(JobCommand::CancelAll).await
    }

    pub async fn pause_queue(&self, paused: bool) -> Result<()> {
        self.send_command(JobCommand::PauseQueue(paused)).await
    }

    /// Start a repair preview, canceling the one still running
    pub async fn preview_repair(&self, request: RepairRequest) -> Result<RepairPreview> {
        let caps = self.capabilities().await;
        if !caps.repair_preview {
            return Err(self.unsupported("repair preview is not offered by this backend".to_string()));
        }

        let token = CancellationToken::new();
        let previous = lock_preview(&self.preview).replace(token.clone());
        if let Some(previous) = previous {
            if !previous.is_cancelled() {
                info!("Canceling the running repair preview");
                previous.cancel();
            }
        }

        info!("Starting repair preview {}", request.request_id);
        let body = self.backends.repair.open_preview(&request).await?;
        Ok(RepairPreview::new(body, token))
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        self.request(|ack| Control::Snapshot { ack }).await
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Control) -> Result<R> {
        let (ack, reply) = oneshot::channel();
        self.control.send(build(ack)).map_err(|_| MonitorError::Stopped)?;
        reply.await.map_err(|_| MonitorError::Stopped)
    }

    fn unsupported(&self, message: String) -> MonitorError {
        warn!("Rejected unsupported operation: {}", message);
        self.publish(EngineUpdate::Notice(Notice {
            kind: NoticeKind::Unsupported,
            message: message.clone(),
        }));
        MonitorError::Capability(message)
    }

    fn publish(&self, update: EngineUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(token) = lock_preview(&self.preview).take() {
            token.cancel();
        }
        self.driver.abort();
    }
}

fn lock_preview(
    preview: &Mutex<Option<CancellationToken>>,
) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
    preview.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Driver {
    backends: Backends,
    coverage: Arc<CoverageAggregator>,
    transport: TransportController,
    reconciler: Reconciler,
    jobs_calls: RequestCoalescer<ResourceClass, Result<Arc<JobListResponse>>>,
    coverage_calls: RequestCoalescer<ResourceClass, Result<CoverageList>>,
    updates: broadcast::Sender<EngineUpdate>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    job_scope: Option<JobScope>,
    coverage_scope: Option<BTreeSet<String>>,
    push: Option<PushStream>,
    /// Bumped on every start and stop so late push connects are dropped
    session: u64,
    jobs_waiters: Waiters<()>,
    coverage_waiters: Waiters<CoverageList>,
    /// A forced request joined this in-flight generation and needs a fresh fetch after it
    rerun_jobs_after: Option<u64>,
    rerun_coverage_after: Option<u64>,
    stats: Option<JobStats>,
    published_mode: Option<TransportMode>,
    published_coverage: Option<CoverageList>,
}

impl Driver {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut events: mpsc::UnboundedReceiver<DriverEvent>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        loop {
            tokio::select! {
                message = control.recv() => match message {
                    Some(message) => self.handle_control(message),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(fired) = timers.recv() => self.handle_timer(fired),
                message = next_push(&mut self.push) => self.handle_push(message),
            }
        }
        self.transport.stop();
        self.push = None;
        debug!("Engine driver exited");
    }

    fn handle_control(&mut self, message: Control) {
        match message {
            Control::Start { push_permitted, ack } => {
                if !self.transport.is_running() {
                    self.session += 1;
                    if self.transport.start(push_permitted) {
                        self.open_push();
                    }
                    self.publish_mode();
                    self.request_jobs(false);
                    self.request_coverage(false);
                }
                let _ = ack.send(());
            }
            Control::Stop { ack } => {
                self.session += 1;
                self.transport.stop();
                if self.push.take().is_some() {
                    info!("Push channel closed");
                }
                let _ = ack.send(());
            }
            Control::Refresh { force, ack } => {
                let generation = self.request_jobs(force);
                self.jobs_waiters.add(generation, ack);
                self.request_coverage(false);
            }
            Control::RefreshCoverage { force, ack } => {
                let generation = self.request_coverage(force);
                self.coverage_waiters.add(generation, ack);
            }
            Control::SetJobScope { scope, ack } => {
                self.job_scope = scope;
                let generation = self.request_jobs(true);
                self.jobs_waiters.add(generation, ack);
            }
            Control::SetCoverageScope { scope, ack } => {
                self.coverage_scope = scope;
                let generation = self.request_coverage(true);
                self.coverage_waiters.add(generation, ack);
            }
            Control::Snapshot { ack } => {
                let _ = ack.send(self.snapshot());
            }
        }
    }

    fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::JobsFetched { generation, outcome } => self.apply_jobs(generation, outcome),
            DriverEvent::CoverageComputed { generation, outcome } => self.apply_coverage(generation, outcome),
            DriverEvent::PushOpened { session, outcome } => self.push_connected(session, outcome),
        }
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        if !self.transport.accept(&fired) {
            debug!("Ignoring stale {:?} timer", fired.kind);
            return;
        }
        match fired.kind {
            TimerKind::Poll => {
                self.request_jobs(false);
                self.request_coverage(false);
            }
            TimerKind::PushConnect => self.open_push(),
        }
    }

    fn handle_push(&mut self, message: Option<Result<PushMessage>>) {
        match message {
            Some(Ok(message)) => {
                debug!("Push '{}' message, refreshing", message.kind);
                self.request_jobs(false);
                self.request_coverage(false);
            }
            Some(Err(e)) => {
                self.push = None;
                self.transport.push_lost(&e.to_string());
                self.publish_mode();
            }
            None => {
                self.push = None;
                self.transport.push_lost("push channel closed by the backend");
                self.publish_mode();
            }
        }
    }

    /// Issue (or join) a job-list fetch; returns the generation a waiter should wait for
    fn request_jobs(&mut self, force: bool) -> u64 {
        let backend = Arc::clone(&self.backends.jobs);
        let scope = self.job_scope.clone();
        let call = self.jobs_calls.run_exclusive(ResourceClass::Jobs, move || async move {
            backend.fetch_jobs(scope.as_ref()).await.map(Arc::new)
        });

        if call.joined {
            if force {
                self.rerun_jobs_after = Some(call.ticket);
                return call.ticket + 1;
            }
            return call.ticket;
        }

        let generation = call.ticket;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = call.wait().await;
            let _ = events.send(DriverEvent::JobsFetched { generation, outcome });
        });
        generation
    }

    fn request_coverage(&mut self, force: bool) -> u64 {
        let aggregator = Arc::clone(&self.coverage);
        let scope = self.coverage_scope.clone();
        let call = self.coverage_calls.run_exclusive(ResourceClass::Coverage, move || async move {
            aggregator.compute(scope.as_ref(), force).await
        });

        if call.joined {
            if force {
                self.rerun_coverage_after = Some(call.ticket);
                return call.ticket + 1;
            }
            return call.ticket;
        }

        let generation = call.ticket;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = call.wait().await;
            let _ = events.send(DriverEvent::CoverageComputed { generation, outcome });
        });
        generation
    }

    fn apply_jobs(&mut self, generation: u64, outcome: Result<Arc<JobListResponse>>) {
        let applied = outcome.and_then(|response| {
            self.reconciler
                .apply(generation, &response)
                .map(|deltas| deltas.map(|d| (d, response.stats.clone())))
        });

        let settled = match applied {
            Ok(Some((deltas, stats))) => {
                if !deltas.is_empty() || stats != self.stats {
                    self.stats = stats.clone();
                    self.publish(EngineUpdate::Jobs(JobsUpdate {
                        deltas,
                        order: self.reconciler.cache().ordered_ids(),
                        stats,
                    }));
                }
                self.observe();
                Ok(())
            }
            Ok(None) => {
                self.observe();
                Ok(())
            }
            Err(e) => {
                if self.transport.refresh_failed() {
                    warn!("Job updates degraded: {}", e);
                    self.publish(EngineUpdate::Notice(Notice {
                        kind: NoticeKind::Degraded,
                        message: format!("Job updates are failing: {}", e),
                    }));
                }
                Err(e)
            }
        };
        self.jobs_waiters.settle(generation, &settled);

        if self.rerun_jobs_after == Some(generation) {
            self.rerun_jobs_after = None;
            if !self.jobs_calls.is_outstanding(&ResourceClass::Jobs) {
                self.request_jobs(false);
            }
        }
    }

    fn observe(&mut self) {
        let observation = self.transport.observe(self.reconciler.cache().has_active());
        if observation.recovered {
            info!("Job updates recovered");
            self.publish(EngineUpdate::Notice(Notice {
                kind: NoticeKind::Recovered,
                message: "Job updates recovered".to_string(),
            }));
        }
        if observation.mode_changed {
            self.publish_mode();
        }
    }

    fn apply_coverage(&mut self, generation: u64, outcome: Result<CoverageList>) {
        match &outcome {
            Ok(entries) => {
                let unchanged = self
                    .published_coverage
                    .as_ref()
                    .is_some_and(|last| Arc::ptr_eq(last, entries) || **last == **entries);
                if !unchanged {
                    self.published_coverage = Some(Arc::clone(entries));
                    self.publish(EngineUpdate::Coverage(Arc::clone(entries)));
                }
            }
            Err(e) => warn!("Coverage refresh failed: {}", e),
        }
        self.coverage_waiters.settle(generation, &outcome);

        if self.rerun_coverage_after == Some(generation) {
            self.rerun_coverage_after = None;
            if !self.coverage_calls.is_outstanding(&ResourceClass::Coverage) {
                self.request_coverage(true);
            }
        }
    }

    fn open_push(&mut self) {
        let Some(channel) = self.backends.push.clone() else {
            return;
        };
        let session = self.session;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = channel.open().await;
            let _ = events.send(DriverEvent::PushOpened { session, outcome });
        });
    }

    fn push_connected(&mut self, session: u64, outcome: Result<PushStream>) {
        if session != self.session || !self.transport.is_running() {
            debug!("Dropping push connect from an earlier session");
            return;
        }
        match outcome {
            Ok(stream) => {
                self.transport.push_opened();
                if self.transport.mode() == TransportMode::Push {
                    info!("Push channel established");
                    self.push = Some(stream);
                    self.publish_mode();
                }
            }
            Err(e) => {
                self.transport.push_connect_failed(&e.to_string());
                self.publish_mode();
            }
        }
    }

    fn publish_mode(&mut self) {
        let mode = self.transport.mode();
        if self.published_mode != Some(mode) {
            self.published_mode = Some(mode);
            self.publish(EngineUpdate::Transport(mode));
        }
    }

    fn publish(&self, update: EngineUpdate) {
        let _ = self.updates.send(update);
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            jobs: self.reconciler.cache().ordered().into_iter().cloned().collect(),
            stats: self.stats.clone(),
            transport: self.transport.state().clone(),
            running: self.transport.is_running(),
            active_timers: self.transport.active_timers(),
            coverage: self.coverage.last(),
        }
    }
}

async fn next_push(push: &mut Option<PushStream>) -> Option<Result<PushMessage>> {
    match push {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
