use std::collections::HashMap;
use std::time::Duration;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;

/// How the engine is currently learning about job changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// A live push subscription is open and healthy
    Push,
    /// Polling fast because at least one job is non-terminal
    PollActive,
    /// Polling with a growing interval because nothing is running or queued
    PollIdle,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportMode::Push => "push",
            TransportMode::PollActive => "poll-active",
            TransportMode::PollIdle => "poll-idle",
        })
    }
}

/// Transport state for one engine instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportState {
    pub mode: TransportMode,
    /// Wait before the next idle probe
    pub idle_backoff: Duration,
    /// Sticky for the session once the push channel has failed
    pub push_unavailable: bool,
}

/// Timing knobs for the transport state machine
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub active_interval: Duration,
    pub push_heartbeat: Duration,
    pub push_connect_attempts: u32,
    pub push_retry_delay: Duration,
    pub idle_floor: Duration,
    pub idle_baseline: Duration,
    pub idle_ceiling: Duration,
    pub idle_growth: f64,
    pub failure_ceiling: Duration,
    pub degraded_after_failures: u32,
}

impl TransportConfig {
    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self {
            active_interval: Duration::from_millis(cfg.active_poll_ms),
            push_heartbeat: Duration::from_millis(cfg.push_heartbeat_ms),
            push_connect_attempts: cfg.push_connect_attempts.max(1),
            push_retry_delay: Duration::from_millis(cfg.push_retry_delay_ms),
            idle_floor: Duration::from_millis(cfg.idle_floor_ms),
            idle_baseline: Duration::from_millis(cfg.idle_baseline_ms),
            idle_ceiling: Duration::from_millis(cfg.idle_ceiling_ms),
            idle_growth: cfg.idle_growth,
            failure_ceiling: Duration::from_millis(cfg.failure_ceiling_ms),
            degraded_after_failures: cfg.degraded_after_failures.max(1),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default_config())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Next job refresh (poll tick, or heartbeat while push is healthy)
    Poll,
    /// Next push connect attempt
    PushConnect,
}

/// Delivered on the timer channel when a scheduled timer elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    token: u64,
}

/// What a successful refresh changed in the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    pub mode_changed: bool,
    /// The engine had raised a degraded notice and is now healthy again
    pub recovered: bool,
}

struct PendingTimer {
    token: u64,
    handle: JoinHandle<()>,
}

/// Decides between push and poll delivery and owns every transport timer
///
/// At most one timer per [`TimerKind`] exists at a time: scheduling a kind
/// aborts the pending timer of that kind first. Timer tokens let the engine
/// drop a fire that raced with a cancellation.
pub struct TransportController {
    config: TransportConfig,
    state: TransportState,
    timers: HashMap<TimerKind, PendingTimer>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    next_token: u64,
    running: bool,
    push_connecting: bool,
    push_attempts: u32,
    consecutive_failures: u32,
    degraded: bool,
}

impl TransportController {
    pub fn new(config: TransportConfig, fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        let state = TransportState {
            mode: TransportMode::PollActive,
            idle_backoff: config.idle_floor,
            push_unavailable: false,
        };
        Self {
            config,
            state,
            timers: HashMap::new(),
            fired_tx,
            next_token: 0,
            running: false,
            push_connecting: false,
            push_attempts: 0,
            consecutive_failures: 0,
            degraded: false,
        }
    }

    pub fn state(&self) -> &TransportState {
        &self.state
    }

    pub fn mode(&self) -> TransportMode {
        self.state.mode
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Timers scheduled and not yet elapsed
    pub fn active_timers(&self) -> usize {
        self.timers.values().filter(|t| !t.handle.is_finished()).count()
    }

    /// Begin a session; returns true when the caller should open the push channel
    pub fn start(&mut self, push_permitted: bool) -> bool {
        self.cancel_all();
        self.running = true;
        self.push_attempts = 0;
        self.state.mode = TransportMode::PollActive;
        self.state.idle_backoff = self.config.idle_floor;
        self.schedule(TimerKind::Poll, self.config.active_interval);

        self.push_connecting = push_permitted && !self.state.push_unavailable;
        if self.push_connecting {
            info!("Transport starting: polling while the push channel connects");
        } else {
            info!(
                "Transport starting in {} (push {})",
                self.state.mode,
                if self.state.push_unavailable { "unavailable" } else { "not offered" }
            );
        }
        self.push_connecting
    }

    /// End the session: cancel every timer; mode and push availability are kept
    pub fn stop(&mut self) {
        self.running = false;
        self.push_connecting = false;
        self.cancel_all();
        debug!("Transport stopped in {}", self.state.mode);
    }

    /// Consume a timer fire; false when it is stale or the session is over
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        if !self.running {
            return false;
        }
        match self.timers.get(&fired.kind) {
            Some(pending) if pending.token == fired.token => {
                self.timers.remove(&fired.kind);
                true
            }
            _ => false,
        }
    }

    /// Push subscription established; returns true when the mode changed
    pub fn push_opened(&mut self) -> bool {
        if !self.running || self.state.push_unavailable {
            return false;
        }
        self.push_connecting = false;
        self.push_attempts = 0;
        self.cancel(TimerKind::PushConnect);
        let changed = self.set_mode(TransportMode::Push);
        self.schedule(TimerKind::Poll, self.config.push_heartbeat);
        changed
    }

    /// A connect attempt failed; returns true when another attempt was scheduled
    pub fn push_connect_failed(&mut self, reason: &str) -> bool {
        if !self.running || !self.push_connecting {
            return false;
        }
        self.push_attempts += 1;
        if self.push_attempts < self.config.push_connect_attempts {
            warn!(
                "Push connect attempt {}/{} failed: {}",
                self.push_attempts, self.config.push_connect_attempts, reason
            );
            self.schedule(TimerKind::PushConnect, self.config.push_retry_delay);
            true
        } else {
            warn!(
                "Push channel unavailable after {} attempt(s), polling for the rest of the session: {}",
                self.push_attempts, reason
            );
            self.mark_push_unavailable();
            false
        }
    }

    /// An established push channel errored or closed; returns true when the mode changed
    pub fn push_lost(&mut self, reason: &str) -> bool {
        warn!("Push channel lost, falling back to polling: {}", reason);
        self.mark_push_unavailable();
        if !self.running {
            return false;
        }
        let changed = self.set_mode(TransportMode::PollActive);
        self.state.idle_backoff = self.config.idle_floor;
        self.schedule(TimerKind::Poll, self.config.active_interval);
        changed
    }

    /// Record a successful refresh and schedule the next one
    pub fn observe(&mut self, any_active: bool) -> Observation {
        let recovered = self.degraded;
        self.degraded = false;
        self.consecutive_failures = 0;

        if !self.running {
            return Observation { mode_changed: false, recovered };
        }

        let before = self.state.mode;
        match before {
            TransportMode::Push => {
                if any_active {
                    self.state.idle_backoff = self.config.idle_floor;
                }
                self.schedule(TimerKind::Poll, self.config.push_heartbeat);
            }
            _ if any_active => {
                self.set_mode(TransportMode::PollActive);
                self.state.idle_backoff = self.config.idle_floor;
                self.schedule(TimerKind::Poll, self.config.active_interval);
            }
            TransportMode::PollActive => {
                self.set_mode(TransportMode::PollIdle);
                self.state.idle_backoff = self.config.idle_floor;
                self.schedule(TimerKind::Poll, self.state.idle_backoff);
            }
            TransportMode::PollIdle => {
                self.state.idle_backoff = next_idle_backoff(self.state.idle_backoff, &self.config);
                debug!("Still idle, next probe in {:?}", self.state.idle_backoff);
                self.schedule(TimerKind::Poll, self.state.idle_backoff);
            }
        }

        Observation {
            mode_changed: before != self.state.mode,
            recovered,
        }
    }

    /// Record a failed refresh; returns true the one time failures cross the degraded threshold
    pub fn refresh_failed(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.running {
            let delay = match self.state.mode {
                TransportMode::Push => self.config.push_heartbeat,
                _ => failure_backoff(self.consecutive_failures, &self.config),
            };
            warn!(
                "Refresh failed ({} in a row), retrying in {:?}",
                self.consecutive_failures, delay
            );
            self.schedule(TimerKind::Poll, delay);
        }

        if !self.degraded && self.consecutive_failures >= self.config.degraded_after_failures {
            self.degraded = true;
            return true;
        }
        false
    }

    fn set_mode(&mut self, mode: TransportMode) -> bool {
        if self.state.mode == mode {
            return false;
        }
        info!("Transport mode {} -> {}", self.state.mode, mode);
        self.state.mode = mode;
        true
    }

    fn mark_push_unavailable(&mut self) {
        self.state.push_unavailable = true;
        self.push_connecting = false;
        self.cancel(TimerKind::PushConnect);
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.next_token += 1;
        let token = self.next_token;
        let tx = self.fired_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { kind, token });
        });
        self.timers.insert(kind, PendingTimer { token, handle });
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(pending) = self.timers.remove(&kind) {
            pending.handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, pending) in self.timers.drain() {
            pending.handle.abort();
        }
    }
}

impl Drop for TransportController {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Next idle wait: grown by `idle_growth`, never below the baseline, never above the ceiling
pub fn next_idle_backoff(current: Duration, config: &TransportConfig) -> Duration {
    let growth = if config.idle_growth.is_finite() {
        config.idle_growth.max(1.0)
    } else {
        1.0
    };
    let ceiling = config.idle_ceiling.as_secs_f64();
    let grown = Duration::from_secs_f64((current.as_secs_f64() * growth).min(ceiling));
    grown.max(config.idle_baseline).min(config.idle_ceiling)
}

/// Wait after `failures` consecutive failed refreshes
pub fn failure_backoff(failures: u32, config: &TransportConfig) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    config
        .active_interval
        .saturating_mul(factor)
        .min(config.failure_ceiling)
}
