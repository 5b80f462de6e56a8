//! Backend process handle.
//!
//! One handle per external server. States move
//! `Stopped -> Starting -> Ready -> Stopping -> Stopped`. Start and stop
//! sequences run behind a transition gate so at most one is in flight, and
//! concurrent `ensure_ready` callers share a single start attempt.
//!
//! The start attempt runs in its own task: a caller that gives up waiting
//! does not cancel it, and the next caller joins it instead of launching a
//! second server.

mod launcher;
mod probe;

pub use launcher::{log_path, CommandLauncher, Launcher, ManagedProcess};
pub use probe::{HttpProbe, ReadinessProbe};

use crate::clock::Clock;
use crate::config::BackendConfig;
use crate::error::{BotError, BotResult};
use crate::health;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Stopped,
    Starting,
    Ready,
    Stopping,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackendSettings {
    /// When false the server is managed externally and only probed.
    pub auto_start: bool,
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
    pub probe_interval: Duration,
}

impl BackendSettings {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            auto_start: config.auto_start,
            idle_timeout: config.idle_timeout(),
            startup_timeout: config.startup_timeout(),
            probe_interval: config.probe_interval(),
        }
    }
}

/// Point-in-time view for status output and the daemon state file.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub state: BackendState,
    pub pid: Option<u32>,
    pub leases: usize,
    pub idle_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StartupStatus {
    Pending,
    Ready,
    Failed(String),
}

struct Inner {
    state: BackendState,
    process: Option<Box<dyn ManagedProcess>>,
    last_activity: Instant,
    leases: usize,
    /// Present while a start attempt is in flight
    startup: Option<watch::Receiver<StartupStatus>>,
}

struct Shared {
    name: String,
    settings: BackendSettings,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ReadinessProbe>,
    clock: Arc<dyn Clock>,
    transition: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

#[derive(Clone)]
pub struct BackendProcess {
    shared: Arc<Shared>,
}

impl BackendProcess {
    pub fn new(
        name: &str,
        settings: BackendSettings,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ReadinessProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        health::mark_backend_state(name, BackendState::Stopped);
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                settings,
                launcher,
                probe,
                clock,
                transition: tokio::sync::Mutex::new(()),
                inner: Mutex::new(Inner {
                    state: BackendState::Stopped,
                    process: None,
                    last_activity: now,
                    leases: 0,
                    startup: None,
                }),
            }),
        }
    }

    /// Handle that launches the configured program and probes its HTTP API.
    pub fn from_config(
        name: &str,
        config: &BackendConfig,
        log_dir: PathBuf,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let launcher = CommandLauncher::new(name, &config.launch).with_log_dir(log_dir);
        let probe = HttpProbe::new(config.probe_url());
        Self::new(
            name,
            BackendSettings::from_config(config),
            Arc::new(launcher),
            Arc::new(probe),
            clock,
        )
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> BackendState {
        self.shared.inner.lock().state
    }

    pub fn status(&self) -> BackendStatus {
        let now = self.shared.clock.now();
        let inner = self.shared.inner.lock();
        BackendStatus {
            name: self.shared.name.clone(),
            state: inner.state,
            pid: inner.process.as_ref().and_then(|p| p.id()),
            leases: inner.leases,
            idle_seconds: (inner.state == BackendState::Ready)
                .then(|| now.saturating_duration_since(inner.last_activity).as_secs()),
        }
    }

    /// Return once the backend is Ready, starting it if needed.
    ///
    /// Gives up with `BackendUnavailable` after `timeout`; an in-flight start
    /// keeps running in the background.
    pub async fn ensure_ready(&self, timeout: Duration) -> BotResult<()> {
        let Some(mut rx) = self.begin_or_join_startup() else {
            return Ok(());
        };

        let outcome = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s != StartupStatus::Pending)
                .await
                .map(|s| s.clone())
        })
        .await;

        match outcome {
            Ok(Ok(StartupStatus::Ready)) => Ok(()),
            Ok(Ok(StartupStatus::Failed(reason))) => {
                Err(BotError::backend_unavailable(&self.shared.name, reason))
            }
            Ok(Ok(StartupStatus::Pending) | Err(_)) => Err(BotError::backend_unavailable(
                &self.shared.name,
                "start attempt was abandoned",
            )),
            Err(_) => Err(BotError::backend_unavailable(
                &self.shared.name,
                format!("not ready after {}s", timeout.as_secs()),
            )),
        }
    }

    /// Note a successful request; pushes the idle deadline out.
    pub fn record_activity(&self) {
        let now = self.shared.clock.now();
        self.shared.inner.lock().last_activity = now;
    }

    /// Keep the backend alive for as long as the returned guard lives.
    pub fn lease(&self) -> BackendLease {
        let now = self.shared.clock.now();
        {
            let mut inner = self.shared.inner.lock();
            inner.leases += 1;
            inner.last_activity = now;
        }
        BackendLease {
            backend: self.clone(),
        }
    }

    /// Stop the backend if it has been Ready and unused for the idle timeout.
    /// Returns true when a stop happened.
    pub async fn idle_sweep(&self) -> bool {
        if !self.idle_expired() {
            return false;
        }

        let _gate = self.shared.transition.lock().await;
        // Re-check: activity may have landed while waiting for the gate.
        let process = {
            let mut inner = self.shared.inner.lock();
            if !Self::is_idle(&inner, self.shared.clock.now(), self.shared.settings.idle_timeout) {
                return false;
            }
            self.set_state(&mut inner, BackendState::Stopping);
            inner.process.take()
        };

        tracing::info!(
            backend = %self.shared.name,
            "Idle for {}s, stopping",
            self.shared.settings.idle_timeout.as_secs()
        );
        self.shut_down(process).await;
        true
    }

    /// Stop unconditionally. Idempotent; returns false if already stopped.
    pub async fn stop(&self) -> bool {
        let _gate = self.shared.transition.lock().await;
        let process = {
            let mut inner = self.shared.inner.lock();
            if inner.state == BackendState::Stopped {
                return false;
            }
            self.set_state(&mut inner, BackendState::Stopping);
            inner.process.take()
        };

        tracing::info!(backend = %self.shared.name, "Stopping");
        self.shut_down(process).await;
        true
    }

    fn idle_expired(&self) -> bool {
        let now = self.shared.clock.now();
        let inner = self.shared.inner.lock();
        Self::is_idle(&inner, now, self.shared.settings.idle_timeout)
    }

    fn is_idle(inner: &Inner, now: Instant, idle_timeout: Duration) -> bool {
        inner.state == BackendState::Ready
            && inner.leases == 0
            && now.saturating_duration_since(inner.last_activity) >= idle_timeout
    }

    fn set_state(&self, inner: &mut Inner, state: BackendState) {
        if inner.state != state {
            tracing::debug!(backend = %self.shared.name, from = %inner.state, to = %state, "state change");
        }
        inner.state = state;
        health::mark_backend_state(&self.shared.name, state);
    }

    /// Fast path when Ready; otherwise join the in-flight start or begin one.
    fn begin_or_join_startup(&self) -> Option<watch::Receiver<StartupStatus>> {
        let now = self.shared.clock.now();
        let mut inner = self.shared.inner.lock();

        if inner.state == BackendState::Ready {
            let crashed = inner.process.as_mut().is_some_and(|p| p.has_exited());
            if !crashed {
                inner.last_activity = now;
                return None;
            }
            tracing::warn!(backend = %self.shared.name, "Process exited unexpectedly, restarting");
            health::mark_component_error(&self.shared.name, "process exited unexpectedly");
            inner.process = None;
            self.set_state(&mut inner, BackendState::Stopped);
        }

        if let Some(rx) = &inner.startup {
            return Some(rx.clone());
        }

        let (tx, rx) = watch::channel(StartupStatus::Pending);
        inner.startup = Some(rx.clone());
        drop(inner);

        let this = self.clone();
        tokio::spawn(async move { this.run_startup(tx).await });
        Some(rx)
    }

    async fn run_startup(self, tx: watch::Sender<StartupStatus>) {
        let status = {
            let _gate = self.shared.transition.lock().await;
            let status = match self.start_sequence().await {
                Ok(()) => StartupStatus::Ready,
                Err(reason) => StartupStatus::Failed(reason),
            };
            self.shared.inner.lock().startup = None;
            status
        };
        tx.send_replace(status);
    }

    /// Runs with the transition gate held.
    async fn start_sequence(&self) -> Result<(), String> {
        let name = &self.shared.name;
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == BackendState::Ready {
                return Ok(());
            }
            self.set_state(&mut inner, BackendState::Starting);
        }

        let mut process = if self.shared.settings.auto_start {
            tracing::info!(backend = %name, "Starting");
            match self.shared.launcher.launch().await {
                Ok(process) => Some(process),
                Err(e) => {
                    let reason = format!("launch failed: {e:#}");
                    self.fail_start(None, &reason).await;
                    return Err(reason);
                }
            }
        } else {
            None
        };

        match self.wait_until_ready(&mut process).await {
            Ok(()) => {
                let now = self.shared.clock.now();
                let mut inner = self.shared.inner.lock();
                inner.process = process;
                inner.last_activity = now;
                self.set_state(&mut inner, BackendState::Ready);
                health::mark_component_ok(name);
                tracing::info!(backend = %name, "Ready");
                Ok(())
            }
            Err(reason) => {
                self.fail_start(process, &reason).await;
                Err(reason)
            }
        }
    }

    /// Poll the probe with a fixed interval until it answers or the startup
    /// timeout runs out. Time spent inside a slow probe counts against it.
    async fn wait_until_ready(
        &self,
        process: &mut Option<Box<dyn ManagedProcess>>,
    ) -> Result<(), String> {
        let settings = self.shared.settings;
        let interval = settings.probe_interval.max(Duration::from_millis(1));

        let poll = async {
            let mut attempt: u32 = 0;
            loop {
                attempt = attempt.saturating_add(1);
                if self.shared.probe.is_ready().await {
                    tracing::debug!(backend = %self.shared.name, attempt, "probe succeeded");
                    return Ok(());
                }
                if process.as_mut().is_some_and(|p| p.has_exited()) {
                    return Err("process exited during startup".to_string());
                }
                tokio::time::sleep(interval).await;
            }
        };

        match tokio::time::timeout(settings.startup_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "no readiness signal within {}s",
                settings.startup_timeout.as_secs()
            )),
        }
    }

    async fn fail_start(&self, process: Option<Box<dyn ManagedProcess>>, reason: &str) {
        tracing::warn!(backend = %self.shared.name, "Start failed: {reason}");
        health::mark_component_error(&self.shared.name, reason);
        self.shut_down(process).await;
    }

    /// Best-effort termination; always ends in Stopped.
    async fn shut_down(&self, process: Option<Box<dyn ManagedProcess>>) {
        if let Some(mut process) = process {
            if let Err(e) = process.terminate().await {
                tracing::warn!(backend = %self.shared.name, "Terminate failed: {e:#}");
                health::mark_component_error(&self.shared.name, format!("terminate failed: {e:#}"));
            }
        }
        let mut inner = self.shared.inner.lock();
        self.set_state(&mut inner, BackendState::Stopped);
    }
}

/// Holds a backend out of idle shutdown.
pub struct BackendLease {
    backend: BackendProcess,
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        let now = self.backend.shared.clock.now();
        let mut inner = self.backend.shared.inner.lock();
        inner.leases = inner.leases.saturating_sub(1);
        inner.last_activity = now;
    }
}
