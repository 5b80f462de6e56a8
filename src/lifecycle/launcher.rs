use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::config::LaunchConfig;

/// Timeout waiting for graceful shutdown before the process is killed.
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Brief delay after spawn to detect immediate crashes.
const POST_SPAWN_CHECK_MS: u64 = 300;

/// Starts the external server behind a backend.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn ManagedProcess>>;
}

/// A launched server process owned by a backend handle.
#[async_trait]
pub trait ManagedProcess: Send {
    fn id(&self) -> Option<u32>;

    /// True once the process has exited (or can no longer be inspected).
    fn has_exited(&mut self) -> bool;

    /// Stop the process and everything it spawned.
    async fn terminate(&mut self) -> Result<()>;
}

/// Spawns the configured program in its own process group, logging to a file.
pub struct CommandLauncher {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(name: &str, launch: &LaunchConfig) -> Self {
        Self {
            name: name.to_string(),
            program: PathBuf::from(&launch.program),
            args: launch.args.clone(),
            working_dir: launch.working_dir.clone(),
            log_dir: None,
        }
    }

    /// Redirect stdout/stderr to `<dir>/<name>.log`, rotating the previous log.
    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    /// Launch scripts usually expect to run from their own directory.
    fn resolve_working_dir(&self) -> Option<PathBuf> {
        self.working_dir.clone().or_else(|| {
            self.program
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
    }

    fn open_log(&self) -> Result<Option<(fs::File, fs::File)>> {
        let Some(dir) = &self.log_dir else {
            return Ok(None);
        };
        fs::create_dir_all(dir).context("Failed to create backend log directory")?;
        let log = log_path(dir, &self.name);
        rotate_log(&log)?;
        let out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .with_context(|| format!("Failed to open log file {}", log.display()))?;
        let err = out.try_clone().context("Failed to clone log file handle")?;
        Ok(Some((out, err)))
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self) -> Result<Box<dyn ManagedProcess>> {
        if self.program.as_os_str().is_empty() {
            bail!("No launch program configured for '{}'", self.name);
        }
        // Bare names are resolved through PATH; explicit paths must exist.
        if self.program.components().count() > 1 && !self.program.exists() {
            bail!(
                "Launch program for '{}' not found at {}",
                self.name,
                self.program.display()
            );
        }

        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(dir) = self.resolve_working_dir() {
            command.current_dir(dir);
        }
        match self.open_log()? {
            Some((out, err)) => {
                command.stdout(out).stderr(err);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        #[cfg(unix)]
        command.process_group(0); // own group so the whole tree can be signalled

        let mut child = command.spawn().with_context(|| {
            format!(
                "Failed to spawn '{}' ({})",
                self.name,
                self.program.display()
            )
        })?;

        // Catch immediate crashes (port conflict, bad config, missing deps)
        tokio::time::sleep(Duration::from_millis(POST_SPAWN_CHECK_MS)).await;
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("Failed to check '{}' after spawn", self.name))?
        {
            bail!("'{}' exited immediately ({status})", self.name);
        }

        tracing::info!(
            backend = %self.name,
            pid = ?child.id(),
            "Spawned {}",
            self.program.display()
        );
        Ok(Box::new(ChildProcess {
            name: self.name.clone(),
            child,
        }))
    }
}

struct ChildProcess {
    name: String,
    child: Child,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let ret = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[async_trait]
impl ManagedProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };

        #[cfg(unix)]
        if let Err(e) = signal_group(pid, libc::SIGTERM) {
            tracing::warn!(backend = %self.name, "Failed to send SIGTERM to group {pid}: {e}");
        }
        #[cfg(not(unix))]
        self.child
            .start_kill()
            .with_context(|| format!("Failed to kill '{}'", self.name))?;

        let wait = self.child.wait();
        match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), wait).await {
            Ok(Ok(status)) => {
                tracing::info!(backend = %self.name, "Process {pid} exited ({status})");
                Ok(())
            }
            Ok(Err(e)) => Err(e).with_context(|| format!("Failed waiting for PID {pid}")),
            Err(_) => {
                tracing::warn!(
                    backend = %self.name,
                    "PID {pid} did not exit within {SHUTDOWN_TIMEOUT_SECS}s, killing"
                );
                #[cfg(unix)]
                let _ = signal_group(pid, libc::SIGKILL);
                self.child
                    .kill()
                    .await
                    .with_context(|| format!("PID {pid} survived SIGKILL"))
            }
        }
    }
}

// ── Log management ─────────────────────────────────────────────

pub fn log_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.log"))
}

/// Move the current log to `.log.1` before a new launch.
fn rotate_log(log: &Path) -> Result<()> {
    if log.exists() {
        let rotated = log.with_extension("log.1");
        fs::rename(log, &rotated)
            .with_context(|| format!("Failed to rotate log: {}", log.display()))?;
    }
    Ok(())
}
