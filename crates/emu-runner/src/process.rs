use emu_core::{RunConfig, StopSignal};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("emulator executable not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to spawn emulator {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare raw log {}: {source}", path.display())]
    LogSink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a call to [`EmulatorProcess::terminate`] actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Delivered,
    AlreadyExited,
    Undelivered,
}

/// One emulator child process. Its stdout and stderr both go straight to the
/// raw log file; this type only owns the lifecycle.
#[derive(Debug)]
pub struct EmulatorProcess {
    child: Child,
    pid: Option<u32>,
    started: Instant,
    status: Option<ExitStatus>,
    exited_tx: watch::Sender<bool>,
}

impl EmulatorProcess {
    /// Truncates the raw log, then spawns the emulator writing into it.
    pub fn start(config: &RunConfig) -> Result<Self, LaunchError> {
        let sink = open_log_sink(&config.raw_log)?;
        let sink_err = sink.try_clone().map_err(|source| LaunchError::LogSink {
            path: config.raw_log.clone(),
            source,
        })?;

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::from(sink_err))
            .kill_on_drop(true);
        // Own process group, so stop signals also reach anything the
        // emulator (or a wrapper script) forks.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                LaunchError::NotFound {
                    path: config.executable.clone(),
                }
            } else {
                LaunchError::Spawn {
                    path: config.executable.clone(),
                    source,
                }
            }
        })?;
        let started = Instant::now();
        let pid = child.id();
        let (exited_tx, _) = watch::channel(false);
        info!(
            pid,
            executable = %config.executable.display(),
            raw_log = %config.raw_log.display(),
            "emulator started"
        );
        Ok(Self {
            child,
            pid,
            started,
            status: None,
            exited_tx,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn instant; the run deadline is measured from here.
    pub fn started_at(&self) -> Instant {
        self.started
    }

    /// Flips to `true` once the exit status has been collected.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exited_tx.subscribe()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    /// Non-blocking reap. Returns whether the child is gone.
    pub fn try_reap(&mut self) -> bool {
        if self.status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(pid = self.pid, error = %err, "failed to poll emulator status");
                false
            }
        }
    }

    /// Asks the child to stop. Safe to repeat and safe after exit; delivery
    /// failures are logged, never returned.
    pub fn terminate(&mut self, signal: StopSignal) -> Termination {
        if self.try_reap() {
            debug!(pid = self.pid, %signal, "terminate skipped, emulator already exited");
            return Termination::AlreadyExited;
        }
        match self.deliver(signal) {
            Ok(()) => {
                debug!(pid = self.pid, %signal, "stop signal delivered");
                Termination::Delivered
            }
            Err(err) => {
                warn!(pid = self.pid, %signal, error = %err, "failed to signal emulator");
                Termination::Undelivered
            }
        }
    }

    /// Waits for exit and caches the status; later calls return it at once.
    /// Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.record_exit(status);
        Ok(status)
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.status = Some(status);
        self.reap_group();
        self.exited_tx.send_replace(true);
        debug!(pid = self.pid, code = status.code(), "emulator reaped");
    }

    /// Kills whatever the emulator left running in its process group, so
    /// nothing keeps appending to the raw log once the leader is gone.
    #[cfg(unix)]
    fn reap_group(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        // SAFETY: plain kill(2) on the group this child led.
        if unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) } == 0 {
            debug!(pid, "killed leftover emulator process group");
            return;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, error = %err, "failed to kill emulator process group");
        }
    }

    #[cfg(not(unix))]
    fn reap_group(&self) {}

    #[cfg(unix)]
    fn deliver(&mut self, signal: StopSignal) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let signo = match signal {
            StopSignal::Int => libc::SIGINT,
            StopSignal::Term => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        };
        let pid = pid as libc::pid_t;
        // SAFETY: plain kill(2); the child has not been reaped yet, so the
        // pid (and the group it leads) still belongs to it.
        if unsafe { libc::kill(-pid, signo) } == 0 {
            return Ok(());
        }
        if unsafe { libc::kill(pid, signo) } == 0 {
            return Ok(());
        }
        Err(io::Error::last_os_error())
    }

    #[cfg(not(unix))]
    fn deliver(&mut self, _signal: StopSignal) -> io::Result<()> {
        self.child.start_kill()
    }
}

impl Drop for EmulatorProcess {
    fn drop(&mut self) {
        // kill_on_drop only reaches the leader; take the group down with it.
        if self.status.is_none() {
            let _ = self.deliver(StopSignal::Kill);
        }
    }
}

fn open_log_sink(path: &Path) -> Result<File, LaunchError> {
    let sink_error = |source: io::Error| LaunchError::LogSink {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(sink_error)?;
    }
    File::create(path).map_err(sink_error)
}
