use chrono::Utc;
use emu_core::{
    sha256_file, ExitReason, LogFilter, PatternMatch, RunConfig, RunResult, StopSignal,
};
use serde_json::{json, Value};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

mod process;
mod sink;
mod tail;
mod watcher;

pub use process::{EmulatorProcess, LaunchError, Termination};
pub use sink::{
    EventRow, JsonlRunSink, RunConfigRecord, RunSink, RunSummaryRecord,
    RUN_SUMMARY_SCHEMA_VERSION,
};
pub use tail::LogTail;
pub use watcher::OutputWatcher;

pub fn new_run_id() -> String {
    format!(
        "run_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Finished,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Finished => "finished",
        }
    }

    fn can_advance_to(self, next: SupervisorState) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running)
                | (Self::Starting, Self::Finished)
                | (Self::Running, Self::Stopping)
                | (Self::Running, Self::Finished)
                | (Self::Stopping, Self::Finished)
        )
    }
}

enum RaceOutcome {
    Matched(PatternMatch),
    Exited,
    DeadlineElapsed,
}

/// Drives one emulator run from spawn to a filtered log.
///
/// `Starting -> Running -> [Stopping] -> Finished`. While running, the
/// trigger watcher, the deadline and the child's own exit race in a single
/// biased select: a match already seen wins over an exit reported in the
/// same poll, which in turn wins over the deadline. When the child exits
/// first, the rest of the log is still scanned before the run is called a
/// natural exit. The child and its process group are always reaped before
/// the raw log is filtered and the result returned. `run` consumes the
/// supervisor, so a run yields exactly one [`RunResult`].
pub struct Supervisor {
    config: RunConfig,
    run_id: String,
    sink: Option<Box<dyn RunSink>>,
    state: SupervisorState,
    seq: usize,
}

impl Supervisor {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            run_id: new_run_id(),
            sink: None,
            state: SupervisorState::Starting,
            seq: 0,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runs the emulator to completion. Once the child has been spawned the
    /// exit reason decided by the race is kept; later I/O failures are
    /// logged and only blank the affected fields of the result.
    pub async fn run(mut self) -> RunResult {
        let started_at = Utc::now().to_rfc3339();
        let clock = Instant::now();
        self.record_event(
            SupervisorState::Starting.as_str(),
            json!({
                "executable": self.config.executable.display().to_string(),
                "args": self.config.args,
            }),
        );

        let mut process = match EmulatorProcess::start(&self.config) {
            Ok(process) => process,
            Err(err) => {
                warn!(run_id = %self.run_id, error = %err, "emulator launch failed");
                let result = RunResult {
                    exit_reason: ExitReason::LaunchFailed,
                    raw_log_path: self.config.raw_log.clone(),
                    trimmed_log_path: None,
                    process_exit_code: None,
                    matched: None,
                    started_at,
                    finished_at: Utc::now().to_rfc3339(),
                    elapsed_ms: elapsed_ms(clock),
                    raw_log_digest: None,
                    launch_error: Some(err.to_string()),
                };
                self.finish(&result);
                return result;
            }
        };

        self.transition(
            SupervisorState::Running,
            json!({
                "pid": process.id(),
                "time_limit_ms": self.config.time_limit.as_millis() as u64,
                "trigger": self.config.trigger_pattern,
            }),
        );

        let (exit_reason, matched) = match self.race(&mut process).await {
            RaceOutcome::Matched(found) => {
                info!(
                    run_id = %self.run_id,
                    line_number = found.line_number,
                    line = %found.line,
                    "trigger pattern matched"
                );
                (ExitReason::PatternMatched, Some(found))
            }
            RaceOutcome::DeadlineElapsed => {
                info!(
                    run_id = %self.run_id,
                    time_limit_ms = self.config.time_limit.as_millis() as u64,
                    "time limit reached"
                );
                (ExitReason::TimedOut, None)
            }
            RaceOutcome::Exited => (ExitReason::ExitedNaturally, None),
        };
        if exit_reason.was_terminated() && !process.try_reap() {
            self.stop(&mut process, exit_reason).await;
        }

        // Cached after the race or stop; the child is reaped at this point.
        if let Err(err) = process.wait().await {
            warn!(pid = process.id(), error = %err, "failed to reap emulator");
        }

        let filter = LogFilter::new(self.config.noise_marker.clone());
        let trimmed_log_path =
            match filter.filter_file(&self.config.raw_log, &self.config.trimmed_log) {
                Ok(kept) => {
                    debug!(
                        trimmed_log = %self.config.trimmed_log.display(),
                        lines = kept,
                        "raw log filtered"
                    );
                    Some(self.config.trimmed_log.clone())
                }
                Err(err) => {
                    warn!(
                        run_id = %self.run_id,
                        error = %format!("{err:#}"),
                        "failed to write trimmed log"
                    );
                    None
                }
            };
        let raw_log_digest = match sha256_file(&self.config.raw_log) {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(error = %err, "failed to hash raw log");
                None
            }
        };

        let result = RunResult {
            exit_reason,
            raw_log_path: self.config.raw_log.clone(),
            trimmed_log_path,
            process_exit_code: process.exit_code(),
            matched,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            elapsed_ms: elapsed_ms(clock),
            raw_log_digest,
            launch_error: None,
        };
        self.finish(&result);
        result
    }

    async fn race(&self, process: &mut EmulatorProcess) -> RaceOutcome {
        let deadline = process.started_at() + self.config.time_limit;
        let tail = LogTail::new(
            &self.config.raw_log,
            &self.config.watch,
            process.exit_signal(),
        );
        let watch =
            OutputWatcher::new(self.config.trigger_pattern.clone()).watch(tail.into_stream());
        tokio::pin!(watch);
        let mut watching = true;

        loop {
            tokio::select! {
                biased;
                found = &mut watch, if watching => match found {
                    Some(found) => return RaceOutcome::Matched(found),
                    None => {
                        watching = false;
                        debug!(run_id = %self.run_id, "watcher ended without a match");
                    }
                },
                status = process.wait() => {
                    if let Err(err) = status {
                        warn!(pid = process.id(), error = %err, "failed to wait for emulator");
                        process.terminate(StopSignal::Kill);
                        return RaceOutcome::Exited;
                    }
                    if !watching {
                        return RaceOutcome::Exited;
                    }
                    // The writer is gone, so the tail drains what is left
                    // of the log and ends. A trigger in there still counts.
                    return match timeout_at(deadline, &mut watch).await {
                        Ok(Some(found)) => RaceOutcome::Matched(found),
                        Ok(None) | Err(_) => RaceOutcome::Exited,
                    };
                },
                _ = sleep_until(deadline) => return RaceOutcome::DeadlineElapsed,
            }
        }
    }

    /// Sends the configured stop signal, escalating to SIGKILL when the
    /// child outlives the kill grace period. Returns once it is reaped.
    async fn stop(&mut self, process: &mut EmulatorProcess, reason: ExitReason) {
        self.transition(
            SupervisorState::Stopping,
            json!({
                "reason": reason.as_str(),
                "signal": self.config.stop_signal.as_str(),
            }),
        );
        let delivery = process.terminate(self.config.stop_signal);
        debug!(pid = process.id(), ?delivery, "stop requested");

        match timeout(self.config.watch.kill_grace, process.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                warn!(pid = process.id(), error = %err, "failed to wait after stop signal");
                process.terminate(StopSignal::Kill);
            }
            Err(_) => {
                warn!(
                    pid = process.id(),
                    kill_grace_ms = self.config.watch.kill_grace.as_millis() as u64,
                    "emulator outlived stop signal, killing"
                );
                process.terminate(StopSignal::Kill);
                if let Err(err) = process.wait().await {
                    warn!(pid = process.id(), error = %err, "failed to wait after kill");
                }
            }
        }
    }

    fn transition(&mut self, next: SupervisorState, payload: Value) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid supervisor transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(
            run_id = %self.run_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "supervisor transition"
        );
        self.state = next;
        self.record_event(next.as_str(), payload);
    }

    fn finish(&mut self, result: &RunResult) {
        self.transition(
            SupervisorState::Finished,
            json!({
                "exit_reason": result.exit_reason.as_str(),
                "process_exit_code": result.process_exit_code,
                "elapsed_ms": result.elapsed_ms,
            }),
        );
        info!(
            run_id = %self.run_id,
            exit_reason = %result.exit_reason,
            exit_code = ?result.process_exit_code,
            elapsed_ms = result.elapsed_ms,
            "run finished"
        );

        let summary = RunSummaryRecord {
            schema_version: RUN_SUMMARY_SCHEMA_VERSION.to_string(),
            run_id: self.run_id.clone(),
            config: self.config_record(),
            result: result.clone(),
        };
        if let Some(sink) = self.sink.as_mut() {
            let written = sink
                .write_run_summary(&summary)
                .and_then(|_| sink.flush());
            if let Err(err) = written {
                warn!(run_id = %self.run_id, error = %err, "failed to write run summary");
            }
        }
    }

    fn record_event(&mut self, event_type: &str, payload: Value) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let row = EventRow {
            run_id: self.run_id.clone(),
            seq: self.seq,
            event_type: event_type.to_string(),
            ts: Some(Utc::now().to_rfc3339()),
            payload,
        };
        self.seq += 1;
        if let Err(err) = sink.append_event_row(&row) {
            warn!(run_id = %self.run_id, error = %err, "failed to record run event");
        }
    }

    fn config_record(&self) -> RunConfigRecord {
        RunConfigRecord {
            executable: self.config.executable.display().to_string(),
            args: self.config.args.clone(),
            trigger_pattern: self.config.trigger_pattern.clone(),
            time_limit_ms: self.config.time_limit.as_millis() as u64,
            noise_marker: self.config.noise_marker.clone(),
            stop_signal: self.config.stop_signal.as_str().to_string(),
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}
