use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How a supervised run ended. Exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    PatternMatched,
    TimedOut,
    ExitedNaturally,
    LaunchFailed,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PatternMatched => "pattern_matched",
            Self::TimedOut => "timed_out",
            Self::ExitedNaturally => "exited_naturally",
            Self::LaunchFailed => "launch_failed",
        }
    }

    /// Whether this reason has the supervisor stop a child that is still
    /// running.
    pub fn was_terminated(self) -> bool {
        matches!(self, Self::PatternMatched | Self::TimedOut)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    /// 1-based line number within the raw log.
    pub line_number: usize,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub exit_reason: ExitReason,
    pub raw_log_path: PathBuf,
    /// Absent when the emulator never launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trimmed_log_path: Option<PathBuf>,
    /// `None` when the child was killed by a signal or never started.
    pub process_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<PatternMatch>,
    pub started_at: String,
    pub finished_at: String,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_log_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_serializes_as_snake_case() {
        for reason in [
            ExitReason::PatternMatched,
            ExitReason::TimedOut,
            ExitReason::ExitedNaturally,
            ExitReason::LaunchFailed,
        ] {
            let yaml = serde_yaml::to_string(&reason).expect("serialize");
            assert_eq!(yaml.trim(), reason.as_str());
        }
    }

    #[test]
    fn only_supervisor_stops_count_as_terminated() {
        assert!(ExitReason::PatternMatched.was_terminated());
        assert!(ExitReason::TimedOut.was_terminated());
        assert!(!ExitReason::ExitedNaturally.was_terminated());
        assert!(!ExitReason::LaunchFailed.was_terminated());
    }
}
