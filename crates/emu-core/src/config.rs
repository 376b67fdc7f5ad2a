use crate::error::ConfigError;
use crate::{
    run_paths, EMURUN_ENV_KILL_GRACE_MS, EMURUN_ENV_POLL_INTERVAL_MS, EMURUN_ENV_STARTUP_GRACE_MS,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// ESP-IDF prints this right before handing control to user code; everything
/// above it is bootloader and startup noise.
pub const DEFAULT_NOISE_MARKER: &str = "main_task: Calling app_main()";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_STARTUP_GRACE_MS: u64 = 5_000;
pub const DEFAULT_KILL_GRACE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSignal {
    Int,
    #[default]
    Term,
    Kill,
}

impl StopSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Term => "term",
            Self::Kill => "kill",
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopSignal {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.strip_prefix("sig").unwrap_or(&lowered) {
            "int" => Ok(Self::Int),
            "term" => Ok(Self::Term),
            "kill" => Ok(Self::Kill),
            _ => Err(ConfigError::UnknownSignal(s.to_string())),
        }
    }
}

/// Timings for tailing the raw log and for escalating termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    /// How long the tail waits for the log file to appear before giving up.
    pub startup_grace: Duration,
    /// How long a stop signal gets before the child is killed outright.
    pub kill_grace: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            startup_grace: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
        }
    }
}

impl WatchSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_optional_u64_env(&lookup, EMURUN_ENV_POLL_INTERVAL_MS)? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_optional_u64_env(&lookup, EMURUN_ENV_STARTUP_GRACE_MS)? {
            self.startup_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_optional_u64_env(&lookup, EMURUN_ENV_KILL_GRACE_MS)? {
            self.kill_grace = Duration::from_millis(ms);
        }
        Ok(self)
    }
}

fn parse_optional_u64_env<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value: raw.clone(),
        })
}

/// Everything one supervised run needs. Not modified once the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub trigger_pattern: String,
    pub time_limit: Duration,
    pub raw_log: PathBuf,
    pub trimmed_log: PathBuf,
    pub noise_marker: String,
    pub stop_signal: StopSignal,
    pub watch: WatchSettings,
}

impl RunConfig {
    /// Config with default marker, stop signal and timings, logging into `run_dir`.
    pub fn new(
        executable: impl Into<PathBuf>,
        trigger_pattern: impl Into<String>,
        time_limit: Duration,
        run_dir: &Path,
    ) -> Self {
        let paths = run_paths(run_dir);
        Self {
            executable: executable.into(),
            args: Vec::new(),
            trigger_pattern: trigger_pattern.into(),
            time_limit,
            raw_log: paths.raw_log,
            trimmed_log: paths.trimmed_log,
            noise_marker: DEFAULT_NOISE_MARKER.to_string(),
            stop_signal: StopSignal::default(),
            watch: WatchSettings::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executable.as_os_str().is_empty() {
            return Err(ConfigError::Missing("executable"));
        }
        if self.trigger_pattern.is_empty() {
            return Err(ConfigError::Empty("trigger"));
        }
        if self.time_limit.is_zero() {
            return Err(ConfigError::InvalidTimeLimit(format!(
                "{}",
                self.time_limit.as_secs_f64()
            )));
        }
        if self.noise_marker.is_empty() {
            return Err(ConfigError::Empty("marker"));
        }
        if self.watch.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}

/// Partial run settings as read from a profile file or assembled from CLI
/// flags. Profiles are layered with [`RunProfile::merged_with`] and turned
/// into a [`RunConfig`] by [`RunProfile::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_log: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trimmed_log: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<StopSignal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_grace_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_grace_ms: Option<u64>,
}

impl RunProfile {
    /// Reads a YAML profile. JSON is valid YAML, so `.json` profiles load too.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("read run profile {}", path.display()))?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&data)
            .with_context(|| format!("parse run profile {}", path.display()))
    }

    /// Layers `overrides` on top of `self`; any field set in `overrides` wins.
    pub fn merged_with(self, overrides: RunProfile) -> RunProfile {
        RunProfile {
            executable: overrides.executable.or(self.executable),
            args: overrides.args.or(self.args),
            trigger: overrides.trigger.or(self.trigger),
            time_limit_secs: overrides.time_limit_secs.or(self.time_limit_secs),
            marker: overrides.marker.or(self.marker),
            raw_log: overrides.raw_log.or(self.raw_log),
            trimmed_log: overrides.trimmed_log.or(self.trimmed_log),
            stop_signal: overrides.stop_signal.or(self.stop_signal),
            poll_interval_ms: overrides.poll_interval_ms.or(self.poll_interval_ms),
            startup_grace_ms: overrides.startup_grace_ms.or(self.startup_grace_ms),
            kill_grace_ms: overrides.kill_grace_ms.or(self.kill_grace_ms),
        }
    }

    /// Fills unset fields from defaults, applies environment overrides to
    /// the watch timings, and validates the result.
    pub fn resolve<F>(self, run_dir: &Path, env: F) -> Result<RunConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let executable = self.executable.ok_or(ConfigError::Missing("executable"))?;
        let trigger = self.trigger.ok_or(ConfigError::Missing("trigger"))?;
        let secs = self
            .time_limit_secs
            .ok_or(ConfigError::Missing("time_limit"))?;
        let time_limit = time_limit_from_secs(secs)?;

        let mut watch = WatchSettings::default();
        if let Some(ms) = self.poll_interval_ms {
            watch.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.startup_grace_ms {
            watch.startup_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.kill_grace_ms {
            watch.kill_grace = Duration::from_millis(ms);
        }
        let watch = watch.with_env_overrides(env)?;

        let paths = run_paths(run_dir);
        let config = RunConfig {
            executable,
            args: self.args.unwrap_or_default(),
            trigger_pattern: trigger,
            time_limit,
            raw_log: self.raw_log.unwrap_or(paths.raw_log),
            trimmed_log: self.trimmed_log.unwrap_or(paths.trimmed_log),
            noise_marker: self
                .marker
                .unwrap_or_else(|| DEFAULT_NOISE_MARKER.to_string()),
            stop_signal: self.stop_signal.unwrap_or_default(),
            watch,
        };
        config.validate()?;
        Ok(config)
    }
}

fn time_limit_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidTimeLimit(secs.to_string()));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidTimeLimit(secs.to_string()))
}
