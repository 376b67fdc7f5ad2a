use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

mod check;
mod config;
mod error;
mod filter;
mod result;

pub use check::{check_output, normalize_output, OutputCheck};
pub use config::{
    RunConfig, RunProfile, StopSignal, WatchSettings, DEFAULT_KILL_GRACE_MS,
    DEFAULT_NOISE_MARKER, DEFAULT_POLL_INTERVAL_MS, DEFAULT_STARTUP_GRACE_MS,
};
pub use error::ConfigError;
pub use filter::LogFilter;
pub use result::{ExitReason, PatternMatch, RunResult};

pub const DEFAULT_RUN_DIR: &str = ".emurun";
pub const RAW_LOG_FILE: &str = "output.txt";
pub const TRIMMED_LOG_FILE: &str = "filtered_output.txt";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const RUN_EVENTS_FILE: &str = "events.jsonl";

pub const EMURUN_ENV_POLL_INTERVAL_MS: &str = "EMURUN_POLL_INTERVAL_MS";
pub const EMURUN_ENV_STARTUP_GRACE_MS: &str = "EMURUN_STARTUP_GRACE_MS";
pub const EMURUN_ENV_KILL_GRACE_MS: &str = "EMURUN_KILL_GRACE_MS";

/// Files that make up one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub raw_log: PathBuf,
    pub trimmed_log: PathBuf,
    pub summary: PathBuf,
    pub events: PathBuf,
}

pub fn run_paths(run_dir: &Path) -> RunPaths {
    RunPaths {
        run_dir: run_dir.to_path_buf(),
        raw_log: run_dir.join(RAW_LOG_FILE),
        trimmed_log: run_dir.join(TRIMMED_LOG_FILE),
        summary: run_dir.join(RUN_SUMMARY_FILE),
        events: run_dir.join(RUN_EVENTS_FILE),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(sha256_bytes(&buf))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

/// Writes `bytes` to a sibling temp file and renames it over `path`, so
/// readers never observe a half-written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, pid));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
