use anyhow::Result;
use emu_core::{run_paths, RunResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const RUN_SUMMARY_SCHEMA_VERSION: &str = "emurun_run_summary_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfigRecord {
    pub executable: String,
    pub args: Vec<String>,
    pub trigger_pattern: String,
    pub time_limit_ms: u64,
    pub noise_marker: String,
    pub stop_signal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummaryRecord {
    pub schema_version: String,
    pub run_id: String,
    pub config: RunConfigRecord,
    pub result: RunResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub run_id: String,
    pub seq: usize,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    pub payload: Value,
}

/// Destination for the records a supervised run leaves behind.
pub trait RunSink: Send {
    fn append_event_row(&mut self, row: &EventRow) -> Result<()>;
    fn write_run_summary(&mut self, summary: &RunSummaryRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Writes `events.jsonl` and `run_summary.json` into a run directory.
pub struct JsonlRunSink {
    summary_path: PathBuf,
    events_writer: BufWriter<File>,
}

impl JsonlRunSink {
    pub fn new(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)?;
        let paths = run_paths(run_dir);
        Ok(Self {
            summary_path: paths.summary,
            events_writer: open_append(paths.events)?,
        })
    }
}

impl RunSink for JsonlRunSink {
    fn append_event_row(&mut self, row: &EventRow) -> Result<()> {
        append_row(&mut self.events_writer, row)
    }

    fn write_run_summary(&mut self, summary: &RunSummaryRecord) -> Result<()> {
        fs::write(&self.summary_path, serde_json::to_vec_pretty(summary)?)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.events_writer.flush()?;
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
