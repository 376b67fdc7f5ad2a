use crate::atomic_write_bytes;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Trims a raw emulator log down to the part worth reading.
///
/// Everything up to and including the first line containing the marker is
/// dropped, then the final line is dropped as well (a run stopped by a
/// signal usually leaves a torn last line). When the marker never appears
/// the result is empty; the whole log is never passed through unfiltered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    marker: String,
}

impl LogFilter {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn filter_lines<'a, I>(&self, lines: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut lines = lines.into_iter();
        if !lines.by_ref().any(|line| line.contains(self.marker.as_str())) {
            return Vec::new();
        }
        let mut kept: Vec<&'a str> = lines.collect();
        kept.pop();
        kept
    }

    /// Filters newline-delimited text; every kept line is newline-terminated.
    pub fn filter_text(&self, raw: &str) -> String {
        let mut out = String::new();
        for line in self.filter_lines(raw.lines()) {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Filters `raw` into `trimmed` and returns the number of lines kept.
    /// Bytes that are not valid UTF-8 are replaced rather than rejected.
    pub fn filter_file(&self, raw: &Path, trimmed: &Path) -> Result<usize> {
        let bytes =
            fs::read(raw).with_context(|| format!("read raw log {}", raw.display()))?;
        let text = String::from_utf8_lossy(&bytes);
        let out = self.filter_text(&text);
        atomic_write_bytes(trimmed, out.as_bytes())
            .with_context(|| format!("write trimmed log {}", trimmed.display()))?;
        Ok(out.lines().count())
    }
}
