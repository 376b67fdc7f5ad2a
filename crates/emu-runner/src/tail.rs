use emu_core::WatchSettings;
use futures_util::stream::{self, Stream};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Follows a log file while another process appends to it.
///
/// Yields complete lines in write order. A trailing line without a newline
/// is held back until its newline arrives or the writer is gone. The tail
/// ends once the writer has exited and the file has been drained, so it
/// never waits on a dead process. If the file does not show up within the
/// startup grace period, or reading fails, the tail ends early and logs why.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    poll_interval: Duration,
    startup_grace: Duration,
    writer_done: watch::Receiver<bool>,
    reader: Option<BufReader<File>>,
    pending: Vec<u8>,
    draining: bool,
    finished: bool,
}

impl LogTail {
    pub fn new(path: &Path, settings: &WatchSettings, writer_done: watch::Receiver<bool>) -> Self {
        Self {
            path: path.to_path_buf(),
            poll_interval: settings.poll_interval,
            startup_grace: settings.startup_grace,
            writer_done,
            reader: None,
            pending: Vec::new(),
            draining: false,
            finished: false,
        }
    }

    /// Next complete line, or `None` once the tail has ended. Partial reads
    /// are kept in `self`, so dropping the returned future loses nothing.
    pub async fn next_line(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        if self.reader.is_none() {
            match self.open().await {
                Ok(reader) => self.reader = Some(reader),
                Err(reason) => {
                    warn!(path = %self.path.display(), %reason, "log tail stopped before reading");
                    self.finished = true;
                    return None;
                }
            }
        }

        loop {
            let reader = self.reader.as_mut()?;
            match reader.read_until(b'\n', &mut self.pending).await {
                Ok(0) => {
                    if self.draining {
                        self.finished = true;
                        return self.take_partial();
                    }
                    if self.writer_finished() {
                        // One more pass picks up anything written between
                        // our last read and the writer's exit.
                        self.draining = true;
                        continue;
                    }
                    self.wait_for_growth().await;
                }
                Ok(_) => {
                    if self.pending.ends_with(b"\n") {
                        return Some(self.take_line());
                    }
                }
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "log tail read failed");
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// The tail as a lazy stream of lines.
    pub fn into_stream(self) -> impl Stream<Item = String> {
        stream::unfold(self, |mut tail| async move {
            let line = tail.next_line().await?;
            Some((line, tail))
        })
    }

    async fn open(&mut self) -> Result<BufReader<File>, String> {
        let deadline = Instant::now() + self.startup_grace;
        loop {
            match File::open(&self.path).await {
                Ok(file) => {
                    debug!(path = %self.path.display(), "log tail attached");
                    return Ok(BufReader::new(file));
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if self.writer_finished() {
                        return Err("writer exited without creating the log".to_string());
                    }
                    if Instant::now() >= deadline {
                        return Err(format!(
                            "log did not appear within {:?}",
                            self.startup_grace
                        ));
                    }
                    sleep(self.poll_interval).await;
                }
                Err(err) => return Err(err.to_string()),
            }
        }
    }

    fn writer_finished(&self) -> bool {
        *self.writer_done.borrow() || self.writer_done.has_changed().is_err()
    }

    async fn wait_for_growth(&mut self) {
        tokio::select! {
            _ = sleep(self.poll_interval) => {}
            _ = self.writer_done.changed() => {}
        }
    }

    fn take_line(&mut self) -> String {
        let mut end = self.pending.len() - 1;
        if end > 0 && self.pending[end - 1] == b'\r' {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&self.pending[..end]).into_owned();
        self.pending.clear();
        line
    }

    fn take_partial(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        if self.pending.last() == Some(&b'\r') {
            self.pending.pop();
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::io::Write;

    fn fast_settings() -> WatchSettings {
        WatchSettings {
            poll_interval: Duration::from_millis(10),
            startup_grace: Duration::from_millis(300),
            kill_grace: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn yields_lines_written_before_and_after_attach() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("output.txt");
        let mut writer = std::fs::File::create(&path).expect("create");
        writer.write_all(b"first\r\nsec").expect("write");
        writer.flush().expect("flush");

        let (done_tx, done_rx) = watch::channel(false);
        let mut tail = LogTail::new(&path, &fast_settings(), done_rx);
        assert_eq!(tail.next_line().await.as_deref(), Some("first"));

        let appender = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            writer.write_all(b"ond\nthird\nunterminated").expect("append");
            writer.flush().expect("flush");
            sleep(Duration::from_millis(50)).await;
            done_tx.send_replace(true);
        });

        assert_eq!(tail.next_line().await.as_deref(), Some("second"));
        assert_eq!(tail.next_line().await.as_deref(), Some("third"));
        assert_eq!(tail.next_line().await.as_deref(), Some("unterminated"));
        assert_eq!(tail.next_line().await, None);
        assert_eq!(tail.next_line().await, None);
        appender.await.expect("appender");
    }

    #[tokio::test]
    async fn waits_for_log_to_appear() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("late.txt");
        let (done_tx, done_rx) = watch::channel(false);
        let lines = LogTail::new(&path, &fast_settings(), done_rx).into_stream();

        let creator_path = path.clone();
        let creator = tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            std::fs::write(&creator_path, "booted\n").expect("write");
            done_tx.send_replace(true);
        });

        let collected: Vec<String> = lines.collect().await;
        assert_eq!(collected, vec!["booted".to_string()]);
        creator.await.expect("creator");
    }

    #[tokio::test]
    async fn gives_up_after_startup_grace() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (_done_tx, done_rx) = watch::channel(false);
        let mut tail = LogTail::new(&dir.path().join("never.txt"), &fast_settings(), done_rx);

        let started = Instant::now();
        assert_eq!(tail.next_line().await, None);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300), "{waited:?}");
        assert!(waited < Duration::from_secs(3), "{waited:?}");
    }

    #[tokio::test]
    async fn ends_when_writer_is_dropped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("output.txt");
        std::fs::write(&path, "a\nb\n").expect("write");
        let (done_tx, done_rx) = watch::channel(false);
        drop(done_tx);

        let collected: Vec<String> = LogTail::new(&path, &fast_settings(), done_rx)
            .into_stream()
            .collect()
            .await;
        assert_eq!(collected, vec!["a".to_string(), "b".to_string()]);
    }
}
