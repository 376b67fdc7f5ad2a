use emu_core::PatternMatch;
use futures_util::{Stream, StreamExt};
use tracing::debug;

/// Scans a line stream for the first line containing the trigger pattern.
///
/// [`OutputWatcher::watch`] consumes the watcher, so it can report at most
/// one match.
#[derive(Debug, Clone)]
pub struct OutputWatcher {
    pattern: String,
}

impl OutputWatcher {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Resolves with the first matching line, or `None` once the stream ends
    /// without one.
    pub async fn watch<S>(self, lines: S) -> Option<PatternMatch>
    where
        S: Stream<Item = String>,
    {
        futures_util::pin_mut!(lines);
        let mut line_number = 0usize;
        while let Some(line) = lines.next().await {
            line_number += 1;
            if line.contains(self.pattern.as_str()) {
                debug!(line_number, pattern = %self.pattern, "trigger pattern seen");
                return Some(PatternMatch { line_number, line });
            }
        }
        debug!(lines = line_number, pattern = %self.pattern, "log ended without trigger");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn lines(items: &[&str]) -> impl Stream<Item = String> {
        stream::iter(items.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn first_matching_line_wins() {
        let found = OutputWatcher::new("watchdog")
            .watch(lines(&[
                "I (10) boot: ok",
                "E (20) task_wdt: Task watchdog got triggered",
                "E (30) task_wdt: watchdog again",
            ]))
            .await
            .expect("match");
        assert_eq!(found.line_number, 2);
        assert_eq!(found.line, "E (20) task_wdt: Task watchdog got triggered");
    }

    #[tokio::test]
    async fn stream_end_without_match_returns_none() {
        let found = OutputWatcher::new("Guru Meditation")
            .watch(lines(&["a", "b"]))
            .await;
        assert_eq!(found, None);
        assert_eq!(OutputWatcher::new("x").watch(lines(&[])).await, None);
    }

    #[tokio::test]
    async fn stops_pulling_lines_after_match() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let source = lines(&["x", "HIT", "y", "z"]).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let found = OutputWatcher::new("HIT").watch(source).await;
        assert!(found.is_some());
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }
}
