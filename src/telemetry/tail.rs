// =============================================================================
// JSONL tailer — push file-backed append streams to live subscribers
// =============================================================================
//
// One tailer task per subscriber. The task waits for the file to appear
// (exponential backoff, bounded), then follows appends line by line, sleeping
// briefly on EOF. Frames are pushed into a bounded channel; when the
// subscriber goes away the channel closes and the task exits on its next
// send. Within one file, subscribers observe lines in exact write order.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

/// One frame pushed to a subscriber: a named event with a JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TailFrame {
    pub event: &'static str,
    pub data: String,
}

impl TailFrame {
    pub fn new(event: &'static str, data: impl Into<String>) -> Self {
        Self {
            event,
            data: data.into(),
        }
    }
}

/// Tuning knobs for a tail loop. Defaults match the streaming contract:
/// 100 ms initial backoff growing 1.5x to a 2 s ceiling, 60 s total wait for
/// the file, 250 ms poll on EOF.
#[derive(Debug, Clone)]
pub struct TailOptions {
    pub from_start: bool,
    /// Event name for data frames ("bar" for per-bar files, "event" for
    /// event files).
    pub event_name: &'static str,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub appear_timeout: Duration,
    pub eof_poll: Duration,
}

impl TailOptions {
    pub fn new(event_name: &'static str, from_start: bool) -> Self {
        Self {
            from_start,
            event_name,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            appear_timeout: Duration::from_secs(60),
            eof_poll: Duration::from_millis(250),
        }
    }
}

/// Tail `path` and forward frames into `tx` until the subscriber hangs up.
///
/// If the file never appears within the configured ceiling, a terminal
/// `error` frame is emitted and the loop ends.
pub async fn tail_jsonl(path: PathBuf, opts: TailOptions, tx: mpsc::Sender<TailFrame>) {
    // Wait for the file to appear with exponential backoff.
    let mut delay = opts.initial_backoff;
    let mut waited = Duration::ZERO;
    while !path.exists() {
        if waited >= opts.appear_timeout {
            let _ = tx
                .send(TailFrame::new("error", r#"{"error": "file_not_found"}"#))
                .await;
            return;
        }
        tokio::time::sleep(delay).await;
        waited += delay;
        delay = std::cmp::min(delay.mul_f64(1.5), opts.max_backoff);
    }

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "tail open failed");
            let _ = tx
                .send(TailFrame::new("error", r#"{"error": "file_not_found"}"#))
                .await;
            return;
        }
    };

    let mut reader = BufReader::new(file);
    if !opts.from_start {
        use tokio::io::AsyncSeekExt;
        if reader.seek(std::io::SeekFrom::End(0)).await.is_err() {
            return;
        }
    }

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            // EOF: wait for more appends.
            Ok(0) => tokio::time::sleep(opts.eof_poll).await,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                // Sanity: forward JSON verbatim, wrap anything else.
                let payload = if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
                    trimmed.to_string()
                } else {
                    serde_json::json!({ "raw": trimmed }).to_string()
                };
                if tx.send(TailFrame::new(opts.event_name, payload)).await.is_err() {
                    // Subscriber dropped; free the tailer.
                    return;
                }
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "tail read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fast_opts(event_name: &'static str, from_start: bool) -> TailOptions {
        TailOptions {
            from_start,
            event_name,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            appear_timeout: Duration::from_millis(100),
            eof_poll: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn from_start_replays_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_telemetry.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..5 {
            writeln!(f, "{{\"bar_idx\": {i}}}").unwrap();
        }
        drop(f);

        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(tail_jsonl(path, fast_opts("bar", true), tx));

        let mut frames = Vec::new();
        for _ in 0..5 {
            frames.push(rx.recv().await.unwrap());
        }
        handle.abort();

        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.event, "bar");
            let v: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
            assert_eq!(v["bar_idx"], i as i64);
        }
    }

    #[tokio::test]
    async fn from_end_only_sees_fresh_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_telemetry.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{{\"bar_idx\": 0}}").unwrap();
        f.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(tail_jsonl(path.clone(), fast_opts("bar", false), tx));

        // Give the tailer time to seek to the end, then append.
        tokio::time::sleep(Duration::from_millis(50)).await;
        writeln!(f, "{{\"bar_idx\": 1}}").unwrap();
        f.flush().unwrap();

        let frame = rx.recv().await.unwrap();
        handle.abort();
        let v: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(v["bar_idx"], 1);
    }

    #[tokio::test]
    async fn missing_file_emits_terminal_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never_created.jsonl");

        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(tail_jsonl(path, fast_opts("bar", true), tx));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "error");
        assert!(frame.data.contains("file_not_found"));
        // Channel closes after the terminal frame.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn non_json_lines_are_wrapped_as_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_events.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "plain text line").unwrap();
        drop(f);

        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(tail_jsonl(path, fast_opts("event", true), tx));

        let frame = rx.recv().await.unwrap();
        handle.abort();
        assert_eq!(frame.event, "event");
        let v: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(v["raw"], "plain text line");
    }

    #[tokio::test]
    async fn dropped_subscriber_ends_the_tailer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_telemetry.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{{\"bar_idx\": 0}}").unwrap();
        f.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(tail_jsonl(path, fast_opts("bar", true), tx));

        // Receive one frame, then hang up.
        let _ = rx.recv().await.unwrap();
        drop(rx);

        writeln!(f, "{{\"bar_idx\": 1}}").unwrap();
        f.flush().unwrap();

        // The tailer must exit on its next send attempt.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("tailer did not stop after subscriber dropped")
            .unwrap();
    }
}
