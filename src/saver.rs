//! Per-step log aggregation.
//!
//! A `StepSaver` owns every chunk for one build step. Records are
//! split into fixed-size chunks; a sealed chunk is saved in the
//! background as soon as rotation seals it, and a periodic ticker
//! flushes whatever is dirty so uploaded data is never more than one
//! interval stale.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::chunk::Chunk;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::record::{LogRecord, StoredRecord};
use crate::reporter::StepLineReporter;
use crate::tasks::TaskSet;
use crate::uploader::Uploader;

/// Aggregates, chunks, and uploads the records of a single step.
pub struct StepSaver {
    inner: Arc<SaverInner>,
    /// Rotation saves and the flush ticker; joined during close.
    tasks: TaskSet,
    ticker_shutdown: Arc<Notify>,
}

struct SaverInner {
    step_name: String,
    uploader: Arc<dyn Uploader>,
    reporter: Arc<dyn StepLineReporter>,
    lines_per_chunk: usize,
    max_line_size: usize,
    state: StdMutex<SaverState>,
}

struct SaverState {
    /// Records seen for this step; only ever increases.
    line_count: usize,
    chunks: Vec<Arc<Chunk>>,
}

impl StepSaver {
    /// Create a saver for `step_name` and start its flush ticker.
    pub fn new(
        step_name: &str,
        uploader: Arc<dyn Uploader>,
        reporter: Arc<dyn StepLineReporter>,
        config: &Config,
    ) -> Self {
        let inner = Arc::new(SaverInner {
            step_name: step_name.to_string(),
            uploader,
            reporter,
            lines_per_chunk: config.lines_per_chunk.max(1),
            max_line_size: config.max_line_size,
            state: StdMutex::new(SaverState {
                line_count: 0,
                chunks: Vec::new(),
            }),
        });

        let tasks = TaskSet::new();
        let ticker_shutdown = Arc::new(Notify::new());

        let ticker_inner = inner.clone();
        let shutdown = ticker_shutdown.clone();
        let interval = config.upload_interval;
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; there is nothing
            // to flush yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Failures are logged in flush_all and retried
                        // on the next tick or at close.
                        let _ = ticker_inner.flush_all().await;
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });

        Self {
            inner,
            tasks,
            ticker_shutdown,
        }
    }

    pub fn step_name(&self) -> &str {
        &self.inner.step_name
    }

    /// Records seen so far.
    pub fn line_count(&self) -> usize {
        self.inner.state.lock().expect("mutex poisoned").line_count
    }

    /// Convert a record to storage form and append it to the active
    /// chunk, rotating first if the chunk is full.
    ///
    /// The line count advances even when the write fails, keeping
    /// sequence numbers monotonic and chunk selection arithmetic
    /// stable across a transient error.
    pub async fn write_record(&self, record: &LogRecord) -> Result<()> {
        let result = self.append(record).await;
        self.inner.state.lock().expect("mutex poisoned").line_count += 1;
        result
    }

    async fn append(&self, record: &LogRecord) -> Result<()> {
        let sequence = self.line_count();
        let stored = StoredRecord::from_record(record, sequence, self.inner.max_line_size);
        let mut line = serde_json::to_vec(&stored).map_err(Error::Encode)?;
        line.push(b'\n');

        let chunk = self.select_chunk(sequence / self.inner.lines_per_chunk)?;
        chunk.append_line(&line).await
    }

    /// Chunk for `index`, creating it (and sealing the previous one)
    /// when rotation has just crossed the boundary.
    fn select_chunk(&self, index: usize) -> Result<Arc<Chunk>> {
        let mut state = self.inner.state.lock().expect("mutex poisoned");

        // A failed creation can leave the list short of the index;
        // the loop catches up instead of indexing past the end.
        while index >= state.chunks.len() {
            if let Some(previous) = state.chunks.last().cloned() {
                // Seal the rotated-out chunk right away instead of
                // waiting for the ticker. Best effort; the ticker and
                // close retry anything that fails here.
                let step = self.inner.step_name.clone();
                self.tasks.spawn(async move {
                    if let Err(e) = previous.save().await {
                        warn!(
                            step = %step,
                            chunk = %previous.store_path(),
                            error = %e,
                            "rotation save failed"
                        );
                    }
                });
            }

            let next = state.chunks.len();
            info!(step = %self.inner.step_name, chunk = next, "starting new chunk");
            let destination = format!("{}/log.{}", self.inner.step_name, next);
            let chunk = Arc::new(Chunk::new(destination, self.inner.uploader.clone())?);
            state.chunks.push(chunk);
        }

        Ok(state.chunks[index].clone())
    }

    /// Upload every chunk with unsaved lines, concurrently.
    pub async fn flush_all(&self) -> Result<()> {
        self.inner.flush_all().await
    }

    /// Stop the ticker, drain background saves, flush one last time,
    /// release chunk storage, and report the final line count.
    ///
    /// Storage is released even when the final flush fails; the error
    /// is still propagated, since this was the last chance to persist.
    pub async fn close(self) -> Result<()> {
        self.ticker_shutdown.notify_one();
        self.tasks.shutdown().await;

        let flush_result = self.inner.flush_all().await;

        let chunks = self.inner.chunks();
        for chunk in &chunks {
            chunk.close().await;
        }
        flush_result?;

        let lines = self.line_count();
        self.inner.reporter.report(&self.inner.step_name, lines).await?;
        info!(step = %self.inner.step_name, lines, "completed step processing");
        Ok(())
    }
}

impl SaverInner {
    fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.state.lock().expect("mutex poisoned").chunks.clone()
    }

    /// Save all chunks concurrently, logging each failure; the first
    /// error is returned once every save has settled.
    async fn flush_all(&self) -> Result<()> {
        let chunks = self.chunks();
        let results = futures::future::join_all(chunks.iter().map(|c| c.save())).await;

        let mut first_err = None;
        for (chunk, result) in chunks.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    step = %self.step_name,
                    chunk = %chunk.store_path(),
                    error = %e,
                    "chunk flush failed"
                );
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordingReporter, RecordingUploader};
    use std::time::Duration;

    fn test_config(lines_per_chunk: usize) -> Config {
        Config {
            lines_per_chunk,
            // Keep the ticker out of the way unless a test wants it.
            upload_interval: Duration::from_secs(3600),
            ..Config::default()
        }
    }

    fn record(message: &str) -> LogRecord {
        LogRecord {
            time: 1234,
            message: message.to_string(),
            step: "testStep".to_string(),
        }
    }

    fn saver(
        uploader: &Arc<RecordingUploader>,
        reporter: &Arc<RecordingReporter>,
        config: &Config,
    ) -> StepSaver {
        let uploader: Arc<dyn Uploader> = uploader.clone();
        let reporter: Arc<dyn StepLineReporter> = reporter.clone();
        StepSaver::new("testStep", uploader, reporter, config)
    }

    fn parse_sequences(content: &str) -> Vec<usize> {
        content
            .lines()
            .map(|l| {
                let stored: StoredRecord = serde_json::from_str(l).unwrap();
                stored.line
            })
            .collect()
    }

    #[tokio::test]
    async fn splits_records_into_ceil_n_over_l_chunks() {
        let uploader = Arc::new(RecordingUploader::new());
        let reporter = Arc::new(RecordingReporter::new());
        let s = saver(&uploader, &reporter, &test_config(3));

        for i in 0..7 {
            s.write_record(&record(&format!("line {i}"))).await.unwrap();
        }
        s.close().await.unwrap();

        let mut latest = uploader.latest_by_destination();
        latest.sort();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].0, "testStep/log.0");
        assert_eq!(parse_sequences(&latest[0].1), vec![0, 1, 2]);
        assert_eq!(latest[1].0, "testStep/log.1");
        assert_eq!(parse_sequences(&latest[1].1), vec![3, 4, 5]);
        assert_eq!(latest[2].0, "testStep/log.2");
        assert_eq!(parse_sequences(&latest[2].1), vec![6]);
    }

    #[tokio::test]
    async fn rotation_saves_the_sealed_chunk_once_in_the_background() {
        let uploader = Arc::new(RecordingUploader::new());
        let reporter = Arc::new(RecordingReporter::new());
        let s = saver(&uploader, &reporter, &test_config(3));

        // Fill chunk 0 and write one record into chunk 1.
        for i in 0..4 {
            s.write_record(&record(&format!("line {i}"))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Exactly one save, for the rotated-out chunk only.
        let uploads = uploader.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "testStep/log.0");
        assert_eq!(parse_sequences(&uploads[0].1), vec![0, 1, 2]);

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn ticker_flushes_below_the_rotation_threshold() {
        let uploader = Arc::new(RecordingUploader::new());
        let reporter = Arc::new(RecordingReporter::new());
        let config = Config {
            upload_interval: Duration::from_millis(20),
            ..test_config(100)
        };
        let s = saver(&uploader, &reporter, &config);

        s.write_record(&record("only line")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let uploads = uploader.uploads();
        assert!(!uploads.is_empty(), "ticker never flushed");
        assert_eq!(uploads[0].0, "testStep/log.0");

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_flushes_everything_and_reports_once() {
        let uploader = Arc::new(RecordingUploader::new());
        let reporter = Arc::new(RecordingReporter::new());
        let s = saver(&uploader, &reporter, &test_config(10));

        for i in 0..5 {
            s.write_record(&record(&format!("line {i}"))).await.unwrap();
        }
        s.close().await.unwrap();

        let latest = uploader.latest_by_destination();
        assert_eq!(latest.len(), 1);
        assert_eq!(parse_sequences(&latest[0].1), vec![0, 1, 2, 3, 4]);
        assert_eq!(reporter.reports(), vec![("testStep".to_string(), 5)]);
    }

    #[tokio::test]
    async fn close_propagates_final_flush_failure_without_reporting() {
        let uploader = Arc::new(RecordingUploader::failing(usize::MAX));
        let reporter = Arc::new(RecordingReporter::new());
        let s = saver(&uploader, &reporter, &test_config(10));

        s.write_record(&record("doomed")).await.unwrap();
        let err = s.close().await.unwrap_err();

        assert!(matches!(err, Error::Store { .. }), "got: {err}");
        assert!(reporter.reports().is_empty());
    }

    #[tokio::test]
    async fn close_propagates_report_failure() {
        let uploader = Arc::new(RecordingUploader::new());
        let reporter = Arc::new(RecordingReporter::failing());
        let s = saver(&uploader, &reporter, &test_config(10));

        s.write_record(&record("line")).await.unwrap();
        let err = s.close().await.unwrap_err();

        assert!(matches!(err, Error::Report { .. }), "got: {err}");
        // The report was attempted exactly once.
        assert_eq!(reporter.reports().len(), 1);
    }

    #[tokio::test]
    async fn empty_step_reports_zero_lines() {
        let uploader = Arc::new(RecordingUploader::new());
        let reporter = Arc::new(RecordingReporter::new());
        let s = saver(&uploader, &reporter, &test_config(10));

        s.close().await.unwrap();

        assert!(uploader.uploads().is_empty());
        assert_eq!(reporter.reports(), vec![("testStep".to_string(), 0)]);
    }

    #[tokio::test]
    async fn long_messages_are_truncated_in_storage() {
        let uploader = Arc::new(RecordingUploader::new());
        let reporter = Arc::new(RecordingReporter::new());
        let config = Config {
            max_line_size: 8,
            ..test_config(10)
        };
        let s = saver(&uploader, &reporter, &config);

        s.write_record(&record("0123456789")).await.unwrap();
        s.close().await.unwrap();

        let uploads = uploader.uploads();
        let stored: StoredRecord = serde_json::from_str(uploads[0].1.lines().next().unwrap()).unwrap();
        assert_eq!(stored.message, "01234567 [line truncated after 8 characters]");
    }
}
