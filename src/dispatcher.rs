//! Demultiplexes the emitter stream into per-step savers.
//!
//! The emitter writes records for one step at a time; a change in the
//! step field is a step boundary. The finished step's saver is closed
//! in the background so a slow final flush never stalls ingestion, and
//! end-of-stream waits on every outstanding close before the run can
//! report success.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::record::LogRecord;
use crate::reporter::StepLineReporter;
use crate::saver::StepSaver;
use crate::tasks::TaskSet;
use crate::uploader::Uploader;

/// Reads the record stream and routes each record to the saver for
/// its step.
pub struct Dispatcher {
    uploader: Arc<dyn Uploader>,
    reporter: Arc<dyn StepLineReporter>,
    config: Config,
}

impl Dispatcher {
    pub fn new(
        uploader: Arc<dyn Uploader>,
        reporter: Arc<dyn StepLineReporter>,
        config: Config,
    ) -> Self {
        Self {
            uploader,
            reporter,
            config,
        }
    }

    /// Consume the stream until EOF.
    ///
    /// A record that fails to decode aborts the run: the emitter is a
    /// trusted producer, so corrupt input means something upstream is
    /// broken and continuing would mis-sequence every later record.
    ///
    /// Steps are assumed to arrive as contiguous runs; a step name
    /// never legitimately reappears after being superseded.
    pub async fn run<R>(&self, reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let closes = TaskSet::new();
        let mut active: Option<StepSaver> = None;

        let mut lines = reader.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return Err(Error::io("emitter", e)),
            };

            let record: LogRecord =
                serde_json::from_str(&line).map_err(|e| Error::MalformedRecord {
                    line: line.clone(),
                    source: e,
                })?;

            let boundary = active
                .as_ref()
                .is_none_or(|saver| saver.step_name() != record.step);
            if boundary {
                if let Some(finished) = active.take() {
                    Self::close_in_background(&closes, finished);
                }
                info!(step = %record.step, "processing step");
                active = Some(StepSaver::new(
                    &record.step,
                    self.uploader.clone(),
                    self.reporter.clone(),
                    &self.config,
                ));
            }

            if let Some(saver) = &active {
                // Not fatal: the line count still advanced, so later
                // records keep their correct sequence numbers.
                if let Err(e) = saver.write_record(&record).await {
                    warn!(step = %record.step, error = %e, "dropping record");
                }
            }
        }

        // Clean EOF: the last step closes synchronously so its error
        // surfaces, then the drain barrier covers everything closed in
        // the background.
        let final_close = match active.take() {
            Some(finished) => finished.close().await,
            None => Ok(()),
        };
        closes.shutdown().await;
        final_close
    }

    /// Best-effort close of a superseded step; failure is logged and
    /// must not block the step that replaced it.
    fn close_in_background(closes: &TaskSet, finished: StepSaver) {
        let step = finished.step_name().to_string();
        closes.spawn(async move {
            if let Err(e) = finished.close().await {
                error!(step = %step, error = %e, "closing finished step failed");
            }
        });
    }
}
