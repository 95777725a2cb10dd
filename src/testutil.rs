//! Recording doubles for the uploader and reporter boundaries.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::reporter::StepLineReporter;
use crate::uploader::Uploader;

/// Uploader that records each call's destination and the source file
/// contents at upload time. Can be told to fail its first N calls.
pub(crate) struct RecordingUploader {
    uploads: Mutex<Vec<(String, String)>>,
    failures_remaining: AtomicUsize,
}

impl RecordingUploader {
    pub(crate) fn new() -> Self {
        Self::failing(0)
    }

    pub(crate) fn failing(failures: usize) -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            failures_remaining: AtomicUsize::new(failures),
        }
    }

    pub(crate) fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().expect("mutex poisoned").clone()
    }

    /// Latest recorded content per destination, in first-seen order.
    pub(crate) fn latest_by_destination(&self) -> Vec<(String, String)> {
        let mut latest: Vec<(String, String)> = Vec::new();
        for (dest, content) in self.uploads() {
            match latest.iter_mut().find(|(d, _)| *d == dest) {
                Some((_, c)) => *c = content,
                None => latest.push((dest, content)),
            }
        }
        latest
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, store_path: &str, source: &Path) -> Result<()> {
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Store {
                status_code: 500,
                reason: "Internal Server Error".to_string(),
                message: "injected failure".to_string(),
            });
        }

        let content = tokio::fs::read_to_string(source)
            .await
            .map_err(|e| Error::io(source, e))?;
        self.uploads
            .lock()
            .expect("mutex poisoned")
            .push((store_path.to_string(), content));
        Ok(())
    }
}

/// Reporter that records `(step, lines)` pairs.
pub(crate) struct RecordingReporter {
    reports: Mutex<Vec<(String, usize)>>,
    fail: bool,
}

impl RecordingReporter {
    pub(crate) fn new() -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub(crate) fn reports(&self) -> Vec<(String, usize)> {
        self.reports.lock().expect("mutex poisoned").clone()
    }
}

#[async_trait]
impl StepLineReporter for RecordingReporter {
    async fn report(&self, step_name: &str, lines: usize) -> Result<()> {
        self.reports
            .lock()
            .expect("mutex poisoned")
            .push((step_name.to_string(), lines));
        if self.fail {
            return Err(Error::Report {
                step: step_name.to_string(),
                lines,
                source: Box::new(Error::Store {
                    status_code: 500,
                    reason: "Internal Server Error".to_string(),
                    message: "injected failure".to_string(),
                }),
            });
        }
        Ok(())
    }
}
