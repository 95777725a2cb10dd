//! Same-host uploader appending into a single shared log file.
//!
//! Repeated uploads of a still-growing chunk target the same
//! destination, so a plain append would duplicate everything already
//! written. Instead the destination's last line anchors a resume
//! point in the source: only lines after the anchor are appended. If
//! the anchor is missing from the source (destination rotated or
//! corrupted externally), the whole source is appended — a duplicate
//! is the safe failure mode, silent loss is not.
//!
//! I/O failures here are never retried internally; the chunk is
//! unchanged on disk, so the next scheduled flush simply tries again.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use super::Uploader;
use crate::error::{Error, Result};

/// Appends chunk contents to one growing file on the local host.
pub struct LocalUploader {
    log_file: PathBuf,
}

impl LocalUploader {
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
        }
    }

    /// Last non-empty line of the destination, if any.
    async fn last_line(&self) -> Result<Option<String>> {
        let file = match tokio::fs::File::open(&self.log_file).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(&self.log_file, e)),
        };

        let mut lines = BufReader::new(file).lines();
        let mut last = None;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Error::io(&self.log_file, e))?
        {
            if !line.is_empty() {
                last = Some(line);
            }
        }
        Ok(last)
    }
}

#[async_trait]
impl Uploader for LocalUploader {
    async fn upload(&self, store_path: &str, source: &Path) -> Result<()> {
        debug!(
            destination = store_path,
            log_file = %self.log_file.display(),
            "appending chunk to local log"
        );

        let content = tokio::fs::read_to_string(source)
            .await
            .map_err(|e| Error::io(source, e))?;

        // Resume after the destination's last line when the source
        // still contains it.
        let mut pending = String::new();
        let mut matched = false;
        if let Some(last) = self.last_line().await? {
            for line in content.lines() {
                if matched {
                    pending.push_str(line);
                    pending.push('\n');
                } else if line == last {
                    matched = true;
                }
            }
        }

        // No anchor found: append everything.
        let to_write = if matched { pending.as_str() } else { &content };
        if to_write.is_empty() {
            return Ok(());
        }

        let mut output = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log_file)
            .await
            .map_err(|e| Error::io(&self.log_file, e))?;
        output
            .write_all(to_write.as_bytes())
            .await
            .map_err(|e| Error::io(&self.log_file, e))?;

        Ok(())
    }
}
