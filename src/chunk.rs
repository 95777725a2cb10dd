//! A chunk is one rotatable unit of step output: a temp-file buffer
//! plus bookkeeping for how much of it has been durably uploaded.

#[cfg(test)]
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::uploader::Uploader;

/// Temp-file backed buffer for a slice of a step's records.
///
/// Owned exclusively by one `StepSaver`. The backing file is released
/// on [`Chunk::close`] or, failing that, when the chunk is dropped —
/// temp storage never outlives the step.
pub(crate) struct Chunk {
    store_path: String,
    uploader: Arc<dyn Uploader>,
    // Counts and backing storage; never held across an await.
    state: StdMutex<ChunkState>,
    // Serializes uploads so a rotation-triggered save and a
    // timer-triggered save can never race a count update.
    save_lock: tokio::sync::Mutex<()>,
}

struct ChunkState {
    total_lines: usize,
    saved_lines: usize,
    backing: Option<Backing>,
}

struct Backing {
    file: tokio::fs::File,
    // Deletes the file on drop.
    temp: TempPath,
}

impl Chunk {
    /// Create a chunk destined for `store_path`, backed by a fresh
    /// temp file.
    pub(crate) fn new(store_path: String, uploader: Arc<dyn Uploader>) -> Result<Self> {
        let prefix = store_path.replace('/', "-");
        let named = tempfile::Builder::new()
            .prefix(&prefix)
            .tempfile()
            .map_err(|e| Error::io(&prefix, e))?;
        let (file, temp) = named.into_parts();

        Ok(Self {
            store_path,
            uploader,
            state: StdMutex::new(ChunkState {
                total_lines: 0,
                saved_lines: 0,
                backing: Some(Backing {
                    file: tokio::fs::File::from_std(file),
                    temp,
                }),
            }),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub(crate) fn store_path(&self) -> &str {
        &self.store_path
    }

    /// Append one encoded record (including its trailing newline).
    pub(crate) async fn append_line(&self, line: &[u8]) -> Result<()> {
        // Writes are serialized by the saver, so taking the file out
        // of the state briefly is safe; it lets the await run without
        // the lock held.
        let mut backing = {
            let mut state = self.state.lock().expect("mutex poisoned");
            state
                .backing
                .take()
                .ok_or_else(|| Error::io(&self.store_path, closed_error()))?
        };

        // Flush so the bytes are visible to an uploader reading the
        // file through its own handle.
        let write_result = match backing.file.write_all(line).await {
            Ok(()) => backing.file.flush().await,
            Err(e) => Err(e),
        };

        let mut state = self.state.lock().expect("mutex poisoned");
        state.backing = Some(backing);
        write_result.map_err(|e| Error::io(&self.store_path, e))?;
        state.total_lines += 1;
        Ok(())
    }

    /// Upload the chunk if it holds lines not yet saved.
    ///
    /// No-op when fully durable. On success the saved count advances
    /// to the line count observed before the upload started; lines
    /// appended mid-flight stay unsaved until the next call.
    pub(crate) async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;

        let (snapshot, path) = {
            let state = self.state.lock().expect("mutex poisoned");
            if state.total_lines == state.saved_lines {
                return Ok(());
            }
            let Some(backing) = &state.backing else {
                return Ok(());
            };
            (state.total_lines, backing.temp.to_path_buf())
        };

        debug!(destination = %self.store_path, lines = snapshot, "uploading chunk");
        self.uploader.upload(&self.store_path, &path).await?;

        let mut state = self.state.lock().expect("mutex poisoned");
        state.saved_lines = state.saved_lines.max(snapshot);
        Ok(())
    }

    /// Release the backing storage. Idempotent; waits out any
    /// in-flight upload first.
    pub(crate) async fn close(&self) {
        let _guard = self.save_lock.lock().await;
        let backing = self.state.lock().expect("mutex poisoned").backing.take();
        // Dropping the TempPath deletes the file.
        drop(backing);
    }

    #[cfg(test)]
    pub(crate) fn total_lines(&self) -> usize {
        self.state.lock().expect("mutex poisoned").total_lines
    }

    #[cfg(test)]
    pub(crate) fn saved_lines(&self) -> usize {
        self.state.lock().expect("mutex poisoned").saved_lines
    }

    /// Path of the backing file while the chunk is open.
    #[cfg(test)]
    pub(crate) fn backing_path(&self) -> Option<PathBuf> {
        let state = self.state.lock().expect("mutex poisoned");
        state.backing.as_ref().map(|b| b.temp.to_path_buf())
    }
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "chunk already closed")
}
