//! Uploader boundary.
//!
//! A chunk only knows how to hand its backing file to an [`Uploader`];
//! whether that means a retried HTTP PUT or an append to a local file
//! is decided once, at construction time.

mod local;
mod store;

pub use local::LocalUploader;
pub use store::StoreUploader;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// Pushes the contents of a local file to a destination path in the
/// log store. `store_path` is relative to the build's root, e.g.
/// `step0/log.3`.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, store_path: &str, source: &Path) -> Result<()>;
}
