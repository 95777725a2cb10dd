//! logship - build log-shipping sidecar.
//!
//! Tails a step-annotated record stream from the build executor,
//! regroups it by step, buffers each step into bounded chunks, and
//! uploads the chunks to the log store while the build is still
//! running.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod record;
pub mod reporter;
pub mod saver;
pub mod tasks;
pub mod uploader;

mod chunk;
#[cfg(test)]
mod testutil;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
