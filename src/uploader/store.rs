//! Retrying HTTP uploader for the log store.
//!
//! Chunks are PUT to `{base}/v1/builds/{build_id}/{store_path}` as
//! newline-delimited JSON with bearer-token auth. Every non-2xx
//! response and every transport failure is retried with linear jitter
//! backoff up to the configured budget.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

use super::Uploader;
use crate::config::Config;
use crate::error::{Error, Result};

const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Structured error body returned by the store API.
#[derive(Debug, Deserialize)]
struct StoreErrorBody {
    #[serde(rename = "statusCode")]
    status_code: u16,
    #[serde(rename = "error")]
    reason: String,
    message: String,
}

/// Uploads chunk files to the log store for one build.
pub struct StoreUploader {
    client: Client,
    base_url: String,
    build_id: String,
    token: String,
    max_retries: u32,
    wait_min: Duration,
    wait_max: Duration,
    // Seeded so backoff is reproducible under test.
    rng: Mutex<StdRng>,
}

impl StoreUploader {
    /// Create an uploader for the given build.
    pub fn new(build_id: &str, base_url: &str, token: &str, config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.store_timeout)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            build_id: build_id.to_string(),
            token: token.to_string(),
            max_retries: config.store_max_retries,
            wait_min: config.retry_wait_min,
            wait_max: config.retry_wait_max,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Replace the backoff RNG with a seeded one.
    #[cfg(test)]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Fully-qualified URL for a store path within this build.
    fn make_url(&self, store_path: &str) -> Result<Url> {
        let raw = format!("{}/v1/builds/{}/{}", self.base_url, self.build_id, store_path);
        Url::parse(&raw).map_err(|e| Error::Url {
            url: raw,
            reason: e.to_string(),
        })
    }

    /// Linear jitter backoff: `attempt * rand(wait_min..=wait_max)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let min = self.wait_min.as_millis() as u64;
        let max = self.wait_max.as_millis() as u64;
        let wait = self.rng.lock().expect("mutex poisoned").gen_range(min..=max);
        Duration::from_millis(u64::from(attempt) * wait)
    }

    /// One PUT attempt. Any non-2xx outcome is an error; the caller
    /// decides whether to retry.
    async fn put(&self, url: &Url, source: &Path) -> Result<()> {
        let body = tokio::fs::read(source)
            .await
            .map_err(|e| Error::io(source, e))?;

        let response = self
            .client
            .put(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, CONTENT_TYPE_NDJSON)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(parse_store_error(status, &body))
    }
}

/// Keep the store's own error body when it parses; otherwise fall back
/// to the HTTP status line.
fn parse_store_error(status: StatusCode, body: &str) -> Error {
    match serde_json::from_str::<StoreErrorBody>(body) {
        Ok(parsed) => Error::Store {
            status_code: parsed.status_code,
            reason: parsed.reason,
            message: parsed.message,
        },
        Err(_) => Error::Store {
            status_code: status.as_u16(),
            reason: status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string(),
            message: body.to_string(),
        },
    }
}

#[async_trait]
impl Uploader for StoreUploader {
    async fn upload(&self, store_path: &str, source: &Path) -> Result<()> {
        let url = self.make_url(store_path)?;
        let attempts = self.max_retries + 1;

        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.put(&url, source).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        destination = store_path,
                        attempt,
                        error = %e,
                        "chunk upload attempt failed"
                    );
                    last_err = Some(e);
                }
            }

            if attempt < attempts {
                sleep(self.backoff(attempt)).await;
            }
        }

        Err(Error::RetriesExhausted {
            destination: store_path.to_string(),
            attempts,
            // last_err is always set: the loop runs at least once.
            source: Box::new(last_err.expect("at least one attempt")),
        })
    }
}
