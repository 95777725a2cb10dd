//! Final line-count reporting for finished steps.
//!
//! The build metadata API records how many lines each step produced so
//! the UI can page through logs without fetching every chunk. One call
//! per step, at close time, after the final flush.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};

/// Receives the final record count for a finished step.
///
/// The call is side-effecting and not idempotent; the pipeline invokes
/// it exactly once per step.
#[async_trait]
pub trait StepLineReporter: Send + Sync {
    async fn report(&self, step_name: &str, lines: usize) -> Result<()>;
}

#[derive(Serialize)]
struct StepLinesPayload {
    lines: usize,
}

/// Reports line counts to the build metadata API.
pub struct ApiReporter {
    client: Client,
    base_url: String,
    build_id: String,
    token: String,
}

impl ApiReporter {
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
        })
    }

    fn make_url(&self, step_name: &str) -> Result<Url> {
        let raw = format!(
            "{}/v4/builds/{}/steps/{}",
            self.base_url, self.build_id, step_name
        );
        Url::parse(&raw).map_err(|e| Error::Url {
            url: raw,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl StepLineReporter for ApiReporter {
    async fn report(&self, step_name: &str, lines: usize) -> Result<()> {
        let url = self.make_url(step_name)?;
        let response = self
            .client
            .put(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&StepLinesPayload { lines })
            .send()
            .await
            .map_err(|e| report_error(step_name, lines, Error::Http(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let source = Error::Store {
                status_code: status.as_u16(),
                reason: status
                    .canonical_reason()
                    .unwrap_or("unknown status")
                    .to_string(),
                message: body,
            };
            return Err(report_error(step_name, lines, source));
        }

        Ok(())
    }
}

fn report_error(step_name: &str, lines: usize, source: Error) -> Error {
    Error::Report {
        step: step_name.to_string(),
        lines,
        source: Box::new(source),
    }
}

/// Reporter for local mode, where there is no metadata API.
pub struct NoopReporter;

#[async_trait]
impl StepLineReporter for NoopReporter {
    async fn report(&self, step_name: &str, lines: usize) -> Result<()> {
        debug!(step = step_name, lines, "local mode, skipping line report");
        Ok(())
    }
}
