//! Pipeline configuration.
//!
//! All tunables live in one immutable [`Config`] built once at process
//! start and passed into constructors. Nothing reads the environment
//! after startup.

use std::env;
use std::time::Duration;

/// Tunables for the log-shipping pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-request timeout for store and API calls.
    pub store_timeout: Duration,
    /// Upload retries after the initial attempt.
    pub store_max_retries: u32,
    /// Lower bound of the per-retry backoff wait.
    pub retry_wait_min: Duration,
    /// Upper bound of the per-retry backoff wait.
    pub retry_wait_max: Duration,
    /// Interval between periodic flushes of a step's chunks.
    pub upload_interval: Duration,
    /// Records per chunk before rotation.
    pub lines_per_chunk: usize,
    /// Maximum stored message length in characters.
    pub max_line_size: usize,
    /// Bound on opening the emitter at startup.
    pub startup_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_timeout: default_store_timeout(),
            store_max_retries: default_store_max_retries(),
            retry_wait_min: Duration::from_millis(100),
            retry_wait_max: Duration::from_millis(300),
            upload_interval: Duration::from_secs(2),
            lines_per_chunk: 100,
            max_line_size: 5000,
            startup_timeout: Duration::from_secs(600),
        }
    }
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_store_max_retries() -> u32 {
    5
}

impl Config {
    /// Build a config from defaults plus environment overrides.
    ///
    /// Recognized variables: `LOGSHIP_STORE_TIMEOUT_SECS` and
    /// `LOGSHIP_STORE_MAX_RETRIES`. Unparseable values are ignored in
    /// favor of the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("LOGSHIP_STORE_TIMEOUT_SECS") {
            config.store_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_parse::<u32>("LOGSHIP_STORE_MAX_RETRIES") {
            config.store_max_retries = retries;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.store_timeout, Duration::from_secs(20));
        assert_eq!(config.store_max_retries, 5);
        assert_eq!(config.upload_interval, Duration::from_secs(2));
        assert_eq!(config.lines_per_chunk, 100);
        assert_eq!(config.max_line_size, 5000);
        assert_eq!(config.startup_timeout, Duration::from_secs(600));
    }

    // One test owns the env vars; parallel tests must not share them.
    #[test]
    fn env_overrides() {
        env::set_var("LOGSHIP_STORE_TIMEOUT_SECS", "7");
        env::set_var("LOGSHIP_STORE_MAX_RETRIES", "2");
        let config = Config::from_env();
        assert_eq!(config.store_timeout, Duration::from_secs(7));
        assert_eq!(config.store_max_retries, 2);

        env::set_var("LOGSHIP_STORE_MAX_RETRIES", "many");
        let config = Config::from_env();
        assert_eq!(config.store_max_retries, 5);

        env::remove_var("LOGSHIP_STORE_TIMEOUT_SECS");
        env::remove_var("LOGSHIP_STORE_MAX_RETRIES");
    }
}
