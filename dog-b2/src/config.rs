use std::time::Duration;

use crate::{B2Error, B2Result};

/// Default account authorization endpoint
pub const DEFAULT_AUTH_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";

/// Application key credentials
#[derive(Clone, PartialEq, Eq)]
pub struct B2Credentials {
    pub key_id: String,
    pub application_key: String,
}

impl B2Credentials {
    pub fn new<K: Into<String>, A: Into<String>>(key_id: K, application_key: A) -> Self {
        Self {
            key_id: key_id.into(),
            application_key: application_key.into(),
        }
    }

    /// Read `<prefix>KEY_ID` and `<prefix>APPLICATION_KEY`
    pub fn from_env(prefix: &str) -> B2Result<Self> {
        let read = |name: &str| {
            let key = format!("{}{}", prefix, name);
            std::env::var(&key).map_err(|_| B2Error::invalid_config(format!("{} is not set", key)))
        };

        Ok(Self::new(read("KEY_ID")?, read("APPLICATION_KEY")?))
    }
}

impl std::fmt::Debug for B2Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2Credentials")
            .field("key_id", &self.key_id)
            .field("application_key", &"<redacted>")
            .finish()
    }
}

/// Configuration for a B2 client
#[derive(Debug, Clone)]
pub struct B2Config {
    /// Account authorization URL
    pub auth_url: String,

    /// Upload endpoints kept per bucket (or per large file)
    pub max_cache: usize,

    /// Bytes per part for large-file uploads
    pub chunk_size: u64,

    /// Sources at or below this size go through a single upload call.
    /// `None` means one `chunk_size` unit.
    pub small_file_threshold: Option<u64>,

    /// Refresh the account token once it is older than this
    pub token_refresh_after: Duration,

    /// Idle endpoints older than this are dropped instead of reused
    pub endpoint_ttl: Duration,

    /// Timeout applied to each network call
    pub request_timeout: Duration,

    /// Backoff settings for transient failures
    pub retry: RetryPolicy,
}

impl Default for B2Config {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            max_cache: 4,
            chunk_size: 100 * 1024 * 1024, // 100MB
            small_file_threshold: None,
            token_refresh_after: Duration::from_secs(23 * 3600 + 1800), // 23.5h
            endpoint_ttl: Duration::from_secs(23 * 3600 + 1800),
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl B2Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth_url<S: Into<String>>(mut self, url: S) -> Self {
        self.auth_url = url.into();
        self
    }

    pub fn with_max_cache(mut self, max_cache: usize) -> Self {
        self.max_cache = max_cache;
        self
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_small_file_threshold(mut self, bytes: u64) -> Self {
        self.small_file_threshold = Some(bytes);
        self
    }

    pub fn with_token_refresh_after(mut self, after: Duration) -> Self {
        self.token_refresh_after = after;
        self
    }

    pub fn with_endpoint_ttl(mut self, ttl: Duration) -> Self {
        self.endpoint_ttl = ttl;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Effective small-file routing threshold
    pub fn small_file_threshold(&self) -> u64 {
        self.small_file_threshold.unwrap_or(self.chunk_size)
    }

    pub fn validate(&self) -> B2Result<()> {
        if self.max_cache == 0 {
            return Err(B2Error::invalid_config("max_cache must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(B2Error::invalid_config("chunk_size must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(B2Error::invalid_config("retry.max_attempts must be positive"));
        }
        Ok(())
    }

    /// Apply `<prefix>MAX_CACHE`, `<prefix>CHUNK_SIZE`, `<prefix>SMALL_FILE_THRESHOLD`
    /// and `<prefix>AUTH_URL` on top of the defaults
    ///
    /// ```bash
    /// export DOG_B2__MAX_CACHE=8
    /// export DOG_B2__CHUNK_SIZE=52428800
    /// ```
    pub fn from_env(prefix: &str) -> B2Result<Self> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(prefix: &str, lookup: F) -> B2Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |name: &str| lookup(&format!("{}{}", prefix, name));
        let number = |name: &str, value: String| {
            value.trim().parse::<u64>().map_err(|_| {
                B2Error::invalid_config(format!("{}{} is not a number: {}", prefix, name, value))
            })
        };

        if let Some(url) = var("AUTH_URL") {
            config.auth_url = url;
        }
        if let Some(value) = var("MAX_CACHE") {
            config.max_cache = number("MAX_CACHE", value)? as usize;
        }
        if let Some(value) = var("CHUNK_SIZE") {
            config.chunk_size = number("CHUNK_SIZE", value)?;
        }
        if let Some(value) = var("SMALL_FILE_THRESHOLD") {
            config.small_file_threshold = Some(number("SMALL_FILE_THRESHOLD", value)?);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Capped exponential backoff for transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_backoff: Duration,

    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(64),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// No waiting between attempts
    pub fn immediate(mut self) -> Self {
        self.base_backoff = Duration::ZERO;
        self.max_backoff = Duration::ZERO;
        self
    }
}
