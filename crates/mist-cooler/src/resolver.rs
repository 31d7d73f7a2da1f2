//! Remote config retrieval with a short-lived on-disk cache.
//!
//! The cache only saves round-trips between closely spaced runs. It is never
//! used as a fallback when the server is unreachable.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::RunError;
use crate::mist_config::MistConfig;
use crate::settings::Settings;

const CONFIG_ENDPOINT: &str = "/api/getMistCoolerConfig";

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Where fresh configuration comes from.
#[async_trait]
pub(crate) trait ConfigProvider: Send + Sync {
    async fn fetch(&self) -> Result<Value>;
}

/// Farm server endpoint, queried with the terminal id as a form field.
pub(crate) struct HttpConfigProvider {
    client: reqwest::Client,
    url: String,
    terminal_id: String,
}

impl HttpConfigProvider {
    pub(crate) fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            url: format!(
                "{}{CONFIG_ENDPOINT}",
                settings.server_url.trim_end_matches('/')
            ),
            terminal_id: settings.terminal_id.clone(),
        })
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn fetch(&self) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .form(&[("id", self.terminal_id.as_str())])
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("POST {} rejected", self.url))?;

        response
            .json::<Value>()
            .await
            .with_context(|| format!("POST {} returned invalid json", self.url))
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// The last fetched payload, timestamped by the file's mtime.
pub(crate) struct ConfigCache {
    path: PathBuf,
    ttl: Duration,
}

impl ConfigCache {
    pub(crate) fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Cached payload if it is younger than the TTL. Read problems are
    /// logged and treated as a miss.
    pub(crate) fn load(&self) -> Option<Value> {
        if !self.enabled() {
            return None;
        }
        match self.try_load() {
            Ok(hit) => hit,
            Err(e) => {
                warn!(path = %self.path.display(), "config cache unreadable: {e:#}");
                None
            }
        }
    }

    fn try_load(&self) -> Result<Option<Value>> {
        let modified = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.modified().context("no mtime on cache file")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("stat failed"),
        };

        // An mtime in the future counts as freshly written.
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age >= self.ttl {
            info!(age_sec = age.as_secs(), "config cache expired");
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path).context("read failed")?;
        let value = serde_json::from_slice(&bytes).context("invalid json")?;
        info!(age_sec = age.as_secs(), "config loaded from cache");
        Ok(Some(value))
    }

    /// Best-effort write; failures are logged only.
    pub(crate) fn store(&self, value: &Value) {
        if !self.enabled() {
            return;
        }
        let res = serde_json::to_vec(value)
            .context("serialize failed")
            .and_then(|bytes| write_file(&self.path, &bytes));
        match res {
            Ok(()) => debug!(path = %self.path.display(), "config cached"),
            Err(e) => warn!(path = %self.path.display(), "config cache write failed: {e:#}"),
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("write {} failed", path.display()))
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub(crate) struct ConfigResolver {
    provider: Box<dyn ConfigProvider>,
    cache: ConfigCache,
}

impl ConfigResolver {
    pub(crate) fn new(provider: Box<dyn ConfigProvider>, cache: ConfigCache) -> Self {
        Self { provider, cache }
    }

    /// Cached config if fresh, otherwise a server fetch. Either way the
    /// result is validated before it is returned.
    pub(crate) async fn resolve(&self) -> Result<MistConfig, RunError> {
        let raw = match self.cache.load() {
            Some(value) => value,
            None => {
                info!("fetching config from server");
                let value = self.provider.fetch().await.map_err(RunError::ConfigFetch)?;
                self.cache.store(&value);
                value
            }
        };

        let config = MistConfig::from_value(raw)?;
        info!(
            lower = config.lower_threshold,
            upper = config.upper_threshold,
            mist_sec = config.mist_sec,
            interval_minutes = config.interval_minutes,
            "config resolved"
        );
        Ok(config)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
