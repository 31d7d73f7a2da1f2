//! Temperature acquisition: interchangeable sources behind one retrying
//! reader.
//!
//! A *read* polls the source up to `poll_attempts` times. The reader wraps
//! that in up to `read_attempts` reads separated by `read_pause`, so a
//! misbehaving sensor costs at most
//! `read_attempts × (poll_attempts × poll_spacing) + pauses` before the run
//! gives up.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::Cancelled;
use crate::settings::{SensorKind, SensorSettings};
use crate::shutdown::Shutdown;

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// One attempt at reading degrees Celsius.
#[async_trait]
pub(crate) trait TemperatureSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn sample(&self) -> Result<f64>;
}

/// On-board sensor exposed through sysfs in millidegrees.
pub(crate) struct BuiltinSensor {
    path: PathBuf,
}

impl BuiltinSensor {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TemperatureSource for BuiltinSensor {
    fn name(&self) -> &'static str {
        "builtin"
    }

    async fn sample(&self) -> Result<f64> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read {} failed", self.path.display()))?;
        let millidegrees: f64 = raw
            .trim()
            .parse()
            .with_context(|| format!("unparsable reading {:?}", raw.trim()))?;
        Ok(millidegrees / 1000.0)
    }
}

/// Helper program that prints degrees Celsius on stdout and exits 0.
pub(crate) struct ExternalSensor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalSensor {
    pub(crate) fn new(command: &[String], timeout: Duration) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("external sensor command is empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

#[async_trait]
impl TemperatureSource for ExternalSensor {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn sample(&self) -> Result<f64> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot start {}", self.program))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.with_context(|| format!("{} failed", self.program))?,
            Err(_) => bail!("{} timed out after {:?}", self.program, self.timeout),
        };

        ensure!(
            output.status.success(),
            "{} exited with {}: {}",
            self.program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<f64>()
            .with_context(|| format!("unparsable output {:?}", stdout.trim()))
    }
}

/// Build the source selected by the settings (after CLI overrides).
pub(crate) fn source_from_settings(sensor: &SensorSettings) -> Result<Box<dyn TemperatureSource>> {
    Ok(match sensor.kind {
        SensorKind::Builtin => Box::new(BuiltinSensor::new(&sensor.builtin_path)),
        SensorKind::External => Box::new(ExternalSensor::new(
            &sensor.external_command,
            Duration::from_secs(sensor.external_timeout_sec),
        )?),
    })
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) poll_attempts: u32,
    pub(crate) poll_spacing: Duration,
    pub(crate) read_attempts: u32,
    pub(crate) read_pause: Duration,
}

impl From<&SensorSettings> for RetryPolicy {
    fn from(s: &SensorSettings) -> Self {
        Self {
            poll_attempts: s.poll_attempts,
            poll_spacing: Duration::from_secs(s.poll_spacing_sec),
            read_attempts: s.read_attempts,
            read_pause: Duration::from_secs(s.read_pause_sec),
        }
    }
}

pub(crate) struct TemperatureReader {
    source: Box<dyn TemperatureSource>,
    policy: RetryPolicy,
    shutdown: Shutdown,
}

impl TemperatureReader {
    pub(crate) fn new(source: Box<dyn TemperatureSource>, policy: RetryPolicy, shutdown: Shutdown) -> Self {
        Self {
            source,
            policy,
            shutdown,
        }
    }

    pub(crate) fn read_attempts(&self) -> u32 {
        self.policy.read_attempts
    }

    /// Up to `read_attempts` reads with a pause between them. `Ok(None)`
    /// means every attempt failed.
    pub(crate) async fn read(&self) -> Result<Option<f64>, Cancelled> {
        for attempt in 1..=self.policy.read_attempts {
            if let Some(t) = self.read_once().await? {
                return Ok(Some(t));
            }
            if attempt < self.policy.read_attempts {
                warn!(
                    attempt,
                    pause_sec = self.policy.read_pause.as_secs(),
                    "temperature read failed, retrying"
                );
                self.shutdown.sleep(self.policy.read_pause).await?;
            }
        }
        Ok(None)
    }

    /// Poll the source until it answers or `poll_attempts` run out. A pending
    /// sample is abandoned on shutdown, which kills an external helper.
    pub(crate) async fn read_once(&self) -> Result<Option<f64>, Cancelled> {
        let source = self.source.name();

        for attempt in 1..=self.policy.poll_attempts {
            match self.shutdown.race(self.source.sample()).await? {
                Ok(t) => {
                    debug!(source, attempt, temperature = t, "temperature sampled");
                    return Ok(Some(t));
                }
                Err(e) => {
                    warn!(source, attempt, "temperature sample failed: {e:#}");
                    if attempt < self.policy.poll_attempts {
                        self.shutdown.sleep(self.policy.poll_spacing).await?;
                    }
                }
            }
        }

        info!(source, attempts = self.policy.poll_attempts, "sensor gave no reading");
        Ok(None)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
