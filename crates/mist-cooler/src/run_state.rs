//! When the previous run finished misting, as a single ISO-8601 line.
//!
//! Written in naive local time (`2025-07-15T07:42:10.123456`) so files left by
//! older field scripts on the same path keep parsing; RFC 3339 with an offset
//! is accepted too.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub(crate) trait RunStateStore: Send + Sync {
    /// `Ok(None)` when no run has been recorded yet.
    fn load(&self) -> Result<Option<DateTime<Local>>>;
    fn save(&self, finished_at: DateTime<Local>) -> Result<()>;
}

pub(crate) struct FileRunState {
    path: PathBuf,
}

impl FileRunState {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RunStateStore for FileRunState {
    fn load(&self) -> Result<Option<DateTime<Local>>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read {} failed", self.path.display()))
            }
        };
        parse_timestamp(text.trim())
            .map(Some)
            .with_context(|| format!("bad timestamp in {}", self.path.display()))
    }

    fn save(&self, finished_at: DateTime<Local>) -> Result<()> {
        std::fs::write(&self.path, format_timestamp(finished_at))
            .with_context(|| format!("write {} failed", self.path.display()))
    }
}

pub(crate) fn format_timestamp(at: DateTime<Local>) -> String {
    at.naive_local().format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(text: &str) -> Result<DateTime<Local>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(at.with_timezone(&Local));
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("not an ISO-8601 timestamp: {text:?}"))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .with_context(|| format!("{text:?} does not exist in the local timezone"))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory store that counts writes.
    #[derive(Default)]
    pub(crate) struct MemoryRunState {
        pub(crate) last: Mutex<Option<DateTime<Local>>>,
        pub(crate) saves: Mutex<usize>,
        pub(crate) fail_writes: bool,
    }

    impl MemoryRunState {
        pub(crate) fn saves(&self) -> usize {
            *self.saves.lock().unwrap()
        }
    }

    impl RunStateStore for MemoryRunState {
        fn load(&self) -> Result<Option<DateTime<Local>>> {
            Ok(*self.last.lock().unwrap())
        }

        fn save(&self, finished_at: DateTime<Local>) -> Result<()> {
            *self.saves.lock().unwrap() += 1;
            if self.fail_writes {
                anyhow::bail!("disk full");
            }
            *self.last.lock().unwrap() = Some(finished_at);
            Ok(())
        }
    }
}
