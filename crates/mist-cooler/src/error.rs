use std::process::ExitCode;

use thiserror::Error;

/// Failures that end a run before or during actuation.
///
/// Everything here maps to exit code 1. Expected non-errors (lock busy,
/// interval skip, out of window) are reported as `RunOutcome`s instead.
#[derive(Error, Debug)]
pub(crate) enum RunError {
    #[error("config fetch failed: {0:#}")]
    ConfigFetch(#[source] anyhow::Error),
    #[error("config schema error: {0}")]
    ConfigSchema(String),
    #[error("temperature unavailable after {attempts} attempt(s)")]
    TemperatureUnavailable { attempts: u32 },
    #[error("auto mode evaluation failed: {0}")]
    AutoEvaluation(String),
    #[error("interrupted while {0}")]
    Interrupted(&'static str),
}

impl RunError {
    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::FAILURE
    }
}

/// A timed wait was cut short by a termination request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("wait cancelled by shutdown request")]
pub(crate) struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        let e = RunError::ConfigFetch(anyhow::anyhow!("connection refused"));
        assert_eq!(e.to_string(), "config fetch failed: connection refused");

        let e = RunError::TemperatureUnavailable { attempts: 3 };
        assert_eq!(e.to_string(), "temperature unavailable after 3 attempt(s)");

        let e = RunError::Interrupted("misting");
        assert_eq!(e.to_string(), "interrupted while misting");
    }
}
