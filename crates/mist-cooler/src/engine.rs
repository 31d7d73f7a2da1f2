//! Decision engine: one invocation's walk from "nothing known" to a mist or
//! skip verdict, followed by actuation.
//!
//! ## Run state machine
//!
//! ```text
//! Idle ──[config resolved]──▶ ConfigLoaded ──[interval ok]──▶ IntervalChecked
//!                                  │                               │
//!                                  └──[interval far off]──▶ Finished(Skipped)
//!                                                                  │
//!            TemperatureKnown ◀──────────[temperature read]────────┘
//!                   │
//!                   └──▶ ModeResolved ──[Skip]──▶ Finished(Skipped)
//!                              │
//!                              └──[Mist]──▶ Decided ──[relay session]──▶ Finished
//! ```
//!
//! Every failure before `Decided` is fatal and leaves the hardware untouched.
//! From `Decided` on, the relay session guarantees the end timestamp is
//! written and the lines are released, and hardware faults are only logged.

use std::time::Duration;

use chrono::NaiveTime;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::RunError;
use crate::interval::{gate, Gate};
use crate::mist_config::MistConfig;
use crate::mode::{classify, Mode};
use crate::relay::{ActuationError, RelayActuator, RelaySession};
use crate::resolver::ConfigResolver;
use crate::run_state::RunStateStore;
use crate::shutdown::Shutdown;
use crate::temperature::TemperatureReader;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Everything a run needs besides its collaborators, passed explicitly.
pub(crate) struct RunContext<'a> {
    pub(crate) clock: &'a dyn Clock,
    pub(crate) run_state: &'a dyn RunStateStore,
    pub(crate) shutdown: Shutdown,
    pub(crate) relay_gpios: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Skip,
    Mist,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Decision {
    pub(crate) action: Action,
    pub(crate) reason: String,
    /// Hold time per relay.
    pub(crate) duration: Duration,
    /// Misting must not start at or after this time of day.
    pub(crate) boundary: Option<NaiveTime>,
}

impl Decision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Skip,
            reason: reason.into(),
            duration: Duration::ZERO,
            boundary: None,
        }
    }

    fn mist(reason: impl Into<String>, duration: Duration, boundary: Option<NaiveTime>) -> Self {
        Self {
            action: Action::Mist,
            reason: reason.into(),
            duration,
            boundary,
        }
    }
}

/// How a run ended when it did not fail. All of these exit 0.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunOutcome {
    /// Nothing to do this time (interval, mode, window, thresholds).
    Skipped { reason: String },
    /// Misting was selected but called off inside the relay session.
    Aborted { reason: String },
    Misted { relays: usize, hold: Duration },
    /// Relay hardware misbehaved; cleanup ran and the fault was logged.
    Faulted { reason: String },
}

enum Stage {
    Idle,
    ConfigLoaded(MistConfig),
    IntervalChecked(MistConfig),
    TemperatureKnown {
        config: MistConfig,
        temperature: f64,
    },
    ModeResolved {
        config: MistConfig,
        temperature: f64,
        mode: Mode,
    },
    Decided {
        config: MistConfig,
        temperature: f64,
        decision: Decision,
    },
    Finished(RunOutcome),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub(crate) struct DecisionEngine<'a> {
    ctx: RunContext<'a>,
    resolver: &'a ConfigResolver,
    reader: &'a TemperatureReader,
    board: &'a mut dyn RelayActuator,
}

impl<'a> DecisionEngine<'a> {
    pub(crate) fn new(
        ctx: RunContext<'a>,
        resolver: &'a ConfigResolver,
        reader: &'a TemperatureReader,
        board: &'a mut dyn RelayActuator,
    ) -> Self {
        Self {
            ctx,
            resolver,
            reader,
            board,
        }
    }

    /// Drive the state machine to completion.
    pub(crate) async fn run(&mut self) -> Result<RunOutcome, RunError> {
        let mut stage = Stage::Idle;
        loop {
            stage = match stage {
                Stage::Finished(outcome) => return Ok(outcome),
                other => self.step(other).await?,
            };
        }
    }

    async fn step(&mut self, stage: Stage) -> Result<Stage, RunError> {
        Ok(match stage {
            Stage::Idle => Stage::ConfigLoaded(self.resolver.resolve().await?),
            Stage::ConfigLoaded(config) => self.check_interval(config).await?,
            Stage::IntervalChecked(config) => self.read_temperature(config).await?,
            Stage::TemperatureKnown {
                config,
                temperature,
            } => {
                let mode = classify(&config);
                info!(?mode, "mode resolved");
                Stage::ModeResolved {
                    config,
                    temperature,
                    mode,
                }
            }
            Stage::ModeResolved {
                config,
                temperature,
                mode,
            } => {
                let now = self.ctx.clock.now().time();
                let decision = decide(&config, mode, temperature, now)?;
                info!(
                    action = ?decision.action,
                    reason = %decision.reason,
                    boundary = ?decision.boundary,
                    "decision"
                );
                match decision.action {
                    Action::Skip => Stage::Finished(RunOutcome::Skipped {
                        reason: decision.reason,
                    }),
                    Action::Mist => Stage::Decided {
                        config,
                        temperature,
                        decision,
                    },
                }
            }
            Stage::Decided {
                config,
                temperature,
                decision,
            } => Stage::Finished(self.mist(&config, temperature, &decision).await?),
            Stage::Finished(outcome) => Stage::Finished(outcome),
        })
    }

    // -----------------------------------------------------------------------
    // State handlers
    // -----------------------------------------------------------------------

    async fn check_interval(&self, config: MistConfig) -> Result<Stage, RunError> {
        let interval_sec = config.interval_sec();
        let last_end = match self.ctx.run_state.load() {
            Ok(v) => v,
            Err(e) => {
                warn!("previous run end time unavailable: {e:#}");
                None
            }
        };

        match gate(last_end, self.ctx.clock.now(), interval_sec) {
            Gate::Proceed => {
                info!(interval_sec, "interval satisfied");
            }
            Gate::Wait(wait) => {
                info!(
                    interval_sec,
                    wait_sec = wait.as_secs_f64(),
                    "interval not reached, waiting"
                );
                self.ctx
                    .shutdown
                    .sleep(wait)
                    .await
                    .map_err(|_| RunError::Interrupted("waiting for the interval"))?;
            }
            Gate::Skip { remaining_sec } => {
                return Ok(Stage::Finished(RunOutcome::Skipped {
                    reason: format!("interval not reached, {remaining_sec:.0}s remaining"),
                }));
            }
        }
        Ok(Stage::IntervalChecked(config))
    }

    async fn read_temperature(&self, config: MistConfig) -> Result<Stage, RunError> {
        let reading = self
            .reader
            .read()
            .await
            .map_err(|_| RunError::Interrupted("reading temperature"))?;

        let temperature = reading.ok_or(RunError::TemperatureUnavailable {
            attempts: self.reader.read_attempts(),
        })?;
        info!(temperature, "temperature acquired");

        Ok(Stage::TemperatureKnown {
            config,
            temperature,
        })
    }

    async fn mist(
        &mut self,
        config: &MistConfig,
        temperature: f64,
        decision: &Decision,
    ) -> Result<RunOutcome, RunError> {
        let (mut session, init) = RelaySession::open(
            &mut *self.board,
            &self.ctx.relay_gpios,
            self.ctx.run_state,
            self.ctx.clock,
            temperature,
        );

        if let Err(e) = init {
            session.close();
            return Ok(RunOutcome::Faulted {
                reason: format!("relay initialisation failed: {e:#}"),
            });
        }

        let now = self.ctx.clock.now().time();
        if let Some(reason) = last_moment_check(decision, temperature, config.lower_threshold, now) {
            info!(%reason, "misting called off");
            session.close();
            return Ok(RunOutcome::Aborted { reason });
        }

        let result = session
            .actuate(decision.duration, &self.ctx.shutdown, self.reader)
            .await;
        session.close();

        match result {
            Ok(()) => Ok(RunOutcome::Misted {
                relays: self.ctx.relay_gpios.len(),
                hold: decision.duration,
            }),
            Err(ActuationError::Cancelled) => Err(RunError::Interrupted("misting")),
            Err(ActuationError::Hardware(e)) => {
                error!("relay fault during misting: {e:#}");
                Ok(RunOutcome::Faulted {
                    reason: format!("relay fault: {e:#}"),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pure decision logic
// ---------------------------------------------------------------------------

/// Mist or skip for the given mode, reading, and time of day.
pub(crate) fn decide(
    config: &MistConfig,
    mode: Mode,
    temperature: f64,
    now: NaiveTime,
) -> Result<Decision, RunError> {
    match mode {
        Mode::Off => Ok(Decision::skip("mode off")),
        Mode::On => Ok(Decision::mist("mode on", hold_time(config)?, None)),
        Mode::Auto => decide_auto(config, temperature, now),
    }
}

/// Per-relay hold. Only consulted when misting is actually selected.
fn hold_time(config: &MistConfig) -> Result<Duration, RunError> {
    Duration::try_from_secs_f64(config.mist_sec)
        .map_err(|e| RunError::ConfigSchema(format!("mist_sec {}: {e}", config.mist_sec)))
}

fn decide_auto(config: &MistConfig, temperature: f64, now: NaiveTime) -> Result<Decision, RunError> {
    if temperature >= config.upper_threshold {
        return Ok(Decision::mist(
            format!(
                "temperature {temperature:.1} at or above upper threshold {}",
                config.upper_threshold
            ),
            hold_time(config)?,
            None,
        ));
    }

    // Only the outermost bounds are consulted; intermediate pairs are ignored.
    let from = window_bound(config.mist_time_from.first(), "mist_time_from")?;
    let to = window_bound(config.mist_time_to.last(), "mist_time_to")?;

    if !(from <= now && now < to) {
        return Ok(Decision::skip(format!("out of window {from}-{to}")));
    }

    if temperature >= config.lower_threshold {
        Ok(Decision::mist(
            format!("scheduled, temperature {temperature:.1} in window {from}-{to}"),
            hold_time(config)?,
            Some(to),
        ))
    } else {
        Ok(Decision::skip(format!(
            "temperature {temperature:.1} below lower threshold {}",
            config.lower_threshold
        )))
    }
}

fn window_bound(entry: Option<&String>, field: &str) -> Result<NaiveTime, RunError> {
    let text = entry.ok_or_else(|| RunError::AutoEvaluation(format!("{field} is empty")))?;
    NaiveTime::parse_from_str(text.trim(), "%H:%M")
        .map_err(|e| RunError::AutoEvaluation(format!("invalid {field} entry {text:?}: {e}")))
}

/// Final guard evaluated right before the relays fire.
pub(crate) fn last_moment_check(
    decision: &Decision,
    temperature: f64,
    lower_threshold: f64,
    now: NaiveTime,
) -> Option<String> {
    if temperature <= lower_threshold {
        return Some(format!(
            "temperature {temperature:.1} at or below lower threshold {lower_threshold}"
        ));
    }
    match decision.boundary {
        Some(to) if now >= to => Some(format!("window closed at {to}")),
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
