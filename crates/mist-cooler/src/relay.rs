//! Misting relays. The `gpio` feature gates the real rppal driver; without
//! it, a mock board logs state changes instead of touching hardware.
//!
//! [`RelaySession`] owns the cleanup contract: whatever happens between
//! opening and closing it (success, error, cancellation, panic), the end
//! timestamp is persisted and every line is released exactly once.

use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::Cancelled;
use crate::run_state::RunStateStore;
use crate::shutdown::Shutdown;
use crate::temperature::TemperatureReader;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Narrow hardware seam for the relay lines.
pub(crate) trait RelayActuator {
    /// Claim `gpios` as outputs, all de-energized.
    fn init_outputs(&mut self, gpios: &[u8]) -> Result<()>;
    fn set(&mut self, gpio: u8, on: bool) -> Result<()>;
    /// De-energize and hand back every claimed line.
    fn release(&mut self);
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (production: rppal on a Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayBoard {
    pins: Vec<(u8, OutputPin)>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub(crate) fn new(active_low: bool) -> Self {
        Self {
            pins: Vec::new(),
            active_low,
        }
    }

    fn drive(pin: &mut OutputPin, on: bool, active_low: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

#[cfg(feature = "gpio")]
impl RelayActuator for RelayBoard {
    fn init_outputs(&mut self, gpios: &[u8]) -> Result<()> {
        let gpio = Gpio::new()?;
        for &num in gpios {
            let mut pin = gpio.get(num)?.into_output();
            // Fail-safe: ensure "OFF" before anything else happens
            Self::drive(&mut pin, false, self.active_low);
            self.pins.push((num, pin));
        }
        info!(relays = ?gpios, active_low = self.active_low, "relay lines initialised");
        Ok(())
    }

    fn set(&mut self, gpio: u8, on: bool) -> Result<()> {
        let active_low = self.active_low;
        let (_, pin) = self
            .pins
            .iter_mut()
            .find(|(num, _)| *num == gpio)
            .ok_or_else(|| anyhow::anyhow!("gpio {gpio} was not initialised"))?;
        Self::drive(pin, on, active_low);
        info!(gpio, "relay {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    fn release(&mut self) {
        let active_low = self.active_low;
        for (_, pin) in self.pins.iter_mut() {
            Self::drive(pin, false, active_low);
        }
        // Dropping an OutputPin restores the line's previous mode.
        self.pins.clear();
        info!("relay lines released");
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development: no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayBoard {
    pub(crate) lines: Vec<(u8, bool)>, // gpio -> energized
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub(crate) fn new(_active_low: bool) -> Self {
        Self { lines: Vec::new() }
    }
}

#[cfg(not(feature = "gpio"))]
impl RelayActuator for RelayBoard {
    fn init_outputs(&mut self, gpios: &[u8]) -> Result<()> {
        self.lines = gpios.iter().map(|&g| (g, false)).collect();
        info!(relays = ?gpios, "[mock-gpio] relay lines initialised (no hardware)");
        Ok(())
    }

    fn set(&mut self, gpio: u8, on: bool) -> Result<()> {
        let line = self
            .lines
            .iter_mut()
            .find(|(g, _)| *g == gpio)
            .ok_or_else(|| anyhow::anyhow!("gpio {gpio} was not initialised"))?;
        line.1 = on;
        info!(gpio, "[mock-gpio] relay {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    fn release(&mut self) {
        for line in self.lines.iter_mut() {
            line.1 = false;
        }
        info!("[mock-gpio] relay lines released");
    }
}

// ---------------------------------------------------------------------------
// Session: actuation with guaranteed cleanup
// ---------------------------------------------------------------------------

/// Why actuation stopped early.
#[derive(Debug)]
pub(crate) enum ActuationError {
    Cancelled,
    Hardware(anyhow::Error),
}

impl From<Cancelled> for ActuationError {
    fn from(_: Cancelled) -> Self {
        ActuationError::Cancelled
    }
}

pub(crate) struct RelaySession<'a> {
    board: &'a mut dyn RelayActuator,
    gpios: &'a [u8],
    run_state: &'a dyn RunStateStore,
    clock: &'a dyn Clock,
    initial_temperature: f64,
    closed: bool,
}

impl<'a> RelaySession<'a> {
    /// Start a session. Line initialisation failures are logged and
    /// returned, but the session is live either way so cleanup still runs.
    pub(crate) fn open(
        board: &'a mut dyn RelayActuator,
        gpios: &'a [u8],
        run_state: &'a dyn RunStateStore,
        clock: &'a dyn Clock,
        initial_temperature: f64,
    ) -> (Self, Result<()>) {
        let init = board.init_outputs(gpios);
        if let Err(e) = &init {
            error!("relay initialisation failed: {e:#}");
        }
        let session = Self {
            board,
            gpios,
            run_state,
            clock,
            initial_temperature,
            closed: false,
        };
        (session, init)
    }

    /// Energize each relay in order for `hold`, one at a time, then take one
    /// follow-up temperature reading for the log.
    pub(crate) async fn actuate(
        &mut self,
        hold: Duration,
        shutdown: &Shutdown,
        reader: &TemperatureReader,
    ) -> Result<(), ActuationError> {
        info!(
            relays = self.gpios.len(),
            hold_sec = hold.as_secs_f64(),
            "misting started"
        );

        for &gpio in self.gpios {
            self.board.set(gpio, true).map_err(ActuationError::Hardware)?;
            let held = shutdown.sleep(hold).await;
            // De-energize before reacting to a cancellation.
            self.board.set(gpio, false).map_err(ActuationError::Hardware)?;
            held?;
        }

        match reader.read_once().await {
            Ok(Some(t)) => info!(temperature = t, "temperature after misting"),
            Ok(None) => warn!("temperature re-read after misting failed"),
            Err(Cancelled) => info!("temperature re-read skipped, shutdown requested"),
        }
        Ok(())
    }

    /// Persist the end time and release the lines.
    pub(crate) fn close(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let finished_at = self.clock.now();
        if let Err(e) = self.run_state.save(finished_at) {
            warn!("failed to persist run end time: {e:#}");
        }
        self.board.release();
        info!(temperature = self.initial_temperature, "finish");
    }
}

impl Drop for RelaySession<'_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ===========================================================================
// Tests
// ===========================================================================


#[cfg(test)]
mod tests {
    use super::testing::RecordingBoard;
    use super::*;
    use crate::clock::testing::FixedClock;
    use crate::run_state::testing::MemoryRunState;
    use crate::shutdown;
    use crate::temperature::testing::{policy, ScriptedSource};

    const GPIOS: &[u8] = &[17, 27, 22];

    fn reader(sd: &Shutdown) -> TemperatureReader {
        TemperatureReader::new(Box::new(ScriptedSource::new(25.0, 0)), policy(1, 1), sd.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn actuates_sequentially_for_full_duration() {
        let (_trigger, sd) = shutdown::channel();
        let mut board = RecordingBoard::default();
        let store = MemoryRunState::default();
        let clock = FixedClock::at(7, 0);

        let start = tokio::time::Instant::now();
        {
            let (mut session, init) = RelaySession::open(&mut board, GPIOS, &store, &clock, 25.0);
            init.unwrap();
            session
                .actuate(Duration::from_secs(10), &sd, &reader(&sd))
                .await
                .unwrap();
            session.close();
        }

        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(
            board.events,
            vec![(17, true), (17, false), (27, true), (27, false), (22, true), (22, false)]
        );
        assert_eq!(board.inits, 1);
        assert_eq!(board.releases, 1);
        assert!(board.all_off());
        assert_eq!(store.saves(), 1);
        assert_eq!(*store.last.lock().unwrap(), Some(clock.now()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_hold_still_cleans_up_once() {
        let (trigger, sd) = shutdown::channel();
        let mut board = RecordingBoard::default();
        let store = MemoryRunState::default();
        let clock = FixedClock::at(7, 0);

        let result = {
            let (mut session, _) = RelaySession::open(&mut board, GPIOS, &store, &clock, 25.0);
            let rdr = reader(&sd);
            let actuation = session.actuate(Duration::from_secs(10), &sd, &rdr);
            let cancel = async {
                tokio::time::sleep(Duration::from_secs(15)).await;
                trigger.fire();
            };
            let (result, ()) = tokio::join!(actuation, cancel);
            result
        }; // session dropped without close()

        assert!(matches!(result, Err(ActuationError::Cancelled)));
        // First relay ran fully, second was cut short and switched off.
        assert_eq!(board.events, vec![(17, true), (17, false), (27, true), (27, false)]);
        assert!(board.all_off());
        assert_eq!(board.releases, 1);
        assert_eq!(store.saves(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_re_read_keeps_completed_actuation() {
        let (trigger, sd) = shutdown::channel();
        let mut board = RecordingBoard::default();
        let store = MemoryRunState::default();
        let clock = FixedClock::at(7, 0);
        // Never answers, so the re-read keeps polling after the holds.
        let rdr = TemperatureReader::new(
            Box::new(ScriptedSource::new(0.0, usize::MAX)),
            policy(10, 1),
            sd.clone(),
        );

        let result = {
            let (mut session, _) = RelaySession::open(&mut board, GPIOS, &store, &clock, 25.0);
            let actuation = session.actuate(Duration::from_secs(10), &sd, &rdr);
            let cancel = async {
                tokio::time::sleep(Duration::from_secs(32)).await;
                trigger.fire();
            };
            let (result, ()) = tokio::join!(actuation, cancel);
            result
        };

        assert!(result.is_ok());
        assert_eq!(board.events.len(), 6);
        assert!(board.all_off());
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn close_then_drop_does_not_repeat_cleanup() {
        let mut board = RecordingBoard::default();
        let store = MemoryRunState::default();
        let clock = FixedClock::at(7, 0);

        let (session, _) = RelaySession::open(&mut board, GPIOS, &store, &clock, 25.0);
        session.close();

        assert_eq!(board.releases, 1);
        assert_eq!(store.saves(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_fault_stops_and_cleans_up() {
        let (_trigger, sd) = shutdown::channel();
        let mut board = RecordingBoard {
            fail_on: Some(27),
            ..Default::default()
        };
        let store = MemoryRunState::default();
        let clock = FixedClock::at(7, 0);

        let result = {
            let (mut session, _) = RelaySession::open(&mut board, GPIOS, &store, &clock, 25.0);
            session.actuate(Duration::from_secs(5), &sd, &reader(&sd)).await
        };

        assert!(matches!(result, Err(ActuationError::Hardware(_))));
        assert_eq!(board.events, vec![(17, true), (17, false)]);
        assert!(board.all_off());
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn failed_init_still_persists_and_releases() {
        let mut board = RecordingBoard {
            fail_init: true,
            ..Default::default()
        };
        let store = MemoryRunState::default();
        let clock = FixedClock::at(7, 0);

        {
            let (_session, init) = RelaySession::open(&mut board, GPIOS, &store, &clock, 25.0);
            assert!(init.is_err());
        }

        assert_eq!(board.releases, 1);
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn persistence_failure_is_absorbed() {
        let mut board = RecordingBoard::default();
        let store = MemoryRunState {
            fail_writes: true,
            ..Default::default()
        };
        let clock = FixedClock::at(7, 0);

        let (session, _) = RelaySession::open(&mut board, GPIOS, &store, &clock, 25.0);
        session.close();

        assert_eq!(store.saves(), 1);
        assert_eq!(board.releases, 1);
    }

    // -- RelayBoard (mock) --------------------------------------------------

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn mock_board_tracks_lines() {
        let mut board = RelayBoard::new(false);
        board.init_outputs(&[17, 27]).unwrap();
        assert_eq!(board.lines, vec![(17, false), (27, false)]);

        board.set(27, true).unwrap();
        assert_eq!(board.lines[1], (27, true));

        board.release();
        assert!(board.lines.iter().all(|(_, on)| !on));
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn mock_board_rejects_unknown_line() {
        let mut board = RelayBoard::new(false);
        board.init_outputs(&[17]).unwrap();
        assert!(board.set(4, true).is_err());
    }
}
