use chrono::{DateTime, Local};

/// Wall-clock source. Schedule windows and the run-state timestamp are both
/// local time, so this hands out `DateTime<Local>`.
pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default)]
pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}
