//! Anti-overlap throttle between the end of one run and the start of the next.
//!
//! A one-minute interval always waits out the rest of its minute. Any other
//! interval only waits when less than [`MAX_WAIT_SEC`] remain and otherwise
//! leaves the slot to a later invocation.

use std::time::Duration;

use chrono::{DateTime, Local};

/// Interval length that gets the "always wait" treatment.
const ONE_MINUTE_SEC: i64 = 60;

/// Longest wait a non-minute interval will sit through before skipping.
const MAX_WAIT_SEC: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Gate {
    Proceed,
    Wait(Duration),
    Skip { remaining_sec: f64 },
}

pub(crate) fn gate(last_end: Option<DateTime<Local>>, now: DateTime<Local>, interval_sec: i64) -> Gate {
    let Some(last_end) = last_end else {
        return Gate::Proceed;
    };

    let elapsed = (now - last_end).num_milliseconds() as f64 / 1000.0;
    evaluate(elapsed, interval_sec)
}

/// Gate decision for `elapsed` seconds since the previous run ended.
pub(crate) fn evaluate(elapsed: f64, interval_sec: i64) -> Gate {
    let interval = interval_sec as f64;

    if interval_sec == ONE_MINUTE_SEC {
        return if elapsed < interval {
            Gate::Wait(Duration::from_secs_f64(interval - elapsed))
        } else {
            Gate::Proceed
        };
    }

    let remaining = interval - elapsed;
    if remaining <= 0.0 {
        Gate::Proceed
    } else if remaining < MAX_WAIT_SEC {
        Gate::Wait(Duration::from_secs_f64(remaining))
    } else {
        Gate::Skip {
            remaining_sec: remaining,
        }
    }
}
