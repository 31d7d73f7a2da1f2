use serde::Serialize;

use crate::mist_config::MistConfig;

/// Operating mode, encoded by the server as sentinel schedule values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Mode {
    /// `["00:00"]` to `["00:01"]`: never mist.
    Off,
    /// `["00:00"]` to `["23:59"]`: mist every run.
    On,
    /// Anything else: temperature and schedule decide.
    Auto,
}

pub(crate) fn classify(config: &MistConfig) -> Mode {
    let from = config.mist_time_from.as_slice();
    let to = config.mist_time_to.as_slice();

    match (from, to) {
        ([f], [t]) if f == "00:00" && t == "00:01" => Mode::Off,
        ([f], [t]) if f == "00:00" && t == "23:59" => Mode::On,
        _ => Mode::Auto,
    }
}
