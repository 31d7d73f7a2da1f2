//! Misting configuration as served by the farm server for this terminal.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::RunError;

/// Minutes between runs when the server sends nothing usable.
const DEFAULT_INTERVAL_MINUTES: i64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MistConfig {
    pub(crate) lower_threshold: f64,
    pub(crate) upper_threshold: f64,
    pub(crate) mist_sec: f64,
    #[serde(default)]
    pub(crate) mist_time_from: Vec<String>,
    #[serde(default)]
    pub(crate) mist_time_to: Vec<String>,
    #[serde(
        default = "default_interval_minutes",
        deserialize_with = "lenient_minutes"
    )]
    pub(crate) interval_minutes: i64,
}

fn default_interval_minutes() -> i64 {
    DEFAULT_INTERVAL_MINUTES
}

/// Accepts integers, floats (truncated), and numeric strings; anything else
/// falls back to the default. Values below one minute clamp to one.
fn lenient_minutes<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    let minutes = match &raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    Ok(match minutes {
        Some(m) => m.max(1),
        None => {
            tracing::warn!(value = %raw, "interval_minutes unusable, using {DEFAULT_INTERVAL_MINUTES}");
            DEFAULT_INTERVAL_MINUTES
        }
    })
}

impl MistConfig {
    /// Decode a server payload. Missing or mistyped required fields are a
    /// schema error, as is a from/to length mismatch.
    pub(crate) fn from_value(value: Value) -> Result<Self, RunError> {
        let config: MistConfig = serde_json::from_value(value)
            .map_err(|e| RunError::ConfigSchema(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), RunError> {
        if self.mist_time_from.len() != self.mist_time_to.len() {
            return Err(RunError::ConfigSchema(format!(
                "mist_time_from has {} entries but mist_time_to has {}",
                self.mist_time_from.len(),
                self.mist_time_to.len()
            )));
        }
        if !self.mist_sec.is_finite() || self.mist_sec < 0.0 {
            return Err(RunError::ConfigSchema(format!(
                "mist_sec must be a non-negative number, got {}",
                self.mist_sec
            )));
        }
        Ok(())
    }

    pub(crate) fn interval_sec(&self) -> i64 {
        self.interval_minutes.max(1).saturating_mul(60)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn config(from: &[&str], to: &[&str]) -> MistConfig {
        MistConfig {
            lower_threshold: 18.0,
            upper_threshold: 32.0,
            mist_sec: 10.0,
            mist_time_from: from.iter().map(|s| s.to_string()).collect(),
            mist_time_to: to.iter().map(|s| s.to_string()).collect(),
            interval_minutes: 1,
        }
    }

    fn payload(interval: Value) -> Value {
        json!({
            "lower_threshold": 18,
            "upper_threshold": 32.5,
            "mist_sec": 15,
            "mist_time_from": ["06:00", "13:00"],
            "mist_time_to": ["11:00", "17:30"],
            "interval_minutes": interval,
        })
    }

    #[test]
    fn decodes_server_payload() {
        let c = MistConfig::from_value(payload(json!(5))).unwrap();
        assert_eq!(c.lower_threshold, 18.0);
        assert_eq!(c.upper_threshold, 32.5);
        assert_eq!(c.mist_sec, 15.0);
        assert_eq!(c.mist_time_from, vec!["06:00", "13:00"]);
        assert_eq!(c.mist_time_to, vec!["11:00", "17:30"]);
        assert_eq!(c.interval_minutes, 5);
        assert_eq!(c.interval_sec(), 300);
    }

    #[test]
    fn interval_defaults_when_absent() {
        let mut v = payload(json!(null));
        v.as_object_mut().unwrap().remove("interval_minutes");
        let c = MistConfig::from_value(v).unwrap();
        assert_eq!(c.interval_minutes, 1);
        assert_eq!(c.interval_sec(), 60);
    }

    #[test]
    fn interval_lenient_forms() {
        let cases = [
            (json!(null), 1),
            (json!("abc"), 1),
            (json!("3"), 3),
            (json!(2.9), 2),
            (json!(0), 1),
            (json!(-4), 1),
            (json!([1]), 1),
        ];
        for (raw, expected) in cases {
            let c = MistConfig::from_value(payload(raw.clone())).unwrap();
            assert_eq!(c.interval_minutes, expected, "raw = {raw}");
        }
    }

    #[test]
    fn huge_interval_saturates_instead_of_wrapping() {
        for raw in [json!(i64::MAX), json!(1e30), json!("9223372036854775807")] {
            let c = MistConfig::from_value(payload(raw.clone())).unwrap();
            assert_eq!(c.interval_sec(), i64::MAX, "raw = {raw}");
        }
    }

    #[test]
    fn length_mismatch_is_schema_error() {
        let mut v = payload(json!(1));
        v["mist_time_to"] = json!(["11:00"]);
        let err = MistConfig::from_value(v).unwrap_err();
        assert!(matches!(err, RunError::ConfigSchema(ref m) if m.contains("2 entries")));
    }

    #[test]
    fn missing_windows_default_to_empty() {
        let mut v = payload(json!(1));
        let obj = v.as_object_mut().unwrap();
        obj.remove("mist_time_from");
        obj.remove("mist_time_to");
        let c = MistConfig::from_value(v).unwrap();
        assert!(c.mist_time_from.is_empty());
        assert!(c.mist_time_to.is_empty());
    }

    #[test]
    fn missing_one_window_list_is_mismatch() {
        let mut v = payload(json!(1));
        v.as_object_mut().unwrap().remove("mist_time_to");
        assert!(matches!(
            MistConfig::from_value(v),
            Err(RunError::ConfigSchema(_))
        ));
    }

    #[test]
    fn missing_threshold_is_schema_error() {
        let mut v = payload(json!(1));
        v.as_object_mut().unwrap().remove("upper_threshold");
        let err = MistConfig::from_value(v).unwrap_err();
        assert!(matches!(err, RunError::ConfigSchema(ref m) if m.contains("upper_threshold")));
    }

    #[test]
    fn negative_mist_sec_rejected() {
        let mut v = payload(json!(1));
        v["mist_sec"] = json!(-1);
        assert!(matches!(
            MistConfig::from_value(v),
            Err(RunError::ConfigSchema(_))
        ));
    }
}
