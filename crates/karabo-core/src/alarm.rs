//! Alarm severities derived from property thresholds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::value::Value;

/// Severity of a property or of a whole device, ordered by significance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmCondition {
    /// Within all thresholds.
    #[default]
    None,
    /// Outside a `warnLow`/`warnHigh` bound.
    Warn,
    /// Outside an `alarmLow`/`alarmHigh` bound.
    Alarm,
    /// Raised by the device itself, never by thresholds.
    Interlock,
}

impl AlarmCondition {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmCondition::None => "none",
            AlarmCondition::Warn => "warn",
            AlarmCondition::Alarm => "alarm",
            AlarmCondition::Interlock => "interlock",
        }
    }

    /// The more significant of two conditions.
    pub fn max(self, other: AlarmCondition) -> AlarmCondition {
        std::cmp::max(self, other)
    }
}

impl fmt::Display for AlarmCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmCondition {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AlarmCondition::None),
            "warn" => Ok(AlarmCondition::Warn),
            "alarm" => Ok(AlarmCondition::Alarm),
            "interlock" => Ok(AlarmCondition::Interlock),
            other => Err(CoreError::Schema(format!(
                "'{other}' is not a valid alarm condition"
            ))),
        }
    }
}

impl From<AlarmCondition> for Value {
    fn from(condition: AlarmCondition) -> Self {
        Value::String(condition.as_str().to_string())
    }
}

/// Warn and alarm thresholds of one numeric leaf.
///
/// Bounds are exclusive: a value equal to `alarm_high` is still fine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AlarmBounds {
    /// Lower warning threshold.
    pub warn_low: Option<f64>,
    /// Upper warning threshold.
    pub warn_high: Option<f64>,
    /// Lower alarm threshold.
    pub alarm_low: Option<f64>,
    /// Upper alarm threshold.
    pub alarm_high: Option<f64>,
}

impl AlarmBounds {
    /// True if no threshold is configured.
    pub fn is_empty(&self) -> bool {
        self.warn_low.is_none()
            && self.warn_high.is_none()
            && self.alarm_low.is_none()
            && self.alarm_high.is_none()
    }

    /// Severity of `value` against these bounds.
    pub fn evaluate(&self, value: f64) -> AlarmCondition {
        if value.is_nan() {
            return AlarmCondition::None;
        }
        let below = |b: Option<f64>| b.is_some_and(|b| value < b);
        let above = |b: Option<f64>| b.is_some_and(|b| value > b);
        if below(self.alarm_low) || above(self.alarm_high) {
            AlarmCondition::Alarm
        } else if below(self.warn_low) || above(self.warn_high) {
            AlarmCondition::Warn
        } else {
            AlarmCondition::None
        }
    }
}
