use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaterStatus {
    Off,
    Heating,
    TimedOut,
}

impl HeaterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Heating => "HEATING",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    IdleMaintenance,
    LivenessExhausted,
}

impl RestartReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleMaintenance => "idle maintenance window elapsed",
            Self::LivenessExhausted => "liveness exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(rename = "setpointC")]
    pub setpoint_c: f32,
    #[serde(rename = "temperatureC")]
    pub temperature_c: f32,
    pub status: &'static str,
    #[serde(rename = "heaterRequested")]
    pub heater_requested: bool,
    #[serde(rename = "sessionRemainingMs")]
    pub session_remaining_ms: u64,
    pub timer: String,
    #[serde(rename = "observerCount")]
    pub observer_count: usize,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_match_wire_format() {
        assert_eq!(HeaterStatus::Off.as_str(), "OFF");
        assert_eq!(HeaterStatus::Heating.as_str(), "HEATING");
        assert_eq!(HeaterStatus::TimedOut.as_str(), "TIMED_OUT");

        let json = serde_json::to_string(&HeaterStatus::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
    }
}
