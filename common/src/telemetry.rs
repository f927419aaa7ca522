use serde::Serialize;

use crate::{config::TelemetryConfig, control::HeaterEngine};

/// Compact record pushed to connected observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub temp: f32,
    pub status: &'static str,
    pub timer: String,
}

/// Throttled, audience-aware push cadence: 1s while anyone is watching,
/// 5s otherwise.
#[derive(Debug)]
pub struct TelemetryBroadcaster {
    config: TelemetryConfig,
    last_fire_ms: u64,
}

impl TelemetryBroadcaster {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            last_fire_ms: 0,
        }
    }

    pub fn interval_ms(&self, observer_count: usize) -> u64 {
        if observer_count > 0 {
            self.config.active_interval_ms
        } else {
            self.config.idle_interval_ms
        }
    }

    pub fn due(&self, now_ms: u64, observer_count: usize) -> bool {
        now_ms.saturating_sub(self.last_fire_ms) >= self.interval_ms(observer_count)
    }

    /// Advances the cadence clock. Builds a record only when someone is
    /// listening, so idle firings skip the serialization work entirely.
    /// Every firing counts as liveness activity; the caller marks it.
    pub fn fire(
        &mut self,
        now_ms: u64,
        observer_count: usize,
        engine: &HeaterEngine,
    ) -> Option<TelemetryRecord> {
        self.last_fire_ms = now_ms;
        if observer_count == 0 {
            return None;
        }
        Some(TelemetryRecord {
            temp: engine.last_temperature_c(),
            status: engine.status().as_str(),
            timer: engine.remaining_time_string(now_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::HeaterConfig, probe::ProbeSample};
    use pretty_assertions::assert_eq;

    fn broadcaster() -> TelemetryBroadcaster {
        TelemetryBroadcaster::new(TelemetryConfig::default())
    }

    fn heating_engine() -> HeaterEngine {
        let mut engine = HeaterEngine::new(HeaterConfig::default());
        engine.start(0);
        engine.tick(ProbeSample::Valid(31.0), 0);
        engine
    }

    #[test]
    fn active_cadence_is_one_second() {
        let mut broadcaster = broadcaster();
        let engine = heating_engine();

        broadcaster.fire(0, 1, &engine);
        assert!(!broadcaster.due(999, 1));
        assert!(broadcaster.due(1_000, 1));
    }

    #[test]
    fn idle_cadence_is_five_seconds() {
        let mut broadcaster = broadcaster();
        let engine = heating_engine();

        broadcaster.fire(0, 0, &engine);
        assert!(!broadcaster.due(4_999, 0));
        assert!(broadcaster.due(5_000, 0));
    }

    #[test]
    fn zero_observers_skip_record_building_but_advance_the_clock() {
        let mut broadcaster = broadcaster();
        let engine = heating_engine();

        assert_eq!(broadcaster.fire(5_000, 0, &engine), None);
        assert!(!broadcaster.due(5_100, 0));
    }

    #[test]
    fn record_carries_temperature_status_and_timer() {
        let mut broadcaster = broadcaster();
        let engine = heating_engine();

        let record = broadcaster.fire(1_000, 3, &engine).unwrap();
        assert_eq!(record.temp, 31.0);
        assert_eq!(record.status, "HEATING");
        assert_eq!(record.timer, "29:59");
    }

    #[test]
    fn record_serializes_to_the_wire_shape() {
        let mut broadcaster = broadcaster();
        let engine = heating_engine();

        let record = broadcaster.fire(0, 1, &engine).unwrap();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(
            json,
            serde_json::json!({ "temp": 31.0, "status": "HEATING", "timer": "30:00" })
        );
    }

    #[test]
    fn idle_engine_reports_the_placeholder_timer() {
        let mut broadcaster = broadcaster();
        let mut engine = HeaterEngine::new(HeaterConfig::default());
        engine.tick(ProbeSample::Valid(22.0), 0);

        let record = broadcaster.fire(0, 1, &engine).unwrap();
        assert_eq!(record.status, "OFF");
        assert_eq!(record.timer, "--:--");
    }
}
