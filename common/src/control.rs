use crate::{
    config::HeaterConfig,
    probe::ProbeSample,
    relay::RelayDrive,
    types::{HeaterStatus, StatusReport},
};

/// Per-cycle relay decision from the latest probe sample, the setpoint, and
/// the session clock. Owns no hardware; the caller applies the returned
/// drive and handles timing.
#[derive(Debug, Clone)]
pub struct HeaterEngine {
    pub config: HeaterConfig,

    setpoint_c: f32,
    requested: bool,
    session_start_ms: u64,
    last_temperature_c: f32,
    status: HeaterStatus,
}

impl HeaterEngine {
    pub fn new(config: HeaterConfig) -> Self {
        let setpoint_c = config.default_setpoint_c;
        Self {
            config,
            setpoint_c,
            requested: false,
            session_start_ms: 0,
            last_temperature_c: 0.0,
            status: HeaterStatus::Off,
        }
    }

    pub fn setpoint_c(&self) -> f32 {
        self.setpoint_c
    }

    pub fn last_temperature_c(&self) -> f32 {
        self.last_temperature_c
    }

    pub fn status(&self) -> HeaterStatus {
        self.status
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// Stores a setpoint already parsed at the command surface, clamped to
    /// the configured range. Returns whether the stored value changed.
    pub fn set_setpoint(&mut self, celsius: f32) -> bool {
        if !celsius.is_finite() {
            return false;
        }
        let clamped = celsius.clamp(self.config.min_setpoint_c, self.config.max_setpoint_c);
        if (self.setpoint_c - clamped).abs() > f32::EPSILON {
            self.setpoint_c = clamped;
            true
        } else {
            false
        }
    }

    /// Arms the heater. Always restarts the session clock, including when a
    /// session is already running.
    pub fn start(&mut self, now_ms: u64) {
        self.requested = true;
        self.session_start_ms = now_ms;
    }

    /// Disarms the heater. The returned drive must be applied by the caller
    /// in the same cycle so a stop never waits on the next tick.
    pub fn stop(&mut self) -> RelayDrive {
        self.requested = false;
        self.status = HeaterStatus::Off;
        RelayDrive::Off
    }

    /// One control cycle. `None` means the cycle was skipped on a probe
    /// fault and neither relay nor status may be touched.
    pub fn tick(&mut self, sample: ProbeSample, now_ms: u64) -> Option<RelayDrive> {
        let celsius = match sample {
            ProbeSample::Valid(celsius) => celsius,
            ProbeSample::Fault(_) => return None,
        };
        self.last_temperature_c = celsius;

        if !self.requested {
            self.status = HeaterStatus::Off;
            return Some(RelayDrive::Off);
        }

        if now_ms.saturating_sub(self.session_start_ms) >= self.config.session_timeout_ms {
            self.requested = false;
            self.status = HeaterStatus::TimedOut;
            return Some(RelayDrive::Off);
        }

        if celsius >= self.setpoint_c {
            // `requested` deliberately stays true: the session keeps running
            // and heating resumes if the water cools below the setpoint
            // before the timeout.
            self.status = HeaterStatus::Off;
            return Some(RelayDrive::Off);
        }

        self.status = HeaterStatus::Heating;
        Some(RelayDrive::On)
    }

    pub fn session_remaining_ms(&self, now_ms: u64) -> u64 {
        if !self.requested {
            return 0;
        }
        let elapsed = now_ms.saturating_sub(self.session_start_ms);
        self.config.session_timeout_ms.saturating_sub(elapsed)
    }

    /// `M:SS` countdown while heating, `--:--` otherwise.
    pub fn remaining_time_string(&self, now_ms: u64) -> String {
        if self.status != HeaterStatus::Heating {
            return "--:--".to_string();
        }
        let remaining_secs = self.session_remaining_ms(now_ms) / 1000;
        format!("{}:{:02}", remaining_secs / 60, remaining_secs % 60)
    }

    pub fn status_report(
        &self,
        now_ms: u64,
        observer_count: usize,
        now_epoch: i64,
    ) -> StatusReport {
        StatusReport {
            setpoint_c: self.setpoint_c,
            temperature_c: self.last_temperature_c,
            status: self.status.as_str(),
            heater_requested: self.requested,
            session_remaining_ms: self.session_remaining_ms(now_ms),
            timer: self.remaining_time_string(now_ms),
            observer_count,
            now_epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeFault, FAULT_DISCONNECTED_C, FAULT_POWER_ON_RESET_C};
    use pretty_assertions::assert_eq;

    fn engine() -> HeaterEngine {
        HeaterEngine::new(HeaterConfig::default())
    }

    #[test]
    fn idle_engine_keeps_relay_off() {
        let mut engine = engine();

        assert_eq!(
            engine.tick(ProbeSample::Valid(20.0), 1_000),
            Some(RelayDrive::Off)
        );
        assert_eq!(engine.status(), HeaterStatus::Off);
    }

    #[test]
    fn heats_below_setpoint_within_session() {
        let mut engine = engine();
        engine.start(0);

        assert_eq!(
            engine.tick(ProbeSample::Valid(30.0), 1_000),
            Some(RelayDrive::On)
        );
        assert_eq!(engine.status(), HeaterStatus::Heating);
        assert_eq!(engine.last_temperature_c(), 30.0);
    }

    #[test]
    fn fault_samples_leave_relay_and_status_untouched() {
        let mut engine = engine();
        engine.start(0);
        engine.tick(ProbeSample::Valid(30.0), 1_000);
        assert_eq!(engine.status(), HeaterStatus::Heating);

        for fault in [
            ProbeSample::classify(FAULT_DISCONNECTED_C),
            ProbeSample::classify(FAULT_POWER_ON_RESET_C),
            ProbeSample::Fault(ProbeFault::NotANumber),
        ] {
            assert_eq!(engine.tick(fault, 2_000), None);
            assert_eq!(engine.status(), HeaterStatus::Heating);
            assert_eq!(engine.last_temperature_c(), 30.0);
            assert!(engine.is_requested());
        }
    }

    #[test]
    fn session_timeout_boundary_is_exact() {
        let mut engine = engine();
        engine.start(0);

        assert_eq!(
            engine.tick(ProbeSample::Valid(30.0), 1_799_999),
            Some(RelayDrive::On)
        );
        assert_eq!(engine.status(), HeaterStatus::Heating);

        assert_eq!(
            engine.tick(ProbeSample::Valid(30.0), 1_800_000),
            Some(RelayDrive::Off)
        );
        assert_eq!(engine.status(), HeaterStatus::TimedOut);
        assert!(!engine.is_requested());

        // The following cycle reports plain OFF again.
        assert_eq!(
            engine.tick(ProbeSample::Valid(30.0), 1_801_000),
            Some(RelayDrive::Off)
        );
        assert_eq!(engine.status(), HeaterStatus::Off);
    }

    #[test]
    fn stop_deenergizes_in_the_same_cycle() {
        let mut engine = engine();
        engine.start(0);
        engine.tick(ProbeSample::Valid(30.0), 1_000);
        assert_eq!(engine.status(), HeaterStatus::Heating);

        assert_eq!(engine.stop(), RelayDrive::Off);
        assert_eq!(engine.status(), HeaterStatus::Off);
        assert!(!engine.is_requested());
    }

    #[test]
    fn reaching_setpoint_keeps_session_armed() {
        let mut engine = engine();
        engine.set_setpoint(38.0);
        engine.start(0);

        let temps = [30.0, 35.0, 38.0, 38.0];
        let expected = [
            (RelayDrive::On, HeaterStatus::Heating),
            (RelayDrive::On, HeaterStatus::Heating),
            (RelayDrive::Off, HeaterStatus::Off),
            (RelayDrive::Off, HeaterStatus::Off),
        ];

        for (cycle, (temp, (drive, status))) in
            temps.iter().zip(expected.iter()).enumerate()
        {
            let now_ms = (cycle as u64 + 1) * 1_000;
            assert_eq!(engine.tick(ProbeSample::Valid(*temp), now_ms), Some(*drive));
            assert_eq!(engine.status(), *status);
        }

        assert!(engine.is_requested());
    }

    #[test]
    fn heating_resumes_when_water_cools_before_timeout() {
        let mut engine = engine();
        engine.set_setpoint(38.0);
        engine.start(0);

        engine.tick(ProbeSample::Valid(38.5), 1_000);
        assert_eq!(engine.status(), HeaterStatus::Off);

        assert_eq!(
            engine.tick(ProbeSample::Valid(37.0), 60_000),
            Some(RelayDrive::On)
        );
        assert_eq!(engine.status(), HeaterStatus::Heating);
    }

    #[test]
    fn restart_resets_the_session_clock() {
        let mut engine = engine();
        engine.start(0);
        engine.tick(ProbeSample::Valid(30.0), 1_700_000);

        engine.start(1_700_000);
        assert_eq!(
            engine.tick(ProbeSample::Valid(30.0), 1_900_000),
            Some(RelayDrive::On)
        );
        assert_eq!(engine.status(), HeaterStatus::Heating);
    }

    #[test]
    fn setpoint_is_clamped_to_configured_range() {
        let mut engine = engine();

        assert!(engine.set_setpoint(100.0));
        assert_eq!(engine.setpoint_c(), 45.0);

        assert!(engine.set_setpoint(-5.0));
        assert_eq!(engine.setpoint_c(), 25.0);

        assert!(!engine.set_setpoint(f32::NAN));
        assert_eq!(engine.setpoint_c(), 25.0);
    }

    #[test]
    fn timer_string_counts_down_only_while_heating() {
        let mut engine = engine();
        assert_eq!(engine.remaining_time_string(0), "--:--");

        engine.start(0);
        engine.tick(ProbeSample::Valid(30.0), 0);
        assert_eq!(engine.remaining_time_string(0), "30:00");
        assert_eq!(engine.remaining_time_string(61_000), "28:59");

        engine.stop();
        assert_eq!(engine.remaining_time_string(61_000), "--:--");
    }

    #[test]
    fn status_report_reflects_the_last_completed_cycle() {
        let mut engine = engine();
        engine.set_setpoint(40.0);
        engine.start(0);
        engine.tick(ProbeSample::Valid(31.5), 1_000);

        let report = engine.status_report(1_000, 2, 1_700_000_000);
        assert_eq!(report.status, "HEATING");
        assert_eq!(report.temperature_c, 31.5);
        assert_eq!(report.setpoint_c, 40.0);
        assert!(report.heater_requested);
        assert_eq!(report.observer_count, 2);
        assert_eq!(report.session_remaining_ms, 1_799_000);
    }
}
