/// Reading reported by a DS18B20 when the bus transaction fails or the
/// device is absent.
pub const FAULT_DISCONNECTED_C: f32 = -127.0;
/// Power-on-reset value of the DS18B20 scratchpad, seen when a conversion
/// was never actually performed.
pub const FAULT_POWER_ON_RESET_C: f32 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFault {
    Disconnected,
    PowerOnReset,
    NotANumber,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeSample {
    Valid(f32),
    Fault(ProbeFault),
}

impl ProbeSample {
    /// Both reserved readings are treated identically downstream: the cycle
    /// is skipped and the previous relay/status stand.
    pub fn classify(celsius: f32) -> Self {
        if !celsius.is_finite() {
            return Self::Fault(ProbeFault::NotANumber);
        }
        if (celsius - FAULT_DISCONNECTED_C).abs() < f32::EPSILON {
            return Self::Fault(ProbeFault::Disconnected);
        }
        if (celsius - FAULT_POWER_ON_RESET_C).abs() < f32::EPSILON {
            return Self::Fault(ProbeFault::PowerOnReset);
        }
        Self::Valid(celsius)
    }
}

pub trait TemperatureProbe {
    /// Kick off a conversion. The matching read is expected to block for
    /// the sensor's conversion time; that wait is bounded by the driver.
    fn request_conversion(&mut self);

    fn read_celsius(&mut self) -> f32;

    fn sample(&mut self) -> ProbeSample {
        self.request_conversion();
        ProbeSample::classify(self.read_celsius())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_readings_classify_as_faults() {
        assert_eq!(
            ProbeSample::classify(-127.0),
            ProbeSample::Fault(ProbeFault::Disconnected)
        );
        assert_eq!(
            ProbeSample::classify(85.0),
            ProbeSample::Fault(ProbeFault::PowerOnReset)
        );
        assert_eq!(
            ProbeSample::classify(f32::NAN),
            ProbeSample::Fault(ProbeFault::NotANumber)
        );
    }

    #[test]
    fn ordinary_readings_pass_through() {
        assert_eq!(ProbeSample::classify(37.5), ProbeSample::Valid(37.5));
        assert_eq!(ProbeSample::classify(-10.0), ProbeSample::Valid(-10.0));
        // Close to, but not exactly, the reserved power-on value.
        assert_eq!(ProbeSample::classify(85.1), ProbeSample::Valid(85.1));
    }
}
