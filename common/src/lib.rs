pub mod config;
pub mod control;
pub mod liveness;
pub mod net;
pub mod probe;
pub mod relay;
pub mod telemetry;
pub mod topics;
pub mod types;
pub mod update;

pub use config::{
    ConnectivityConfig, HeaterConfig, LivenessConfig, NetworkConfig, RuntimeConfig,
    TelemetryConfig,
};
pub use control::HeaterEngine;
pub use liveness::{LivenessOutcome, LivenessWatchdog};
pub use net::{ConnectivityGuardian, GuardianEvent, LinkError, NetworkLink, RestartHandle};
pub use probe::{
    ProbeFault, ProbeSample, TemperatureProbe, FAULT_DISCONNECTED_C, FAULT_POWER_ON_RESET_C,
};
pub use relay::{RelayDrive, RelayDriver};
pub use telemetry::{TelemetryBroadcaster, TelemetryRecord};
pub use topics::*;
pub use types::{HeaterStatus, RestartReason, StatusReport};
pub use update::{UpdateErrorKind, UpdateMonitor, UpdateStatusView};
