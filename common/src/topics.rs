pub const TOPIC_HEATER_STATE: &str = "heater/state";
pub const TOPIC_HEATER_TELEMETRY: &str = "heater/telemetry";

pub const TOPIC_CMD_SETPOINT: &str = "heater/cmnd/setpoint";
pub const TOPIC_CMD_POWER: &str = "heater/cmnd/power";
