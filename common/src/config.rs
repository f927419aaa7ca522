use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaterConfig {
    pub session_timeout_ms: u64,
    pub min_setpoint_c: f32,
    pub max_setpoint_c: f32,
    pub default_setpoint_c: f32,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 1_800_000,
            min_setpoint_c: 25.0,
            max_setpoint_c: 45.0,
            default_setpoint_c: 38.0,
        }
    }
}

impl HeaterConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if !self.min_setpoint_c.is_finite()
            || !self.max_setpoint_c.is_finite()
            || self.min_setpoint_c >= self.max_setpoint_c
        {
            self.min_setpoint_c = defaults.min_setpoint_c;
            self.max_setpoint_c = defaults.max_setpoint_c;
        }

        if !self.default_setpoint_c.is_finite() {
            self.default_setpoint_c = defaults.default_setpoint_c;
        }
        self.default_setpoint_c = self
            .default_setpoint_c
            .clamp(self.min_setpoint_c, self.max_setpoint_c);

        self.session_timeout_ms = self.session_timeout_ms.max(60_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    pub poll_interval_ms: u64,
    pub reassociate_timeout_ms: u64,
    pub failure_threshold: u32,
    pub idle_restart_interval_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            reassociate_timeout_ms: 30_000,
            failure_threshold: 3,
            idle_restart_interval_ms: 1_800_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    pub activity_timeout_ms: u64,
    pub post_reset_grace_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            activity_timeout_ms: 60_000,
            post_reset_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub active_interval_ms: u64,
    pub idle_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 1_000,
            idle_interval_ms: 5_000,
        }
    }
}

/// Station identity and addressing. Provisioned out of band; the control
/// core treats this as opaque and only the link implementations read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub ota_password: String,
    pub use_static_ip: bool,
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            ota_password: String::new(),
            use_static_ip: false,
            static_ip: None,
            gateway: None,
            subnet: None,
            dns: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub heater: HeaterConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.heater.sanitize();

        self.connectivity.failure_threshold = self.connectivity.failure_threshold.max(1);
        self.connectivity.poll_interval_ms = self.connectivity.poll_interval_ms.max(1_000);
        self.connectivity.reassociate_timeout_ms =
            self.connectivity.reassociate_timeout_ms.max(1_000);
        self.connectivity.idle_restart_interval_ms =
            self.connectivity.idle_restart_interval_ms.max(60_000);

        self.liveness.activity_timeout_ms = self.liveness.activity_timeout_ms.max(10_000);
        self.liveness.post_reset_grace_ms = self.liveness.post_reset_grace_ms.max(500);

        self.telemetry.active_interval_ms = self.telemetry.active_interval_ms.max(250);
        self.telemetry.idle_interval_ms = self
            .telemetry
            .idle_interval_ms
            .max(self.telemetry.active_interval_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_restores_inverted_setpoint_range() {
        let mut config = HeaterConfig {
            min_setpoint_c: 50.0,
            max_setpoint_c: 20.0,
            ..HeaterConfig::default()
        };
        config.sanitize();

        assert_eq!(config.min_setpoint_c, 25.0);
        assert_eq!(config.max_setpoint_c, 45.0);
    }

    #[test]
    fn sanitize_clamps_default_setpoint_into_range() {
        let mut config = HeaterConfig {
            default_setpoint_c: 90.0,
            ..HeaterConfig::default()
        };
        config.sanitize();

        assert_eq!(config.default_setpoint_c, 45.0);
    }

    #[test]
    fn sanitize_keeps_idle_cadence_at_least_active() {
        let mut runtime = RuntimeConfig::default();
        runtime.telemetry.active_interval_ms = 2_000;
        runtime.telemetry.idle_interval_ms = 500;
        runtime.sanitize();

        assert_eq!(runtime.telemetry.idle_interval_ms, 2_000);
    }

    #[test]
    fn runtime_config_round_trips_through_json() {
        let runtime = RuntimeConfig::default();
        let json = serde_json::to_string(&runtime).unwrap();
        let parsed: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            parsed.heater.session_timeout_ms,
            runtime.heater.session_timeout_ms
        );
        assert_eq!(parsed.network.mqtt_port, runtime.network.mqtt_port);
    }

    #[test]
    fn partial_config_fills_missing_sections_with_defaults() {
        let parsed: RuntimeConfig =
            serde_json::from_str(r#"{"network":{"wifi_ssid":"tub","wifi_pass":"secret","mqtt_host":"10.0.0.5","mqtt_port":1883,"mqtt_user":"","mqtt_pass":"","ota_password":"","use_static_ip":false,"static_ip":null,"gateway":null,"subnet":null,"dns":null}}"#)
                .unwrap();

        assert_eq!(parsed.network.wifi_ssid, "tub");
        assert_eq!(parsed.heater.session_timeout_ms, 1_800_000);
        assert_eq!(parsed.telemetry.idle_interval_ms, 5_000);
    }
}
