use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use heater_common::{
    config::NetworkConfig, ConnectivityGuardian, GuardianEvent, HeaterEngine, LinkError,
    LivenessOutcome, LivenessWatchdog, NetworkLink, RelayDriver, RestartHandle, RestartReason,
    RuntimeConfig, TelemetryBroadcaster, TemperatureProbe, UpdateErrorKind, UpdateMonitor,
    FAULT_DISCONNECTED_C, TOPIC_CMD_POWER, TOPIC_CMD_SETPOINT, TOPIC_HEATER_STATE,
    TOPIC_HEATER_TELEMETRY,
};

const NVS_NAMESPACE: &str = "heater";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const RELAY_PIN: i32 = 5;
const DS18B20_PIN: i32 = 4;

const MAX_HTTP_BODY: usize = 4096;
const UPDATE_CHUNK_SIZE: usize = 4096;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
// Hardware task watchdog; must outlast the bounded reassociation wait.
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const CONTROL_CYCLE_MS: u64 = 1_000;
const STATE_PUBLISH_INTERVAL_MS: u64 = 10_000;

const INDEX_HTML: &str = include_str!("../web/index.html");
const APP_JS: &str = include_str!("../web/app.js");
const STYLE_CSS: &str = include_str!("../web/style.css");

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<HeaterEngine>>,
    relay: Arc<Mutex<GpioRelay>>,
    watchdog: Arc<Mutex<LivenessWatchdog>>,
    update: Arc<Mutex<UpdateMonitor>>,
    mqtt_connected: Arc<AtomicBool>,
}

impl SharedState {
    fn mark_activity(&self) {
        self.watchdog.lock().unwrap().mark_activity(monotonic_ms());
    }

    /// The broker connection is the observer on this build; there is no
    /// per-client accounting like the host WebSocket hub has.
    fn observer_count(&self) -> usize {
        usize::from(self.mqtt_connected.load(Ordering::Relaxed))
    }
}

/// Heating element output. The line is active-low: driving it low
/// energizes the element.
struct GpioRelay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    energized: bool,
}

impl GpioRelay {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
            .map_err(|err| anyhow!("relay pin unavailable on GPIO{pin}: {err}"))?;
        driver.set_high()?;
        Ok(Self {
            pin: driver,
            energized: false,
        })
    }
}

impl RelayDriver for GpioRelay {
    fn set_energized(&mut self, energized: bool) {
        if self.energized == energized {
            return;
        }

        let result = if energized {
            self.pin.set_low()
        } else {
            self.pin.set_high()
        };

        match result {
            Ok(()) => {
                info!(
                    "relay {}",
                    if energized { "energized" } else { "de-energized" }
                );
                self.energized = energized;
            }
            Err(err) => warn!("failed to drive relay: {err}"),
        }
    }
}

/// DS18B20 on the one-wire bus. Failures surface as the reserved
/// disconnect reading so the control cycle's fault handling applies.
struct Ds18b20Probe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
}

impl Ds18b20Probe {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut bus_pin = PinDriver::input_output_od(pin)?;
        bus_pin.set_pull(Pull::Up)?;
        bus_pin.set_high()?;

        let one_wire = OneWire::new(bus_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            one_wire,
            address: None,
            delay: Ets,
        };
        probe.refresh_address();
        Ok(probe)
    }

    fn refresh_address(&mut self) {
        let mut first: Option<Address> = None;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    if address.family_code() == ds18b20::FAMILY_CODE {
                        first = Some(address);
                        break;
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = first;
        if let Some(address) = self.address {
            info!("DS18B20 ready on GPIO{} ({:?})", DS18B20_PIN, address);
        } else {
            warn!("no DS18B20 found on GPIO{}", DS18B20_PIN);
        }
    }
}

impl TemperatureProbe for Ds18b20Probe {
    fn request_conversion(&mut self) {
        if self.address.is_none() {
            self.refresh_address();
        }
        if self.address.is_none() {
            return;
        }

        match ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay) {
            Ok(()) => Resolution::Bits12.delay_for_measurement_time(&mut self.delay),
            Err(err) => {
                warn!("failed to start DS18B20 conversion: {err:?}");
                self.address = None;
            }
        }
    }

    fn read_celsius(&mut self) -> f32 {
        let Some(address) = self.address else {
            return FAULT_DISCONNECTED_C;
        };

        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {:?}: {err:?}", address);
                self.address = None;
                return FAULT_DISCONNECTED_C;
            }
        };

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => data.temperature,
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                FAULT_DISCONNECTED_C
            }
        }
    }
}

/// Station link over the wifi driver's raw interface, so the driver handle
/// itself can stay pinned on the main thread. The station configuration
/// (and any static netif addressing) applied at boot survives an interface
/// stop/start cycle.
struct EspLink {
    reassociate_timeout_ms: u64,
    post_reset_grace_ms: u64,
}

impl EspLink {
    fn wait_for_association(&self, timeout_ms: u64) -> Result<(), LinkError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            feed_watchdog();
            if is_wifi_station_connected() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(500));
        }
        Err(LinkError::Timeout { timeout_ms })
    }
}

fn esp_call(rc: i32, what: &str) -> Result<(), LinkError> {
    if rc == esp_idf_svc::sys::ESP_OK {
        Ok(())
    } else {
        Err(LinkError::Interface(format!("{what} failed: esp_err_t={rc}")))
    }
}

impl NetworkLink for EspLink {
    fn is_associated(&mut self) -> bool {
        is_wifi_station_connected()
    }

    fn reassociate(&mut self) -> Result<(), LinkError> {
        // May already be disassociated; the disconnect result is irrelevant.
        let _ = unsafe { esp_idf_svc::sys::esp_wifi_disconnect() };
        esp_call(
            unsafe { esp_idf_svc::sys::esp_wifi_connect() },
            "esp_wifi_connect",
        )?;
        self.wait_for_association(self.reassociate_timeout_ms)
    }

    fn hard_reset(&mut self) -> Result<(), LinkError> {
        let _ = unsafe { esp_idf_svc::sys::esp_wifi_disconnect() };
        let _ = unsafe { esp_idf_svc::sys::esp_wifi_stop() };
        thread::sleep(Duration::from_millis(500));
        esp_call(
            unsafe { esp_idf_svc::sys::esp_wifi_set_mode(esp_idf_svc::sys::wifi_mode_t_WIFI_MODE_STA) },
            "esp_wifi_set_mode",
        )?;
        esp_call(
            unsafe { esp_idf_svc::sys::esp_wifi_start() },
            "esp_wifi_start",
        )?;
        esp_call(
            unsafe { esp_idf_svc::sys::esp_wifi_connect() },
            "esp_wifi_connect",
        )?;
        self.wait_for_association(self.post_reset_grace_ms)
    }
}

struct EspRestart;

impl RestartHandle for EspRestart {
    fn request_restart(&mut self, reason: RestartReason) {
        warn!("restarting device: {}", reason.as_str());
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

#[derive(Debug, Deserialize)]
struct UpdateApplyRequest {
    url: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    reboot: Option<bool>,
}

#[derive(Debug, Serialize)]
struct UpdateApplyResponse {
    accepted: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "config loaded: ssid=`{}`, static_ip={}, mqtt=`{}:{}`",
        runtime.network.wifi_ssid,
        runtime.network.use_static_ip,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
    );

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let relay = GpioRelay::new(RELAY_PIN)?;
    let probe = Ds18b20Probe::new(pins.gpio4.downgrade()).context("probe setup failed")?;

    let wifi = connect_wifi(modem, sys_loop.clone(), nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let shared_state = SharedState {
        engine: Arc::new(Mutex::new(HeaterEngine::new(runtime.heater.clone()))),
        relay: Arc::new(Mutex::new(relay)),
        watchdog: Arc::new(Mutex::new(LivenessWatchdog::new(runtime.liveness.clone()))),
        update: Arc::new(Mutex::new(UpdateMonitor::default())),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
    };

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));

    subscribe_topics(&mqtt_client)?;
    spawn_mqtt_receiver(shared_state.clone(), mqtt_conn, mqtt_client.clone());
    spawn_control_loop(shared_state.clone(), runtime.clone(), probe, mqtt_client);

    let server = create_http_server(shared_state, runtime.network.clone())?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn spawn_control_loop(
    state: SharedState,
    runtime: RuntimeConfig,
    mut probe: Ds18b20Probe,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut guardian = ConnectivityGuardian::new(runtime.connectivity.clone());
            let mut broadcaster = TelemetryBroadcaster::new(runtime.telemetry.clone());
            let mut link = EspLink {
                reassociate_timeout_ms: runtime.connectivity.reassociate_timeout_ms,
                post_reset_grace_ms: runtime.liveness.post_reset_grace_ms,
            };
            let mut restart = EspRestart;

            let mut last_cycle_ms = 0_u64;
            let mut last_state_publish_ms = 0_u64;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if now_ms.saturating_sub(last_cycle_ms) >= CONTROL_CYCLE_MS {
                    last_cycle_ms = now_ms;

                    let sample = probe.sample();
                    let (drive, requested) = {
                        let mut engine = state.engine.lock().unwrap();
                        (engine.tick(sample, now_ms), engine.is_requested())
                    };

                    match drive {
                        Some(drive) => state.relay.lock().unwrap().apply(drive),
                        None => warn!("probe fault ({sample:?}); control cycle skipped"),
                    }

                    {
                        let mut relay = state.relay.lock().unwrap();
                        let events = guardian.poll(
                            now_ms,
                            requested,
                            &mut link,
                            &mut *relay,
                            &mut restart,
                        );
                        for event in &events {
                            log_guardian_event(event);
                        }
                    }
                }

                let observer_count = state.observer_count();
                if broadcaster.due(now_ms, observer_count) {
                    let record = {
                        let engine = state.engine.lock().unwrap();
                        broadcaster.fire(now_ms, observer_count, &engine)
                    };

                    if let Some(record) = record {
                        match serde_json::to_vec(&record) {
                            Ok(payload) => {
                                let mut client = mqtt.lock().unwrap();
                                if let Err(err) = client.publish(
                                    TOPIC_HEATER_TELEMETRY,
                                    QoS::AtMostOnce,
                                    false,
                                    &payload,
                                ) {
                                    warn!("telemetry publish failed: {err:?}");
                                }
                            }
                            Err(err) => warn!("telemetry serialization failed: {err}"),
                        }
                    }

                    // The cadence itself is evidence of a live transport.
                    state.watchdog.lock().unwrap().mark_activity(now_ms);
                }

                if now_ms.saturating_sub(last_state_publish_ms) >= STATE_PUBLISH_INTERVAL_MS {
                    last_state_publish_ms = now_ms;
                    if let Err(err) = publish_state(&state, &mqtt) {
                        warn!("state publish failed: {err:#}");
                    }
                }

                let outcome = {
                    let mut watchdog = state.watchdog.lock().unwrap();
                    let mut relay = state.relay.lock().unwrap();
                    watchdog.check(now_ms, &mut link, &mut *relay, &mut restart)
                };
                log_liveness_outcome(outcome);

                thread::sleep(Duration::from_millis(200));
            }
        })
        .expect("failed to spawn control loop thread");
}

fn publish_state(
    state: &SharedState,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    let report = {
        let engine = state.engine.lock().unwrap();
        engine.status_report(monotonic_ms(), state.observer_count(), Utc::now().timestamp())
    };
    let payload = serde_json::to_vec(&report)?;

    let mut client = mqtt.lock().unwrap();
    client.publish(TOPIC_HEATER_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("heater-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap();
    for topic in [TOPIC_CMD_SETPOINT, TOPIC_CMD_POWER] {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            loop {
                match conn.next() {
                    Ok(event) => {
                        state.mqtt_connected.store(true, Ordering::Relaxed);

                        if let EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details,
                            ..
                        } = event.payload()
                        {
                            // Only complete payloads are processed.
                            if !matches!(details, Details::Complete) {
                                continue;
                            }

                            if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                                warn!(
                                    "dropping oversized MQTT payload on topic {} ({} bytes)",
                                    topic,
                                    data.len()
                                );
                                continue;
                            }

                            if let Ok(message) = core::str::from_utf8(data) {
                                handle_mqtt_message(&state, topic, message);
                            }
                        }
                    }
                    Err(err) => {
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                        warn!("mqtt receive loop error: {err:?}");
                        thread::sleep(Duration::from_secs(2));
                        if let Err(sub_err) = subscribe_topics(&mqtt) {
                            warn!("mqtt re-subscribe failed: {sub_err:#}");
                        }
                    }
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn handle_mqtt_message(state: &SharedState, topic: &str, message: &str) {
    let now_ms = monotonic_ms();

    match topic {
        TOPIC_CMD_SETPOINT => {
            if let Ok(setpoint) = message.parse::<f32>() {
                if setpoint.is_finite() {
                    {
                        let mut engine = state.engine.lock().unwrap();
                        if engine.set_setpoint(setpoint) {
                            info!("setpoint set to {:.1}C via mqtt", engine.setpoint_c());
                        }
                    }
                    state.mark_activity();
                }
            } else {
                warn!("ignoring unparseable setpoint payload `{message}`");
            }
        }
        TOPIC_CMD_POWER => {
            if message.eq_ignore_ascii_case("start") || message.eq_ignore_ascii_case("on") {
                state.engine.lock().unwrap().start(now_ms);
                info!("heater session started via mqtt");
                state.mark_activity();
            } else if message.eq_ignore_ascii_case("stop") || message.eq_ignore_ascii_case("off") {
                let drive = state.engine.lock().unwrap().stop();
                state.relay.lock().unwrap().apply(drive);
                info!("heater stopped via mqtt");
                state.mark_activity();
            } else {
                warn!("ignoring unknown power payload `{message}`");
            }
        }
        _ => {}
    }
}

fn create_http_server(
    state: SharedState,
    network: NetworkConfig,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            state.mark_activity();
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/app.js", Method::Get, move |req| {
        req.into_response(
            200,
            Some("OK"),
            &[("Content-Type", "application/javascript; charset=utf-8")],
        )?
        .write_all(APP_JS.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/style.css", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/css; charset=utf-8")])?
            .write_all(STYLE_CSS.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            state.mark_activity();
            let report = build_status(&state);
            write_json(req, &report)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/slider", Method::Get, move |req| {
            state.mark_activity();
            let uri = req.uri().to_string();

            let Some(value) = query_param(&uri, "value") else {
                warn!("slider request without 'value' parameter; ignored");
                return write_error(req, 400, "Missing 'value' parameter");
            };
            let Ok(setpoint) = value.parse::<f32>() else {
                warn!("slider request with unparseable value `{value}`; ignored");
                return write_error(req, 400, "Invalid setpoint value");
            };

            {
                let mut engine = state.engine.lock().unwrap();
                if engine.set_setpoint(setpoint) {
                    info!("setpoint set to {:.1}C", engine.setpoint_c());
                }
            }

            let report = build_status(&state);
            write_json(req, &report)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/toggle", Method::Get, move |req| {
            state.mark_activity();
            let uri = req.uri().to_string();

            let Some(action) = query_param(&uri, "action") else {
                warn!("toggle request without 'action' parameter; ignored");
                return write_error(req, 400, "Missing 'action' parameter");
            };

            match action.as_str() {
                "start" => {
                    state.engine.lock().unwrap().start(monotonic_ms());
                    info!("heater session started");
                }
                "stop" => {
                    // Drive the relay directly so de-energization never
                    // waits on the next control cycle.
                    let drive = state.engine.lock().unwrap().stop();
                    state.relay.lock().unwrap().apply(drive);
                    info!("heater stopped");
                }
                other => {
                    warn!("toggle request with unknown action `{other}`; ignored");
                    return write_error(req, 400, "Invalid action. Use 'start' or 'stop'");
                }
            }

            let report = build_status(&state);
            write_json(req, &report)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/update/status", Method::Get, move |req| {
            let view = state.update.lock().unwrap().status_view();
            write_json(req, &view)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/update/apply", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let request: UpdateApplyRequest =
                serde_json::from_slice(&body).context("invalid update payload")?;

            if let Err(message) = validate_update_apply_request(&request) {
                return write_error(req, 400, message);
            }

            match apply_update(&state, &network, request) {
                Ok(payload) => write_json(req, &payload),
                Err(err) => {
                    let message = err.to_string();
                    if message.contains("invalid update password") {
                        write_error(req, 403, &message)
                    } else if message.contains("already in progress") {
                        write_error(req, 409, &message)
                    } else {
                        write_error(req, 500, "Failed to start update")
                    }
                }
            }
        })?;
    }

    Ok(server)
}

fn build_status(state: &SharedState) -> heater_common::StatusReport {
    let engine = state.engine.lock().unwrap();
    engine.status_report(monotonic_ms(), state.observer_count(), Utc::now().timestamp())
}

fn validate_update_apply_request(request: &UpdateApplyRequest) -> Result<(), &'static str> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err("url cannot be empty");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err("url must start with http:// or https://");
    }

    if let Some(sha256) = request.sha256.as_ref() {
        let value = sha256.trim();
        if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err("sha256 must be 64 hex characters");
        }
    }

    Ok(())
}

fn apply_update(
    state: &SharedState,
    network: &NetworkConfig,
    request: UpdateApplyRequest,
) -> anyhow::Result<UpdateApplyResponse> {
    if !network.ota_password.is_empty() {
        let supplied = request.password.as_deref().unwrap_or_default();
        if supplied != network.ota_password {
            state
                .update
                .lock()
                .unwrap()
                .on_error(UpdateErrorKind::Auth, Utc::now().timestamp());
            return Err(anyhow!("invalid update password"));
        }
    }

    {
        let mut monitor = state.update.lock().unwrap();
        if monitor.in_progress() {
            return Err(anyhow!("update already in progress"));
        }
        // Forces the relay off before any image bytes move.
        let mut relay = state.relay.lock().unwrap();
        monitor.on_start(&mut *relay);
    }

    let state_for_thread = state.clone();
    let spawn_result = thread::Builder::new()
        .name("update-apply".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            let reboot_after_apply = request.reboot.unwrap_or(true);
            let expected_sha = request
                .sha256
                .as_ref()
                .map(|value| value.trim().to_ascii_lowercase());

            match download_and_apply_update(&state_for_thread, &request.url, expected_sha.as_deref())
            {
                Ok(bytes_written) => {
                    state_for_thread
                        .update
                        .lock()
                        .unwrap()
                        .on_end(Utc::now().timestamp());
                    info!("update applied successfully ({bytes_written} bytes)");

                    if reboot_after_apply {
                        thread::sleep(Duration::from_millis(800));
                        unsafe { esp_idf_svc::sys::esp_restart() };
                    }
                }
                Err(kind) => {
                    warn!("update failed: {kind}");
                    state_for_thread
                        .update
                        .lock()
                        .unwrap()
                        .on_error(kind, Utc::now().timestamp());
                }
            }
        });

    if let Err(err) = spawn_result {
        state
            .update
            .lock()
            .unwrap()
            .on_error(UpdateErrorKind::Begin, Utc::now().timestamp());
        return Err(anyhow!("failed to spawn update thread: {err}"));
    }

    Ok(UpdateApplyResponse {
        accepted: true,
        in_progress: true,
    })
}

fn download_and_apply_update(
    state: &SharedState,
    url: &str,
    expected_sha256: Option<&str>,
) -> Result<u64, UpdateErrorKind> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };

    let connection = EspHttpConnection::new(&http_conf).map_err(|err| {
        warn!("update client init failed: {err:?}");
        UpdateErrorKind::Connect
    })?;
    let mut client = HttpClient::wrap(connection);
    let request = client.request(Method::Get, url, &[]).map_err(|err| {
        warn!("update request failed: {err:?}");
        UpdateErrorKind::Connect
    })?;
    let mut response = request.submit().map_err(|err| {
        warn!("update download failed: {err:?}");
        UpdateErrorKind::Connect
    })?;

    let status = response.status();
    if !(200..300).contains(&status) {
        warn!("update download failed with HTTP {status}");
        return Err(UpdateErrorKind::Connect);
    }

    let content_length = response
        .header("content-length")
        .or_else(|| response.header("Content-Length"))
        .and_then(|value| value.parse::<u64>().ok());

    let mut ota = EspOta::new().map_err(|err| {
        warn!("failed to acquire update handle: {err:?}");
        UpdateErrorKind::Begin
    })?;
    let mut update = ota.initiate_update().map_err(|err| {
        warn!("failed to initiate update: {err:?}");
        UpdateErrorKind::Begin
    })?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = [0_u8; UPDATE_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|err| {
            warn!("update receive failed: {err:?}");
            UpdateErrorKind::Receive
        })?;
        if read == 0 {
            break;
        }

        update.write(&chunk[..read]).map_err(|err| {
            warn!("failed writing update data: {err:?}");
            UpdateErrorKind::Receive
        })?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);

        state
            .update
            .lock()
            .unwrap()
            .on_progress(total_written, content_length);
    }

    if total_written == 0 {
        warn!("update download body is empty");
        return Err(UpdateErrorKind::Receive);
    }

    let digest = hasher.finalize();
    let mut digest_hex = String::with_capacity(64);
    for byte in digest {
        use core::fmt::Write as _;
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }

    if let Some(expected) = expected_sha256 {
        if digest_hex != expected {
            warn!("sha256 mismatch (expected {expected}, got {digest_hex})");
            return Err(UpdateErrorKind::End);
        }
    }

    update.complete().map_err(|err| {
        warn!("failed finalizing update image: {err:?}");
        UpdateErrorKind::End
    })?;

    Ok(total_written)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(value.replace('+', " "));
        }
    }

    None
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn build_static_ip_config(network: &NetworkConfig) -> anyhow::Result<Option<NetifConfiguration>> {
    if !network.use_static_ip {
        return Ok(None);
    }

    let static_ip = network
        .static_ip
        .ok_or_else(|| anyhow!("static_ip is required when use_static_ip is true"))?;
    let gateway = network
        .gateway
        .ok_or_else(|| anyhow!("gateway is required when use_static_ip is true"))?;
    let subnet = network
        .subnet
        .ok_or_else(|| anyhow!("subnet is required when use_static_ip is true"))?;

    let mask_ip = ipv4_from_octets(subnet);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {}", mask_ip))?;

    let mut conf = NetifConfiguration::wifi_default_client();
    conf.ip_configuration = Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
        IpClientSettings {
            ip: ipv4_from_octets(static_ip),
            subnet: Subnet {
                gateway: ipv4_from_octets(gateway),
                mask,
            },
            dns: network.dns.map(ipv4_from_octets),
            secondary_dns: None,
        },
    )));

    Ok(Some(conf))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if let Some(conf) = build_static_ip_config(network)? {
        let sta_netif = EspNetif::new_with_conf(&conf)?;
        esp_wifi
            .swap_netif_sta(sta_netif)
            .context("failed to apply static IP netif configuration")?;
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !has_station_credentials(network) {
        return Err(anyhow!("wifi credentials missing; provision NVS first"));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut connected = false;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    connected = true;
                    break;
                }
                Err(err) => warn!("wifi netif up failed on attempt {attempt}: {err:#}"),
            },
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if !connected {
        // Boot continues regardless; the reconnect escalation owns recovery
        // from here.
        warn!("wifi not associated after {WIFI_CONNECT_ATTEMPTS} attempts; continuing");
    }

    Ok(esp_wifi)
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let mut nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 4096];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn log_guardian_event(event: &GuardianEvent) {
    match event {
        GuardianEvent::Reassociated => info!("wifi reassociated"),
        GuardianEvent::ReassociationFailed { consecutive, error } => {
            warn!("wifi reassociation failed ({consecutive} consecutive): {error}")
        }
        GuardianEvent::InterfaceReset { recovered } => {
            warn!("wifi interface hard reset (recovered: {recovered})")
        }
        GuardianEvent::IdleRestartRequested => warn!("idle maintenance restart requested"),
    }
}

fn log_liveness_outcome(outcome: LivenessOutcome) {
    match outcome {
        LivenessOutcome::Alive => {}
        LivenessOutcome::SpuriousTripRefreshed => {
            info!("liveness trip with link up; activity refreshed")
        }
        LivenessOutcome::RecoveredAfterReset => {
            warn!("liveness trip recovered after interface reset")
        }
        LivenessOutcome::RestartRequested => warn!("liveness exhausted; restart requested"),
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
