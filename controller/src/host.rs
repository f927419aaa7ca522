use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use heater_common::{
    ConnectivityGuardian, GuardianEvent, HeaterEngine, LinkError, LivenessOutcome,
    LivenessWatchdog, NetworkLink, RelayDriver, RestartHandle, RestartReason, RuntimeConfig,
    TelemetryBroadcaster, TelemetryConfig, TemperatureProbe, UpdateMonitor, TOPIC_CMD_POWER,
    TOPIC_CMD_SETPOINT, TOPIC_HEATER_STATE, TOPIC_HEATER_TELEMETRY,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<HeaterEngine>>,
    relay: Arc<Mutex<SimRelay>>,
    watchdog: Arc<Mutex<LivenessWatchdog>>,
    update: Arc<Mutex<UpdateMonitor>>,
    observers: ObserverHub,
    mqtt: AsyncClient,
}

impl AppState {
    async fn mark_activity(&self) {
        self.watchdog.lock().await.mark_activity(monotonic_ms());
    }
}

/// Connected telemetry subscribers: a broadcast fan-out plus a live count
/// the broadcaster uses for its cadence and skip decisions.
#[derive(Clone)]
struct ObserverHub {
    sender: broadcast::Sender<String>,
    count: Arc<AtomicUsize>,
}

impl ObserverHub {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn observer_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn broadcast(&self, payload: String) {
        // Send only fails when no receiver is subscribed, which the caller
        // already rules out by checking the count.
        let _ = self.sender.send(payload);
    }
}

/// Host stand-in for the relay output; logs drive transitions instead of
/// toggling a GPIO line.
#[derive(Debug, Default)]
struct SimRelay {
    energized: bool,
}

impl RelayDriver for SimRelay {
    fn set_energized(&mut self, energized: bool) {
        if self.energized != energized {
            info!(
                "relay {}",
                if energized { "energized" } else { "de-energized" }
            );
            self.energized = energized;
        }
    }
}

/// Simulated tub: warms while the element is on, drifts back toward
/// ambient otherwise.
struct SimProbe {
    celsius: f32,
    ambient_c: f32,
    element_on: bool,
}

impl SimProbe {
    fn new() -> Self {
        let start = std::env::var("HEATER_SIM_START_C")
            .ok()
            .and_then(|value| value.parse::<f32>().ok())
            .unwrap_or(24.0);
        Self {
            celsius: start,
            ambient_c: 22.0,
            element_on: false,
        }
    }

    fn note_element(&mut self, energized: bool) {
        self.element_on = energized;
    }
}

impl TemperatureProbe for SimProbe {
    fn request_conversion(&mut self) {
        // Hardware integration point: the DS18B20 driver starts a real
        // conversion here; the simulation just advances its model.
        if self.element_on {
            self.celsius += 0.08;
        } else if self.celsius > self.ambient_c {
            self.celsius -= 0.02;
        }
    }

    fn read_celsius(&mut self) -> f32 {
        self.celsius
    }
}

/// The host build sits on loopback; association never drops.
#[derive(Debug, Default)]
struct HostLink;

impl NetworkLink for HostLink {
    fn is_associated(&mut self) -> bool {
        true
    }

    fn reassociate(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Exits with a nonzero code and leaves the restart to process
/// supervision, the host equivalent of a device reboot.
struct ProcessRestart;

impl RestartHandle for ProcessRestart {
    fn request_restart(&mut self, reason: RestartReason) {
        warn!("restarting process: {}", reason.as_str());
        std::process::exit(1);
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = load_runtime_config();
    runtime.sanitize();

    let engine = HeaterEngine::new(runtime.heater.clone());

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("heater-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        relay: Arc::new(Mutex::new(SimRelay::default())),
        watchdog: Arc::new(Mutex::new(LivenessWatchdog::new(runtime.liveness.clone()))),
        update: Arc::new(Mutex::new(UpdateMonitor::default())),
        observers: ObserverHub::new(),
        mqtt,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone(), runtime.clone());
    spawn_telemetry_loop(app_state.clone(), runtime.telemetry.clone());
    spawn_state_publish_loop(app_state.clone());

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/", get(handle_index))
        .route("/slider", get(handle_slider))
        .route("/toggle", get(handle_toggle))
        .route("/api/status", get(handle_status))
        .route("/api/update/status", get(handle_update_status))
        .route("/ws", get(handle_ws))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("HEATER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_runtime_config() -> RuntimeConfig {
    let path = std::env::var("HEATER_CONFIG").unwrap_or_else(|_| "./heater.json".to_string());

    match std::fs::read(&path) {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
            warn!("invalid config at {path}: {err}; using defaults");
            RuntimeConfig::default()
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => RuntimeConfig::default(),
        Err(err) => {
            warn!("failed to read config at {path}: {err}; using defaults");
            RuntimeConfig::default()
        }
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_CMD_SETPOINT, TOPIC_CMD_POWER] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState, runtime: RuntimeConfig) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut probe = SimProbe::new();
        let mut guardian = ConnectivityGuardian::new(runtime.connectivity.clone());
        let mut link = HostLink;
        let mut restart = ProcessRestart;

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let sample = probe.sample();
            let (drive, requested) = {
                let mut engine = app_state.engine.lock().await;
                (engine.tick(sample, now_ms), engine.is_requested())
            };

            match drive {
                Some(drive) => {
                    let mut relay = app_state.relay.lock().await;
                    relay.apply(drive);
                    probe.note_element(drive.energized());
                }
                None => warn!("probe fault ({sample:?}); control cycle skipped"),
            }

            {
                let mut relay = app_state.relay.lock().await;
                let events =
                    guardian.poll(now_ms, requested, &mut link, &mut *relay, &mut restart);
                for event in &events {
                    log_guardian_event(event);
                }
            }

            let outcome = {
                let mut watchdog = app_state.watchdog.lock().await;
                let mut relay = app_state.relay.lock().await;
                watchdog.check(now_ms, &mut link, &mut *relay, &mut restart)
            };
            log_liveness_outcome(outcome);
        }
    });
}

fn spawn_telemetry_loop(app_state: AppState, config: TelemetryConfig) {
    tokio::spawn(async move {
        let mut broadcaster = TelemetryBroadcaster::new(config);
        let mut interval = tokio::time::interval(Duration::from_millis(250));

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();
            let observer_count = app_state.observers.observer_count();

            if !broadcaster.due(now_ms, observer_count) {
                continue;
            }

            let record = {
                let engine = app_state.engine.lock().await;
                broadcaster.fire(now_ms, observer_count, &engine)
            };

            if let Some(record) = record {
                match serde_json::to_string(&record) {
                    Ok(payload) => {
                        app_state.observers.broadcast(payload.clone());
                        if let Err(err) = app_state
                            .mqtt
                            .publish(TOPIC_HEATER_TELEMETRY, QoS::AtMostOnce, false, payload)
                            .await
                        {
                            warn!("telemetry publish failed: {err}");
                        }
                    }
                    Err(err) => warn!("telemetry serialization failed: {err}"),
                }
            }

            // The cadence itself is evidence of a live transport.
            app_state.watchdog.lock().await.mark_activity(now_ms);
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();
            let observer_count = app_state.observers.observer_count();

            let report = {
                let engine = app_state.engine.lock().await;
                engine.status_report(now_ms, observer_count, Utc::now().timestamp())
            };

            match serde_json::to_vec(&report) {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_HEATER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("state publish failed: {err}");
                    }
                }
                Err(err) => warn!("state serialization failed: {err}"),
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let now_ms = monotonic_ms();

    match topic.as_str() {
        TOPIC_CMD_SETPOINT => {
            if let Ok(setpoint) = message.parse::<f32>() {
                if setpoint.is_finite() {
                    {
                        let mut engine = app_state.engine.lock().await;
                        if engine.set_setpoint(setpoint) {
                            info!("setpoint set to {:.1}C via mqtt", engine.setpoint_c());
                        }
                    }
                    app_state.mark_activity().await;
                }
            } else {
                warn!("ignoring unparseable setpoint payload `{message}`");
            }
        }
        TOPIC_CMD_POWER => {
            let lower = message.to_ascii_lowercase();
            if lower == "start" || lower == "on" {
                app_state.engine.lock().await.start(now_ms);
                info!("heater session started via mqtt");
                app_state.mark_activity().await;
            } else if lower == "stop" || lower == "off" {
                let drive = app_state.engine.lock().await.stop();
                app_state.relay.lock().await.apply(drive);
                info!("heater stopped via mqtt");
                app_state.mark_activity().await;
            } else {
                warn!("ignoring unknown power payload `{message}`");
            }
        }
        _ => {}
    }

    Ok(())
}

async fn handle_index(State(state): State<AppState>) -> impl IntoResponse {
    state.mark_activity().await;
    Html(include_str!("../web/index.html"))
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    state.mark_activity().await;

    let report = {
        let engine = state.engine.lock().await;
        engine.status_report(
            monotonic_ms(),
            state.observers.observer_count(),
            Utc::now().timestamp(),
        )
    };

    Json(report)
}

async fn handle_slider(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.mark_activity().await;

    let Some(value) = params.get("value") else {
        warn!("slider request without 'value' parameter; ignored");
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(setpoint) = value.parse::<f32>() else {
        warn!("slider request with unparseable value `{value}`; ignored");
        return error_response(StatusCode::BAD_REQUEST, "Invalid setpoint value");
    };

    {
        let mut engine = state.engine.lock().await;
        if engine.set_setpoint(setpoint) {
            info!("setpoint set to {:.1}C", engine.setpoint_c());
        }
    }

    handle_status(State(state)).await.into_response()
}

async fn handle_toggle(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.mark_activity().await;

    let Some(action) = params.get("action") else {
        warn!("toggle request without 'action' parameter; ignored");
        return error_response(StatusCode::BAD_REQUEST, "Missing 'action' parameter");
    };

    match action.as_str() {
        "start" => {
            state.engine.lock().await.start(monotonic_ms());
            info!("heater session started");
        }
        "stop" => {
            // The stop path drives the relay directly so de-energization
            // never waits on the next control cycle.
            let drive = state.engine.lock().await.stop();
            state.relay.lock().await.apply(drive);
            info!("heater stopped");
        }
        other => {
            warn!("toggle request with unknown action `{other}`; ignored");
            return error_response(StatusCode::BAD_REQUEST, "Invalid action. Use 'start' or 'stop'");
        }
    }

    handle_status(State(state)).await.into_response()
}

async fn handle_update_status(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.update.lock().await.status_view();
    Json(view)
}

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observer_session(state, socket))
}

async fn observer_session(state: AppState, mut socket: WebSocket) {
    let mut feed = state.observers.sender.subscribe();
    state.observers.count.fetch_add(1, Ordering::Relaxed);
    info!(
        "observer connected ({} total)",
        state.observers.observer_count()
    );

    loop {
        tokio::select! {
            update = feed.recv() => match update {
                Ok(payload) => {
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // Observers only listen; drain pings and ignore payloads.
                Some(Ok(_)) => continue,
                _ => break,
            },
        }
    }

    state.observers.count.fetch_sub(1, Ordering::Relaxed);
    info!(
        "observer disconnected ({} total)",
        state.observers.observer_count()
    );
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

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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
