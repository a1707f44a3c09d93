use std::{io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use thing_common::RuntimeConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};

use thing_simulator::{
    blob::FsBlobStore, camera::SyntheticCamera, http, mqtt::MqttTransport, Simulator,
};

const DEFAULT_HTTP_PORT: u16 = 8081;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::from_env();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!(
            "failed to load runtime config from {}: {err:#}",
            store.path.display()
        );
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.sanitize();

    let transport = Arc::new(MqttTransport::new(runtime.network.clone()));
    info!("simulating device {}", transport.device_id());
    let camera = Arc::new(SyntheticCamera::new(
        runtime.capture.frame_width,
        runtime.capture.frame_height,
    ));
    let blobs = Arc::new(FsBlobStore::new(&runtime.capture.blob_dir));
    let simulator = Arc::new(Simulator::new(&runtime, transport, camera, blobs));
    log_events(&simulator);

    simulator
        .initialize()
        .await
        .context("failed to initialize simulator session")?;
    simulator.start().context("failed to start simulator")?;
    if runtime.simulator.capture_on_start {
        simulator
            .start_capture(runtime.simulator.capture_interval_ms)
            .context("failed to start capture loop")?;
    }

    let port = std::env::var("SIM_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind simulator control api at {addr}"))?;

    info!("simulator control api listening on http://{addr}");
    let served = axum::serve(listener, http::router(simulator.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    simulator.end_capture().await;
    simulator.stop().await;
    simulator.halt().await;
    simulator
        .terminate()
        .await
        .context("failed to close simulator session")?;
    served.context("simulator control api failed")?;
    info!("simulator shut down");
    Ok(())
}

fn log_events(simulator: &Simulator) {
    simulator.on_command_invoked(|event| {
        info!(
            "command {} ({}) payload: {}",
            event.request.name,
            event.request.request_id,
            String::from_utf8_lossy(&event.request.payload)
        );
    });
    simulator.on_desired_config_updated(|event| {
        info!(
            "desired configuration: {}",
            serde_json::Value::Object(event.desired.clone())
        );
    });
    simulator.on_message_received(|event| {
        info!(
            "message {} on {}: {}",
            event.message.id,
            event.message.topic,
            String::from_utf8_lossy(&event.message.body)
        );
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Overlays deployment settings from the environment onto the stored config.
fn apply_env_overrides(runtime: &mut RuntimeConfig, var: impl Fn(&str) -> Option<String>) {
    let network = &mut runtime.network;
    if let Some(host) = var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = var("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        network.mqtt_port = port;
    }
    if let Some(user) = var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    if let Some(connection_string) = var("THING_CONNECTION_STRING") {
        network.connection_string = connection_string;
    }
}

struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    fn from_env() -> Self {
        let path = std::env::var("THING_SIM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.thing-sim/runtime.json"));
        Self { path }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}
