mod auth;
mod catalog;
mod config;
mod http;
mod liveness;
mod metrics;
mod mqtt;
mod pipeline;
mod state;
mod telemetry;

use crate::config::Config;
use crate::metrics::ExporterCollector;
use crate::mqtt::{ConnectionManager, MqttConnector, MqttSettings};
use crate::pipeline::{spawn_worker, PayloadProcessor};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_filter().into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "ecoflow-exporter"),
                KeyValue::new("device.sn", config.device_sn.clone()),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// SIGHUP listener used to request a manual MQTT reconnect.
struct ReconnectRequests {
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl ReconnectRequests {
    fn install() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let hangup = match signal(SignalKind::hangup()) {
                Ok(hangup) => Some(hangup),
                Err(err) => {
                    tracing::warn!(error=%err, "failed to install SIGHUP handler");
                    None
                }
            };
            Self { hangup }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(hangup) = self.hangup.as_mut() {
            if hangup.recv().await.is_some() {
                return;
            }
            self.hangup = None;
        }
        std::future::pending::<()>().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let credentials = auth::resolve(&config)
        .await
        .context("failed to obtain MQTT credentials")?;

    let shared = state::shared();
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let worker = spawn_worker(
        PayloadProcessor::new(config.device_name.clone()),
        shared.clone(),
        rx,
        config.collecting_interval(),
    );

    let connector = MqttConnector::new(MqttSettings {
        host: credentials.host,
        port: credentials.port,
        username: credentials.username,
        password: credentials.password,
        client_id: credentials.client_id,
        topic: mqtt::device_topic(&config.device_sn),
        keep_alive: config.mqtt_keepalive(),
        tls: config.mqtt_tls,
        retry_pause: config.reconnect_policy().pause,
    });
    let mut manager = ConnectionManager::start(connector, config.reconnect_policy(), tx)
        .await
        .context("initial MQTT connection failed")?;

    let app = http::router(http::HttpState {
        state: shared,
        collector: ExporterCollector::new(
            config.device_name.clone(),
            config.device_offline_timeout(),
            config.metric_stale_timeout(),
        ),
    });
    let bind = format!("0.0.0.0:{}", config.exporter_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, device = %config.device_name, "ecoflow-exporter HTTP listening");
    let mut http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut reconnect_requests = ReconnectRequests::install();
    let mut server_exit = None;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            exit = &mut http_handle => {
                tracing::error!("HTTP server exited");
                server_exit = Some(exit);
                break;
            }
            _ = reconnect_requests.recv() => {
                tracing::info!("SIGHUP received; replacing MQTT session");
                manager.request_reconnect();
            }
        }
    }

    tracing::info!(
        phase = ?manager.phase(),
        idle_secs = manager.idle_for().as_secs(),
        "stopping MQTT connection manager"
    );
    manager.stop().await;
    let drain_grace = config.collecting_interval() + Duration::from_secs(1);
    if tokio::time::timeout(drain_grace, worker).await.is_err() {
        tracing::warn!("message worker did not exit in time");
    }

    match server_exit {
        Some(exit) => http_exit_status(exit),
        None => Ok(()),
    }
}

/// The listener only returns on failure, so any exit is an error.
fn http_exit_status(exit: Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    exit.context("HTTP server task failed")?
        .context("HTTP server exited")?;
    anyhow::bail!("HTTP server stopped unexpectedly")
}
