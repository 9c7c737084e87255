use crate::mqtt::ReconnectPolicy;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Duration as ChronoDuration;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

const DEFAULT_API_HOST: &str = "api.ecoflow.com";
const DEFAULT_MQTT_BROKER: &str = "mqtt.ecoflow.com";
const DEFAULT_MQTT_PORT: u16 = 8883;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// EcoFlow account; broker credentials come from the certification API.
    Account { username: String, password: String },
    /// Broker credentials supplied directly.
    Mqtt {
        broker: String,
        port: u16,
        username: String,
        password: String,
        client_id: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub device_sn: String,
    pub device_name: String,
    pub credentials: Credentials,
    pub api_host: String,
    pub mqtt_tls: bool,
    pub mqtt_keepalive_secs: u64,
    pub exporter_port: u16,
    pub collecting_interval_secs: u64,
    pub device_offline_timeout_secs: u64,
    pub metric_stale_timeout_secs: u64,
    pub mqtt_idle_timeout_secs: u64,
    pub mqtt_watchdog_interval_secs: u64,
    pub mqtt_reconnect_timeout_secs: u64,
    pub mqtt_reconnect_pause_secs: u64,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let get_u64 = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(raw) => raw.parse::<u64>().with_context(|| format!("invalid {key}: {raw}")),
                None => Ok(default),
            }
        };
        let get_secs = |key: &str, default: u64| -> Result<u64> {
            let value = get_u64(key, default)?;
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
            Ok(value)
        };

        let device_sn = get("DEVICE_SN").ok_or_else(|| anyhow!("DEVICE_SN is required"))?;
        let device_name = get("DEVICE_NAME").unwrap_or_else(|| device_sn.clone());

        let credentials = match (
            get("ECOFLOW_USERNAME"),
            get("ECOFLOW_PASSWORD"),
            get("MQTT_USERNAME"),
            get("MQTT_PASSWORD"),
        ) {
            (Some(username), Some(password), _, _) => Credentials::Account { username, password },
            (_, _, Some(username), Some(password)) => {
                let port = match get("MQTT_PORT") {
                    Some(raw) => raw
                        .parse::<u16>()
                        .with_context(|| format!("invalid MQTT_PORT: {raw}"))?,
                    None => DEFAULT_MQTT_PORT,
                };
                Credentials::Mqtt {
                    broker: get("MQTT_BROKER").unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
                    port,
                    username,
                    password,
                    client_id: get("MQTT_CLIENT_ID"),
                }
            }
            _ => bail!(
                "provide ECOFLOW_USERNAME and ECOFLOW_PASSWORD (or MQTT_USERNAME and MQTT_PASSWORD)"
            ),
        };

        let exporter_port = match get("EXPORTER_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid EXPORTER_PORT: {raw}"))?,
            None => 9090,
        };
        let mqtt_tls = get("MQTT_TLS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Ok(Self {
            device_sn,
            device_name,
            credentials,
            api_host: get("ECOFLOW_API_HOST").unwrap_or_else(|| DEFAULT_API_HOST.to_string()),
            mqtt_tls,
            mqtt_keepalive_secs: get_secs("MQTT_KEEPALIVE", 60)?,
            exporter_port,
            collecting_interval_secs: get_secs("COLLECTING_INTERVAL", 10)?,
            device_offline_timeout_secs: get_secs("DEVICE_OFFLINE_TIMEOUT", 60)?,
            metric_stale_timeout_secs: get_secs("METRIC_STALE_TIMEOUT", 60)?,
            mqtt_idle_timeout_secs: get_secs("MQTT_IDLE_TIMEOUT", 120)?,
            mqtt_watchdog_interval_secs: get_secs("MQTT_WATCHDOG_INTERVAL", 10)?,
            mqtt_reconnect_timeout_secs: get_secs("MQTT_RECONNECT_TIMEOUT", 30)?,
            mqtt_reconnect_pause_secs: get_secs("MQTT_RECONNECT_PAUSE", 5)?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "INFO".to_string()),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn collecting_interval(&self) -> Duration {
        Duration::from_secs(self.collecting_interval_secs)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn device_offline_timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.device_offline_timeout_secs as i64)
    }

    pub fn metric_stale_timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.metric_stale_timeout_secs as i64)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            watchdog_interval: Duration::from_secs(self.mqtt_watchdog_interval_secs),
            idle_timeout: Duration::from_secs(self.mqtt_idle_timeout_secs),
            attempt_timeout: Duration::from_secs(self.mqtt_reconnect_timeout_secs),
            pause: Duration::from_secs(self.mqtt_reconnect_pause_secs),
        }
    }

    /// `tracing` filter directive for `LOG_LEVEL`; unknown levels fall back to info.
    pub fn log_filter(&self) -> String {
        let level = match self.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" => "error",
            "TRACE" => "trace",
            _ => "info",
        };
        format!("{level},ecoflow_exporter={level}")
    }
}
