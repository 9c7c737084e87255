use crate::config::{Config, Credentials};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// Broker parameters for one subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
    user: LoginUser,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Num(u16),
    Str(String),
}

#[derive(Debug, Deserialize)]
struct CertificationData {
    url: String,
    port: PortValue,
    #[serde(rename = "certificateAccount")]
    certificate_account: String,
    #[serde(rename = "certificatePassword")]
    certificate_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    token: String,
    user_id: String,
}

/// Resolves broker credentials: either straight from config or via the EcoFlow API.
pub async fn resolve(config: &Config) -> Result<MqttCredentials> {
    match &config.credentials {
        Credentials::Mqtt {
            broker,
            port,
            username,
            password,
            client_id,
        } => Ok(MqttCredentials {
            host: broker.clone(),
            port: *port,
            username: username.clone(),
            password: password.clone(),
            client_id: client_id
                .clone()
                .unwrap_or_else(|| format!("ecoflow-exporter-{}", Uuid::new_v4())),
        }),
        Credentials::Account { username, password } => {
            exchange(&config.api_host, username, password).await
        }
    }
}

pub async fn exchange(api_host: &str, email: &str, password: &str) -> Result<MqttCredentials> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let url = format!("https://{api_host}/auth/login");
    tracing::info!(%url, "logging in to EcoFlow API");
    let body = json!({
        "email": email,
        "password": BASE64.encode(password.as_bytes()),
        "scene": "IOT_APP",
        "userType": "ECOFLOW",
    });
    let response = client
        .post(&url)
        .header("lang", "en_US")
        .json(&body)
        .send()
        .await
        .context("EcoFlow login request failed")?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        bail!("EcoFlow login returned HTTP {status}: {text}");
    }
    let session = parse_login(&text)?;

    let url = format!("https://{api_host}/iot-auth/app/certification");
    tracing::info!(%url, "requesting IoT MQTT credentials");
    let response = client
        .get(&url)
        .header("lang", "en_US")
        .bearer_auth(&session.token)
        .query(&[("userId", session.user_id.as_str())])
        .send()
        .await
        .context("EcoFlow certification request failed")?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        bail!("EcoFlow certification returned HTTP {status}: {text}");
    }
    let credentials = parse_certification(&text, &session.user_id)?;
    tracing::info!(account = %credentials.username, host = %credentials.host, "extracted MQTT account");
    Ok(credentials)
}

fn unwrap_envelope<T: DeserializeOwned>(body: &str) -> Result<T> {
    let envelope: Envelope<T> =
        serde_json::from_str(body).with_context(|| format!("failed to parse response: {body}"))?;
    let message = envelope.message.unwrap_or_default();
    if !message.eq_ignore_ascii_case("success") {
        bail!("EcoFlow API error: {message}");
    }
    envelope
        .data
        .ok_or_else(|| anyhow!("EcoFlow API response has no data: {body}"))
}

fn parse_login(body: &str) -> Result<Session> {
    let data: LoginData = unwrap_envelope(body)?;
    tracing::info!(user = data.user.name.as_deref().unwrap_or("unknown"), "logged in to EcoFlow API");
    Ok(Session {
        token: data.token,
        user_id: data.user.user_id,
    })
}

fn parse_certification(body: &str, user_id: &str) -> Result<MqttCredentials> {
    let data: CertificationData = unwrap_envelope(body)?;
    let port = match data.port {
        PortValue::Num(port) => port,
        PortValue::Str(raw) => raw
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid MQTT port in certification response: {raw}"))?,
    };
    Ok(MqttCredentials {
        host: data.url,
        port,
        username: data.certificate_account,
        password: data.certificate_password,
        client_id: format!(
            "ANDROID_{}_{}",
            Uuid::new_v4().to_string().to_uppercase(),
            user_id
        ),
    })
}
