use super::monitor::{ConnectionPhase, Inbox};
use super::{ConnectError, RefusalCause};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, Transport};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Opens one subscription session whose deliveries go to `inbox`.
///
/// Implementations return only once the session is established and
/// subscribed; the returned [`Session`] owns whatever task keeps it alive.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, inbox: Inbox) -> impl Future<Output = Result<Session, ConnectError>> + Send;
}

/// Live subscription. Dropping it aborts the poller, which closes the socket.
#[derive(Debug)]
pub struct Session {
    poller: JoinHandle<()>,
}

impl Session {
    pub fn new(poller: JoinHandle<()>) -> Self {
        Self { poller }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
    pub tls: bool,
    pub retry_pause: Duration,
}

impl MqttSettings {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_credentials(self.username.clone(), self.password.clone());
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

#[derive(Debug, Clone)]
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

impl Connector for MqttConnector {
    async fn connect(&self, inbox: Inbox) -> Result<Session, ConnectError> {
        let settings = &self.settings;
        tracing::info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            "connecting to MQTT broker"
        );
        let (client, mut eventloop) = AsyncClient::new(settings.options(), 64);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if let Some(cause) = RefusalCause::from_return_code(ack.code) {
                        tracing::error!(cause = %cause, "failed to connect to MQTT");
                        return Err(ConnectError::Refused(cause));
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    let err = ConnectError::from(err);
                    tracing::error!(error = %err, "failed to connect to MQTT");
                    return Err(err);
                }
            }
        }

        client
            .try_subscribe(settings.topic.clone(), QoS::AtLeastOnce)
            .map_err(|source| ConnectError::Subscribe {
                topic: settings.topic.clone(),
                source,
            })?;
        tracing::info!(topic = %settings.topic, "subscribed to MQTT topic");
        inbox.monitor().set_phase(ConnectionPhase::Connected);

        let poller = tokio::spawn(run_poller(
            client,
            eventloop,
            inbox,
            settings.topic.clone(),
            settings.retry_pause,
        ));
        Ok(Session::new(poller))
    }
}

async fn run_poller(
    client: AsyncClient,
    mut eventloop: EventLoop,
    inbox: Inbox,
    topic: String,
    retry_pause: Duration,
) {
    let monitor = inbox.monitor().clone();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                inbox.deliver(publish.payload);
            }
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if let Some(cause) = RefusalCause::from_return_code(ack.code) {
                    tracing::error!(cause = %cause, "MQTT reconnect refused");
                    continue;
                }
                monitor.set_phase(ConnectionPhase::Connected);
                match client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                    Ok(()) => tracing::info!(topic = %topic, "MQTT reconnected; resubscribed"),
                    Err(err) => {
                        tracing::warn!(error = %err, topic = %topic, "failed to resubscribe after reconnect")
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                tracing::warn!("broker sent DISCONNECT");
            }
            Ok(_) => {}
            Err(err) => {
                let cause = RefusalCause::from_connection_error(&err);
                monitor.record_disconnect();
                tracing::error!(
                    error = %err,
                    cause = %cause,
                    "unexpected MQTT disconnection; will auto-reconnect"
                );
                sleep(retry_pause).await;
                monitor.set_phase(ConnectionPhase::Connecting);
            }
        }
    }
}
