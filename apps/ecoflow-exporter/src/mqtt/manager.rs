use super::connector::{Connector, Session};
use super::monitor::{ConnectionPhase, Inbox, LinkMonitor};
use super::ConnectError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub watchdog_interval: Duration,
    pub idle_timeout: Duration,
    pub attempt_timeout: Duration,
    pub pause: Duration,
}

/// Owns the subscription session and keeps it receiving.
///
/// A watchdog task forces a reconnect whenever no message has been delivered
/// within `idle_timeout`. Each connect attempt runs in its own task under a
/// hard deadline, so a wedged connect never stalls the watchdog.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
    watchdog: Option<JoinHandle<()>>,
    manual: Option<JoinHandle<()>>,
}

struct Inner<C> {
    connector: Arc<C>,
    policy: ReconnectPolicy,
    monitor: Arc<LinkMonitor>,
    inbox: Mutex<Option<Inbox>>,
    session: Mutex<Option<Session>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Idle,
    Manual,
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Connects once and starts the watchdog. Only this first connect can fail.
    pub async fn start(
        connector: C,
        policy: ReconnectPolicy,
        queue: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Self, ConnectError> {
        let monitor = Arc::new(LinkMonitor::new());
        let inbox = Inbox::new(queue, monitor.clone());
        let inner = Arc::new(Inner {
            connector: Arc::new(connector),
            policy,
            monitor,
            inbox: Mutex::new(Some(inbox.clone())),
            session: Mutex::new(None),
        });

        {
            let mut slot = inner.session.lock().await;
            inner.monitor.set_phase(ConnectionPhase::Connecting);
            match isolated_connect(&inner.connector, inbox, policy.attempt_timeout).await {
                Ok(session) => {
                    *slot = Some(session);
                    inner.monitor.touch();
                    inner.monitor.set_phase(ConnectionPhase::Connected);
                }
                Err(err) => {
                    inner.monitor.set_phase(ConnectionPhase::Disconnected);
                    return Err(err);
                }
            }
        }

        let watchdog = tokio::spawn(run_watchdog(inner.clone()));
        Ok(Self {
            inner,
            watchdog: Some(watchdog),
            manual: None,
        })
    }

    #[cfg(test)]
    pub fn monitor(&self) -> Arc<LinkMonitor> {
        self.inner.monitor.clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.monitor.phase()
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.monitor.idle_for()
    }

    /// Replaces the current session with a fresh one in the background,
    /// retrying until it succeeds or the manager stops.
    pub fn request_reconnect(&mut self) {
        if self.manual.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::info!("manual MQTT reconnect already in progress");
            return;
        }
        let inner = self.inner.clone();
        self.manual = Some(tokio::spawn(async move {
            inner.reconnect(Trigger::Manual).await;
        }));
    }

    /// Stops the watchdog, cancels any in-flight attempt and releases the session.
    pub async fn stop(&mut self) {
        for task in [self.watchdog.take(), self.manual.take()].into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }
        let session = self.inner.session.lock().await.take();
        drop(session);
        self.inner.inbox.lock().await.take();
        self.inner.monitor.set_phase(ConnectionPhase::Disconnected);
        tracing::info!("MQTT connection manager stopped");
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        for task in [self.watchdog.take(), self.manual.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

impl<C: Connector> Inner<C> {
    async fn reconnect(&self, trigger: Trigger) {
        let mut slot = self.session.lock().await;
        if trigger == Trigger::Idle && self.monitor.idle_for() <= self.policy.idle_timeout {
            tracing::debug!("session came back while waiting; skipping forced reconnect");
            return;
        }
        let Some(inbox) = self.inbox.lock().await.clone() else {
            tracing::debug!("connection manager stopped; skipping reconnect");
            return;
        };

        self.monitor.set_phase(ConnectionPhase::Connecting);
        if let Some(old) = slot.take() {
            tracing::info!("releasing previous MQTT session");
            drop(old);
        }

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match isolated_connect(&self.connector, inbox.clone(), self.policy.attempt_timeout).await
            {
                Ok(session) => {
                    *slot = Some(session);
                    self.monitor.touch();
                    self.monitor.set_phase(ConnectionPhase::Connected);
                    tracing::info!(attempt, ?trigger, "MQTT reconnect succeeded");
                    return;
                }
                Err(err) => {
                    tracing::error!(attempt, error = %err, "MQTT reconnect attempt failed; retrying");
                    sleep(self.policy.pause).await;
                }
            }
        }
    }
}

async fn isolated_connect<C: Connector>(
    connector: &Arc<C>,
    inbox: Inbox,
    limit: Duration,
) -> Result<Session, ConnectError> {
    let connector = connector.clone();
    let mut attempt = AbortOnDrop(tokio::spawn(async move { connector.connect(inbox).await }));

    match tokio::time::timeout(limit, &mut attempt.0).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(ConnectError::Aborted(join_err.to_string())),
        Err(_) => {
            tracing::warn!(timeout = ?limit, "MQTT connect attempt hung; aborting it");
            Err(ConnectError::TimedOut(limit))
        }
    }
}

async fn run_watchdog<C: Connector>(inner: Arc<Inner<C>>) {
    let policy = inner.policy;
    let mut ticker = tokio::time::interval(policy.watchdog_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let idle = inner.monitor.idle_for();
        if idle <= policy.idle_timeout {
            continue;
        }
        if let Some(since) = inner.monitor.since_disconnect() {
            if since < policy.pause {
                tracing::debug!(since = ?since, "transport just dropped; deferring forced reconnect");
                continue;
            }
        }

        tracing::warn!(
            idle_secs = idle.as_secs(),
            timeout_secs = policy.idle_timeout.as_secs(),
            phase = ?inner.monitor.phase(),
            "no MQTT messages within idle timeout; forcing reconnect"
        );
        inner.reconnect(Trigger::Idle).await;
    }
}
