use super::*;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, ConnectionError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeConnector {
    attempts: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    hang_on: Vec<usize>,
    fail_on: Vec<usize>,
    captured_inbox: Option<Arc<Mutex<Option<Inbox>>>>,
}

impl Connector for FakeConnector {
    async fn connect(&self, inbox: Inbox) -> Result<Session, ConnectError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang_on.contains(&attempt) {
            let _cancelled = DropCounter(self.cancelled.clone());
            std::future::pending::<()>().await;
        }
        if self.fail_on.contains(&attempt) {
            return Err(ConnectError::Refused(RefusalCause::ServerUnavailable));
        }
        if let Some(slot) = &self.captured_inbox {
            *slot.lock().unwrap() = Some(inbox.clone());
        }
        let released = DropCounter(self.released.clone());
        let poller = tokio::spawn(async move {
            let _released = released;
            let _inbox = inbox;
            std::future::pending::<()>().await;
        });
        Ok(Session::new(poller))
    }
}

fn policy() -> ReconnectPolicy {
    ReconnectPolicy {
        watchdog_interval: Duration::from_secs(10),
        idle_timeout: Duration::from_secs(30),
        attempt_timeout: Duration::from_secs(5),
        pause: Duration::from_secs(1),
    }
}

#[tokio::test(start_paused = true)]
async fn watchdog_forces_reconnect_after_idle_timeout() {
    let connector = FakeConnector::default();
    let attempts = connector.attempts.clone();
    let released = connector.released.clone();
    let (tx, _rx) = mpsc::unbounded_channel();

    let manager = ConnectionManager::start(connector, policy(), tx).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(manager.phase(), ConnectionPhase::Connected);

    sleep(Duration::from_secs(35)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(manager.phase(), ConnectionPhase::Connected);
    // reset to the reconnect time (t=40), not left at the original connect
    assert!(manager.idle_for() <= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn deliveries_keep_the_watchdog_quiet() {
    let slot = Arc::new(Mutex::new(None));
    let connector = FakeConnector {
        captured_inbox: Some(slot.clone()),
        ..Default::default()
    };
    let attempts = connector.attempts.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _manager = ConnectionManager::start(connector, policy(), tx).await.unwrap();

    let inbox = slot.lock().unwrap().clone().unwrap();
    for _ in 0..10 {
        sleep(Duration::from_secs(10)).await;
        inbox.deliver(Bytes::from_static(b"{}"));
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 10);
}

#[tokio::test(start_paused = true)]
async fn hung_connect_is_aborted_and_retried() {
    let connector = FakeConnector {
        hang_on: vec![2],
        ..Default::default()
    };
    let attempts = connector.attempts.clone();
    let cancelled = connector.cancelled.clone();
    let (tx, _rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::start(connector, policy(), tx).await.unwrap();

    // watchdog fires at t=40, attempt 2 hangs until t=45, attempt 3 runs at t=46
    sleep(Duration::from_secs(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(manager.phase(), ConnectionPhase::Connected);
    assert!(manager.idle_for() <= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn failed_reconnects_retry_until_success() {
    let connector = FakeConnector {
        fail_on: vec![2, 3, 4],
        ..Default::default()
    };
    let attempts = connector.attempts.clone();
    let (tx, _rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::start(connector, policy(), tx).await.unwrap();

    sleep(Duration::from_secs(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    assert_eq!(manager.phase(), ConnectionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn initial_connect_failure_is_reported() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let refused = FakeConnector {
        fail_on: vec![1],
        ..Default::default()
    };
    let err = ConnectionManager::start(refused, policy(), tx.clone())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ConnectError::Refused(RefusalCause::ServerUnavailable)
    ));

    let hung = FakeConnector {
        hang_on: vec![1],
        ..Default::default()
    };
    let err = ConnectionManager::start(hung, policy(), tx).await.err().unwrap();
    assert!(matches!(err, ConnectError::TimedOut(limit) if limit == Duration::from_secs(5)));
}

#[tokio::test(start_paused = true)]
async fn recent_transport_drop_defers_forced_reconnect() {
    let connector = FakeConnector::default();
    let attempts = connector.attempts.clone();
    let (tx, _rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::start(
        connector,
        ReconnectPolicy {
            pause: Duration::from_secs(5),
            ..policy()
        },
        tx,
    )
    .await
    .unwrap();

    sleep(Duration::from_secs(38)).await;
    manager.monitor().record_disconnect();
    assert_eq!(manager.phase(), ConnectionPhase::Disconnected);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(manager.phase(), ConnectionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn explicit_reconnect_replaces_session() {
    let connector = FakeConnector::default();
    let attempts = connector.attempts.clone();
    let released = connector.released.clone();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut manager = ConnectionManager::start(connector, policy(), tx).await.unwrap();

    manager.request_reconnect();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(manager.phase(), ConnectionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_a_manual_reconnect_that_never_succeeds() {
    let connector = FakeConnector {
        fail_on: (2..1000).collect(),
        ..Default::default()
    };
    let attempts = connector.attempts.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let mut manager = ConnectionManager::start(connector, policy(), tx).await.unwrap();

    manager.request_reconnect();
    sleep(Duration::from_secs(5)).await;
    assert!(attempts.load(Ordering::SeqCst) > 2);
    assert_eq!(manager.phase(), ConnectionPhase::Connecting);

    tokio::time::timeout(Duration::from_secs(1), manager.stop())
        .await
        .expect("stop does not wait for the reconnect loop");
    assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
    let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
    assert!(matches!(closed, Ok(None)));

    let after_stop = attempts.load(Ordering::SeqCst);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), after_stop);
}

#[tokio::test(start_paused = true)]
async fn queued_watchdog_reconnect_keeps_a_fresh_session() {
    let connector = FakeConnector {
        hang_on: vec![2],
        ..Default::default()
    };
    let attempts = connector.attempts.clone();
    let released = connector.released.clone();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut manager = ConnectionManager::start(connector, policy(), tx).await.unwrap();

    // manual attempt 2 hangs from t=38 to t=43; the watchdog fires at t=40 and
    // waits for it; attempt 3 succeeds at t=44
    sleep(Duration::from_secs(38)).await;
    manager.request_reconnect();
    sleep(Duration::from_secs(12)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(manager.phase(), ConnectionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn stop_releases_session_and_closes_queue() {
    let connector = FakeConnector::default();
    let attempts = connector.attempts.clone();
    let released = connector.released.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let mut manager = ConnectionManager::start(connector, policy(), tx).await.unwrap();

    manager.stop().await;
    assert_eq!(manager.phase(), ConnectionPhase::Disconnected);

    let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
    assert!(matches!(closed, Ok(None)));
    assert_eq!(released.load(Ordering::SeqCst), 1);

    // watchdog is gone: no further attempts however long we stay idle
    sleep(Duration::from_secs(120)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn inbox_delivery_queues_payload_and_resets_idle_clock() {
    let monitor = Arc::new(LinkMonitor::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let inbox = Inbox::new(tx, monitor.clone());

    sleep(Duration::from_secs(7)).await;
    assert_eq!(monitor.idle_for(), Duration::from_secs(7));

    inbox.deliver(Bytes::from_static(b"payload"));
    assert_eq!(monitor.idle_for(), Duration::ZERO);
    assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"payload"));
}

#[test]
fn return_codes_map_to_causes() {
    assert_eq!(RefusalCause::from_return_code(ConnectReturnCode::Success), None);
    assert_eq!(
        RefusalCause::from_return_code(ConnectReturnCode::RefusedProtocolVersion),
        Some(RefusalCause::ProtocolMismatch)
    );
    assert_eq!(
        RefusalCause::from_return_code(ConnectReturnCode::BadClientId),
        Some(RefusalCause::BadClientId)
    );
    assert_eq!(
        RefusalCause::from_return_code(ConnectReturnCode::ServiceUnavailable),
        Some(RefusalCause::ServerUnavailable)
    );
    assert_eq!(
        RefusalCause::from_return_code(ConnectReturnCode::BadUserNamePassword),
        Some(RefusalCause::BadCredentials)
    );
    assert_eq!(
        RefusalCause::from_return_code(ConnectReturnCode::NotAuthorized),
        Some(RefusalCause::NotAuthorized)
    );
    assert_eq!(
        RefusalCause::from_connection_error(&ConnectionError::NetworkTimeout),
        RefusalCause::Timeout
    );
    assert_eq!(
        RefusalCause::from_connection_error(&ConnectionError::RequestsDone),
        RefusalCause::Unknown
    );
    assert!(matches!(
        ConnectError::from(ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        )),
        ConnectError::Refused(RefusalCause::BadCredentials)
    ));
    assert_eq!(RefusalCause::NotAuthorized.to_string(), "not authorised");
}

#[test]
fn topic_is_derived_from_serial() {
    assert_eq!(
        device_topic("R331ZEB4ZEA0012345"),
        "/app/device/property/R331ZEB4ZEA0012345"
    );
}
