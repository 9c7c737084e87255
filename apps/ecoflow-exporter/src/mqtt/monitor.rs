use bytes::Bytes;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }
}

/// Lock-free view of one subscription: phase, last message, last transport drop.
#[derive(Debug)]
pub struct LinkMonitor {
    origin: Instant,
    last_message_ms: AtomicU64,
    // 0 means "never"; otherwise elapsed millis + 1
    last_disconnect_ms: AtomicU64,
    phase: AtomicU8,
}

impl LinkMonitor {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_message_ms: AtomicU64::new(0),
            last_disconnect_ms: AtomicU64::new(0),
            phase: AtomicU8::new(ConnectionPhase::Disconnected.as_u8()),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn touch(&self) {
        self.last_message_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_message_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    pub fn record_disconnect(&self) {
        self.last_disconnect_ms
            .store(self.elapsed_ms() + 1, Ordering::Relaxed);
        self.set_phase(ConnectionPhase::Disconnected);
    }

    pub fn since_disconnect(&self) -> Option<Duration> {
        match self.last_disconnect_ms.load(Ordering::Relaxed) {
            0 => None,
            stamp => Some(Duration::from_millis(
                self.elapsed_ms().saturating_sub(stamp - 1),
            )),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn set_phase(&self, phase: ConnectionPhase) {
        let previous = self.phase.swap(phase.as_u8(), Ordering::Relaxed);
        if previous != phase.as_u8() {
            tracing::debug!(from = ?ConnectionPhase::from_u8(previous), to = ?phase, "MQTT connection phase changed");
        }
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery end of the inbound queue, handed to every session poller.
#[derive(Debug, Clone)]
pub struct Inbox {
    tx: mpsc::UnboundedSender<Bytes>,
    monitor: Arc<LinkMonitor>,
}

impl Inbox {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>, monitor: Arc<LinkMonitor>) -> Self {
        Self { tx, monitor }
    }

    pub fn monitor(&self) -> &Arc<LinkMonitor> {
        &self.monitor
    }

    pub fn deliver(&self, payload: Bytes) {
        self.monitor.touch();
        if self.tx.send(payload).is_err() {
            tracing::trace!("message queue closed; dropping payload");
        }
    }
}
