use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLiveness {
    pub last_seen: DateTime<Utc>,
    pub messages: u64,
}

/// Per-device last-seen time and received message counter.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    devices: HashMap<String, DeviceLiveness>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&mut self, device: &str, now: DateTime<Utc>) {
        match self.devices.get_mut(device) {
            Some(record) => {
                record.last_seen = now;
                record.messages = record.messages.saturating_add(1);
            }
            None => {
                tracing::info!(device, "first message received from device");
                self.devices.insert(
                    device.to_string(),
                    DeviceLiveness {
                        last_seen: now,
                        messages: 1,
                    },
                );
            }
        }
    }

    pub fn is_online(&self, device: &str, now: DateTime<Utc>, timeout: ChronoDuration) -> bool {
        self.devices
            .get(device)
            .map(|record| now - record.last_seen < timeout)
            .unwrap_or(false)
    }

    pub fn message_count(&self, device: &str) -> u64 {
        self.devices
            .get(device)
            .map(|record| record.messages)
            .unwrap_or(0)
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }
}
