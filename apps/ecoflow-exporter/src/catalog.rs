use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub const METRIC_PREFIX: &str = "ecoflow";
pub const AC_IN_VOLTAGE_KEY: &str = "inv.acInVol";
pub const AC_IN_CURRENT_KEY: &str = "inv.acInAmp";
pub const ONLINE_METRIC: &str = "ecoflow_online";
pub const MESSAGES_RECEIVED_METRIC: &str = "ecoflow_mqtt_messages_receive_total";

const RESERVED_METRICS: [&str; 2] = [ONLINE_METRIC, MESSAGES_RECEIVED_METRIC];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricNameError {
    #[error("payload key is empty")]
    Empty,
    #[error("cannot convert payload key {key} to a valid metric name (got {candidate})")]
    InvalidIdentifier { key: String, candidate: String },
    #[error("payload key {key} maps to {metric}, already used by payload key {owner}")]
    Collision {
        key: String,
        metric: String,
        owner: String,
    },
    #[error("payload key {key} maps to reserved metric {metric}")]
    Reserved { key: String, metric: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Discovered,
    Updated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSample {
    pub raw_key: String,
    pub device: String,
    pub metric_name: String,
    pub value: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct FieldEntry {
    metric_name: String,
    value: f64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FieldKey {
    raw_key: String,
    device: String,
}

impl FieldKey {
    fn new(raw_key: &str, device: &str) -> Self {
        Self {
            raw_key: raw_key.to_string(),
            device: device.to_string(),
        }
    }
}

/// Last-known value of every telemetry field seen per device.
///
/// Each metric name belongs to exactly one payload key for as long as any
/// device still has a live field under that key.
#[derive(Debug, Default)]
pub struct MetricCatalog {
    fields: HashMap<FieldKey, FieldEntry>,
    // metric name -> owning payload key
    owners: HashMap<String, String>,
}

impl MetricCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[cfg(test)]
    pub fn value(&self, raw_key: &str, device: &str) -> Option<f64> {
        self.fields
            .get(&FieldKey::new(raw_key, device))
            .map(|entry| entry.value)
    }

    pub fn set(
        &mut self,
        raw_key: &str,
        device: &str,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<SetOutcome, MetricNameError> {
        let key = FieldKey::new(raw_key, device);
        let outcome = match self.fields.get_mut(&key) {
            Some(entry) => {
                entry.value = value;
                entry.updated_at = at;
                tracing::trace!(metric = %entry.metric_name, device, value, "updated metric");
                SetOutcome::Updated
            }
            None => {
                let metric_name = metric_name_for(raw_key)?;
                if RESERVED_METRICS.contains(&metric_name.as_str()) {
                    return Err(MetricNameError::Reserved {
                        key: raw_key.to_string(),
                        metric: metric_name,
                    });
                }
                match self.owners.get(&metric_name) {
                    Some(owner) if owner != raw_key => {
                        return Err(MetricNameError::Collision {
                            key: raw_key.to_string(),
                            metric: metric_name,
                            owner: owner.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        self.owners.insert(metric_name.clone(), raw_key.to_string());
                    }
                }
                tracing::info!(
                    key = raw_key,
                    metric = %metric_name,
                    device,
                    "created new metric from payload key"
                );
                self.fields.insert(
                    key,
                    FieldEntry {
                        metric_name,
                        value,
                        updated_at: at,
                    },
                );
                SetOutcome::Discovered
            }
        };

        if raw_key == AC_IN_VOLTAGE_KEY && value == 0.0 {
            if let Some(current) = self
                .fields
                .get_mut(&FieldKey::new(AC_IN_CURRENT_KEY, device))
            {
                tracing::debug!(device, "zero AC input voltage; forcing AC input current to zero");
                current.value = 0.0;
                current.updated_at = at;
            }
        }

        Ok(outcome)
    }

    /// Returns every field no older than `stale_timeout` and drops the rest.
    pub fn snapshot(&mut self, now: DateTime<Utc>, stale_timeout: ChronoDuration) -> Vec<FieldSample> {
        let before = self.fields.len();
        self.fields.retain(|key, entry| {
            let fresh = now - entry.updated_at <= stale_timeout;
            if !fresh {
                tracing::debug!(
                    metric = %entry.metric_name,
                    device = %key.device,
                    last_update = %entry.updated_at,
                    "evicting stale metric"
                );
            }
            fresh
        });
        let evicted = before - self.fields.len();
        if evicted > 0 {
            let live: HashSet<&str> = self.fields.keys().map(|key| key.raw_key.as_str()).collect();
            self.owners.retain(|_, owner| live.contains(owner.as_str()));
            tracing::info!(evicted, remaining = self.fields.len(), "evicted stale metrics");
        }

        let mut samples: Vec<FieldSample> = self
            .fields
            .iter()
            .map(|(key, entry)| FieldSample {
                raw_key: key.raw_key.clone(),
                device: key.device.clone(),
                metric_name: entry.metric_name.clone(),
                value: entry.value,
                updated_at: entry.updated_at,
            })
            .collect();
        samples.sort_by(|a, b| {
            a.metric_name
                .cmp(&b.metric_name)
                .then_with(|| a.device.cmp(&b.device))
        });
        samples
    }
}

pub fn metric_name_for(raw_key: &str) -> Result<String, MetricNameError> {
    let normalized = normalize_key(raw_key)?;
    Ok(format!("{METRIC_PREFIX}_{normalized}"))
}

// bms_bmsStatus.maxCellTemp -> bms_bms_status_max_cell_temp
// pd.ext4p8Port -> pd_ext4p8_port
pub fn normalize_key(raw_key: &str) -> Result<String, MetricNameError> {
    let key = raw_key.replace('.', "_");
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return Err(MetricNameError::Empty);
    };

    let mut normalized = String::with_capacity(key.len() + 8);
    normalized.extend(first.to_lowercase());
    for ch in chars {
        if ch.is_uppercase() && !normalized.ends_with('_') {
            normalized.push('_');
        }
        normalized.extend(ch.to_lowercase());
    }

    if !is_valid_metric_name(&normalized) {
        return Err(MetricNameError::InvalidIdentifier {
            key: raw_key.to_string(),
            candidate: normalized,
        });
    }
    Ok(normalized)
}

pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ':')
}
