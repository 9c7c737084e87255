use crate::catalog::{FieldSample, MESSAGES_RECEIVED_METRIC, ONLINE_METRIC};
use crate::state::ExporterState;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use prometheus::proto::{Counter, Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use std::collections::BTreeSet;

const DEVICE_LABEL: &str = "device";

/// Renders the exporter state in the Prometheus text format on each pull.
#[derive(Debug, Clone)]
pub struct ExporterCollector {
    device: String,
    offline_timeout: ChronoDuration,
    stale_timeout: ChronoDuration,
}

impl ExporterCollector {
    pub fn new(
        device: impl Into<String>,
        offline_timeout: ChronoDuration,
        stale_timeout: ChronoDuration,
    ) -> Self {
        Self {
            device: device.into(),
            offline_timeout,
            stale_timeout,
        }
    }

    /// Evicts stale fields, then builds one family per metric name.
    pub fn collect(&self, state: &mut ExporterState, now: DateTime<Utc>) -> Vec<MetricFamily> {
        let samples = state.catalog.snapshot(now, self.stale_timeout);
        let mut families = field_families(&samples);

        let mut devices: BTreeSet<&str> = state.liveness.devices().collect();
        devices.insert(self.device.as_str());

        let mut online = family(
            ONLINE_METRIC,
            "1 if device is online",
            MetricType::GAUGE,
        );
        let mut received = family(
            MESSAGES_RECEIVED_METRIC,
            "total MQTT messages",
            MetricType::COUNTER,
        );
        for device in devices {
            let is_online = state.liveness.is_online(device, now, self.offline_timeout);
            let mut metric = labelled(device);
            let mut gauge = Gauge::default();
            gauge.set_value(if is_online { 1.0 } else { 0.0 });
            metric.set_gauge(gauge);
            online.mut_metric().push(metric);

            let mut metric = labelled(device);
            let mut counter = Counter::default();
            counter.set_value(state.liveness.message_count(device) as f64);
            metric.set_counter(counter);
            received.mut_metric().push(metric);
        }
        families.push(online);
        families.push(received);
        families
    }

    pub fn render(&self, state: &mut ExporterState, now: DateTime<Utc>) -> Result<String> {
        let families = self.collect(state, now);
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

fn field_families(samples: &[FieldSample]) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();
    for sample in samples {
        let start_new = families
            .last()
            .map(|current| current.get_name() != sample.metric_name)
            .unwrap_or(true);
        if start_new {
            families.push(family(
                &sample.metric_name,
                &format!("value from MQTT object key {}", sample.raw_key),
                MetricType::GAUGE,
            ));
        }

        let mut metric = labelled(&sample.device);
        let mut gauge = Gauge::default();
        gauge.set_value(sample.value);
        metric.set_gauge(gauge);
        metric.set_timestamp_ms(sample.updated_at.timestamp_millis());
        if let Some(current) = families.last_mut() {
            current.mut_metric().push(metric);
        }
    }
    families
}

fn family(name: &str, help: &str, kind: MetricType) -> MetricFamily {
    let mut family = MetricFamily::default();
    family.set_name(name.to_string());
    family.set_help(help.to_string());
    family.set_field_type(kind);
    family
}

fn labelled(device: &str) -> Metric {
    let mut label = LabelPair::default();
    label.set_name(DEVICE_LABEL.to_string());
    label.set_value(device.to_string());
    let mut metric = Metric::default();
    metric.mut_label().push(label);
    metric
}
