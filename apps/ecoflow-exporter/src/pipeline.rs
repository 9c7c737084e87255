use crate::state::{ExporterState, SharedState};
use crate::telemetry::{parse_params, ParamValue};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub updated: usize,
    pub skipped: usize,
    pub dropped: bool,
}

/// Applies decoded device payloads to the catalog and liveness tracker.
#[derive(Debug, Clone)]
pub struct PayloadProcessor {
    device: String,
}

impl PayloadProcessor {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn process(
        &self,
        state: &mut ExporterState,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();
        state.liveness.touch(&self.device, now);

        let mut buf = payload.to_vec();
        let params = match parse_params(&mut buf) {
            Ok(params) => params,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    payload = %String::from_utf8_lossy(payload),
                    "failed to parse MQTT payload; dropping message"
                );
                outcome.dropped = true;
                return outcome;
            }
        };
        tracing::debug!(device = %self.device, params = params.len(), "processing payload");

        for param in params {
            let value = match param.value {
                ParamValue::Scalar(value) => value,
                ParamValue::Unsupported(kind) => {
                    tracing::warn!(key = %param.key, kind, "skipping unsupported metric value");
                    outcome.skipped += 1;
                    continue;
                }
            };
            match state.catalog.set(&param.key, &self.device, value, now) {
                Ok(_) => outcome.updated += 1,
                Err(err) => {
                    tracing::error!(error = %err, key = %param.key, "skipping metric");
                    outcome.skipped += 1;
                }
            }
        }
        outcome
    }
}

/// Drains the inbound queue every `interval` and applies what it finds.
pub fn spawn_worker(
    processor: PayloadProcessor,
    state: SharedState,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let (batch, closed) = drain(&mut rx);

            if batch.is_empty() {
                tracing::debug!(device = %processor.device(), "message queue is empty");
            } else {
                tracing::info!(events = batch.len(), "processing event(s) from the message queue");
                let now = Utc::now();
                let mut guard = state.lock().await;
                let mut updated = 0usize;
                let mut skipped = 0usize;
                for payload in &batch {
                    let outcome = processor.process(&mut guard, payload, now);
                    updated += outcome.updated;
                    skipped += outcome.skipped;
                }
                let tracked = guard.catalog.len();
                drop(guard);
                tracing::debug!(updated, skipped, tracked, "applied message batch");
            }

            if closed {
                tracing::info!("message queue closed; worker exiting");
                break;
            }
        }
    })
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> (Vec<Bytes>, bool) {
    let mut batch = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(payload) => batch.push(payload),
            Err(TryRecvError::Empty) => return (batch, false),
            Err(TryRecvError::Disconnected) => return (batch, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AC_IN_CURRENT_KEY, AC_IN_VOLTAGE_KEY};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    #[test]
    fn process_updates_catalog_and_liveness() {
        let processor = PayloadProcessor::new("river");
        let mut state = ExporterState::default();
        let outcome = processor.process(
            &mut state,
            br#"{"params": {"pd.soc": 80, "mppt.carOutVol": 12100}}"#,
            at(0),
        );
        assert_eq!(outcome.updated, 2);
        assert_eq!(outcome.skipped, 0);
        assert!(!outcome.dropped);
        assert_eq!(state.catalog.value("mppt.carOutVol", "river"), Some(12100.0));
        assert_eq!(state.liveness.message_count("river"), 1);
    }

    #[test]
    fn array_values_never_reach_the_catalog() {
        let processor = PayloadProcessor::new("river");
        let mut state = ExporterState::default();
        let outcome = processor.process(&mut state, br#"{"params": {"x.y": [1,2,3]}}"#, at(0));
        assert_eq!(outcome.skipped, 1);

        let snapshot = state.catalog.snapshot(at(1), ChronoDuration::seconds(60));
        assert!(snapshot.iter().all(|s| s.metric_name != "ecoflow_x_y"));
    }

    #[test]
    fn bad_field_does_not_block_the_rest() {
        let processor = PayloadProcessor::new("river");
        let mut state = ExporterState::default();
        let outcome = processor.process(
            &mut state,
            br#"{"params": {"1bad.key": 3, "pd.soc": 80, "pd.watts out": 1}}"#,
            at(0),
        );
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(state.catalog.value("pd.soc", "river"), Some(80.0));
    }

    #[test]
    fn malformed_payload_is_dropped_but_counted() {
        let processor = PayloadProcessor::new("river");
        let mut state = ExporterState::default();
        let outcome = processor.process(&mut state, b"{\"params\":", at(0));
        assert!(outcome.dropped);
        assert!(state.catalog.is_empty());
        assert_eq!(state.liveness.message_count("river"), 1);
    }

    #[test]
    fn correction_applies_within_one_payload() {
        let processor = PayloadProcessor::new("river");
        let mut state = ExporterState::default();
        processor.process(
            &mut state,
            br#"{"params": {"inv.acInVol": 0, "inv.acInAmp": 12}}"#,
            at(0),
        );
        assert_eq!(state.catalog.value(AC_IN_CURRENT_KEY, "river"), Some(0.0));
        assert_eq!(state.catalog.value(AC_IN_VOLTAGE_KEY, "river"), Some(0.0));
    }

    #[test]
    fn counter_tracks_each_payload() {
        let processor = PayloadProcessor::new("river");
        let mut state = ExporterState::default();
        for step in 0..3 {
            processor.process(&mut state, br#"{"params": {"pd.soc": 1}}"#, at(step));
        }
        assert_eq!(state.liveness.message_count("river"), 3);
        assert!(state.liveness.is_online("river", at(3), ChronoDuration::seconds(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_drains_queue_and_exits_when_closed() {
        let state = crate::state::shared();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(
            PayloadProcessor::new("river"),
            state.clone(),
            rx,
            Duration::from_secs(10),
        );

        tx.send(Bytes::from_static(br#"{"params": {"pd.soc": 42}}"#))
            .unwrap();
        tx.send(Bytes::from_static(br#"{"params": {"pd.soc": 43}}"#))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        {
            let guard = state.lock().await;
            assert_eq!(guard.catalog.value("pd.soc", "river"), Some(43.0));
            assert_eq!(guard.liveness.message_count("river"), 2);
        }

        drop(tx);
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("worker exits")
            .unwrap();
    }
}
