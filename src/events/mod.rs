//! Event stream for run execution.
//!
//! Every run produces an append-only, totally ordered log of
//! [`EventRecord`]s. Appends from concurrently running steps are serialized
//! through a single gate ([`EventLog`]) that assigns monotonic sequence
//! numbers, so the sequence ordering is authoritative even across
//! interleaved branches. The log opens with `RunStart` and closes with
//! exactly one terminal `RunSuccess` / `RunFailure` / `RunCanceled` event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Lifecycle and materialization event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEventType {
    RunStart,
    StepStart,
    LoadedInput,
    AssetMaterialization,
    ExpectationResult,
    StepOutput,
    HandledOutput,
    StepSuccess,
    StepUpForRetry,
    StepFailure,
    StepSkipped,
    StepCanceled,
    RunSuccess,
    RunFailure,
    RunCanceled,
}

impl FlowEventType {
    /// True for the event that closes a run's log.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunSuccess | Self::RunFailure | Self::RunCanceled
        )
    }

    /// True for the event that ends one step attempt.
    pub fn is_attempt_terminal(&self) -> bool {
        matches!(
            self,
            Self::StepSuccess | Self::StepFailure | Self::StepUpForRetry
        )
    }
}

/// One entry in a run's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub run_id: String,
    /// Monotonic, total-ordered within the run.
    pub sequence: u64,
    /// None for run-level events.
    pub step_key: Option<String>,
    pub event_type: FlowEventType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Observer of events as they are appended.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: &EventRecord);
}

/// Sink that forwards events to tracing.
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, record: &EventRecord) {
        tracing::debug!(
            run_id = %record.run_id,
            sequence = record.sequence,
            step = record.step_key.as_deref().unwrap_or("-"),
            "{:?}",
            record.event_type
        );
    }
}

/// Sink that buffers events for inspection, used by tests and harnesses.
pub struct BufferingEventSink {
    events: Arc<parking_lot::RwLock<Vec<EventRecord>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self {
            events: Arc::new(parking_lot::RwLock::new(Vec::new())),
        }
    }

    pub fn get_events(&self) -> Vec<EventRecord> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl Default for BufferingEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, record: &EventRecord) {
        self.events.write().push(record.clone());
    }
}

/// The per-run ordering gate. All appends go through one mutex that hands
/// out sequence numbers and pushes the record, so no two events can ever
/// carry the same sequence or land out of order.
pub struct EventLog {
    run_id: String,
    records: parking_lot::Mutex<Vec<EventRecord>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl EventLog {
    pub fn new(run_id: impl Into<String>, sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            run_id: run_id.into(),
            records: parking_lot::Mutex::new(Vec::new()),
            sink,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append one event and return its sequence number.
    pub fn append(
        &self,
        step_key: Option<&str>,
        event_type: FlowEventType,
        payload: Value,
    ) -> u64 {
        let mut records = self.records.lock();
        let sequence = records.len() as u64;
        let record = EventRecord {
            run_id: self.run_id.clone(),
            sequence,
            step_key: step_key.map(|s| s.to_string()),
            event_type,
            timestamp: Utc::now(),
            payload,
        };
        if let Some(sink) = &self.sink {
            sink.emit(&record);
        }
        records.push(record);
        sequence
    }

    /// Snapshot of the log so far, in sequence order.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    /// Consume the log, yielding the complete ordered record list.
    pub fn into_records(self) -> Vec<EventRecord> {
        self.records.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequences_are_monotonic() {
        let log = EventLog::new("run_1", None);
        let a = log.append(None, FlowEventType::RunStart, json!({}));
        let b = log.append(Some("step_a"), FlowEventType::StepStart, json!({}));
        let c = log.append(Some("step_a"), FlowEventType::StepSuccess, json!({}));
        assert_eq!((a, b, c), (0, 1, 2));

        let records = log.into_records();
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.sequence, i as u64);
            assert_eq!(record.run_id, "run_1");
        }
    }

    #[test]
    fn test_buffering_sink_sees_appends_in_order() {
        let sink = Arc::new(BufferingEventSink::new());
        let log = EventLog::new("run_2", Some(sink.clone() as Arc<dyn EventSink>));
        log.append(None, FlowEventType::RunStart, json!({}));
        log.append(None, FlowEventType::RunSuccess, json!({}));

        let seen = sink.get_events();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event_type, FlowEventType::RunStart);
        assert!(seen[1].event_type.is_run_terminal());
    }

    #[test]
    fn test_event_type_serde_tags() {
        let tag = serde_json::to_string(&FlowEventType::StepUpForRetry).unwrap();
        assert_eq!(tag, "\"STEP_UP_FOR_RETRY\"");
        let back: FlowEventType = serde_json::from_str(&tag).unwrap();
        assert_eq!(back, FlowEventType::StepUpForRetry);
    }
}
