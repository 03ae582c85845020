//! Run lifecycle adapter: bridges domain `Event`s to `RunLedger` persistence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quayside_state::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunStatus, RunSummary, StorageResult,
};
use serde_json::Value;

use crate::domain::run::{Event, EventKind};

/// Merge the kind's own fields (everything but the `type` tag) into the
/// payload, so ledger readers see e.g. `stage` without decoding the kind.
fn merged_payload(kind: &EventKind, payload: Value) -> Value {
    let mut fields = match serde_json::to_value(kind) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    fields.remove("type");

    match payload {
        Value::Object(extra) => {
            fields.extend(extra);
            Value::Object(fields)
        }
        Value::Null => Value::Object(fields),
        other => {
            fields.insert("data".to_string(), other);
            Value::Object(fields)
        }
    }
}

/// Adapter that records pipeline [`Event`]s into a [`RunLedger`].
///
/// Usage:
/// 1. Call [`RunRecorder::start`] to create a new run.
/// 2. Call [`RunRecorder::record`] for each event; sequence numbers are
///    assigned here.
/// 3. Call one of the `finish_*` methods to finalize.
pub struct RunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    next_seq: AtomicU64,
}

impl RunRecorder {
    /// Start a new run in the ledger, returning a recorder bound to that run.
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<Self> {
        let run_id = ledger.create_run(spec_digest, metadata.clone()).await?;
        crate::obs::emit_run_started(run_id.as_str(), &metadata.pipeline, &metadata.trigger);
        Ok(Self {
            ledger,
            run_id,
            next_seq: AtomicU64::new(1),
        })
    }

    /// Record an event, returning the sequence number it was given.
    pub async fn record(&self, kind: EventKind, payload: Value) -> StorageResult<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let event = Event::new(seq, kind, payload);
        self.append(&event).await?;
        Ok(seq)
    }

    /// Append an already-built domain event.
    pub async fn append(&self, event: &Event) -> StorageResult<()> {
        let kind_str = event.kind.as_kind_str();
        let run_event = RunEvent {
            seq: event.seq,
            kind: kind_str.clone(),
            payload: merged_payload(&event.kind, event.payload.clone()),
            timestamp: event.timestamp,
        };
        crate::obs::emit_event_appended(self.run_id.as_str(), &kind_str, event.seq);
        self.ledger.append_event(&self.run_id, run_event).await
    }

    /// Number of events recorded so far.
    pub fn events_recorded(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Finalize the run as completed.
    pub async fn finish_ok(self, summary: RunSummary) -> StorageResult<()> {
        self.emit_finished(&summary, RunStatus::Completed);
        self.ledger.complete_run(&self.run_id, summary).await
    }

    /// Finalize the run as failed.
    pub async fn finish_err(self, summary: RunSummary) -> StorageResult<()> {
        self.emit_finished(&summary, RunStatus::Failed);
        self.ledger.fail_run(&self.run_id, summary).await
    }

    /// Finalize the run as cancelled.
    pub async fn finish_cancelled(self, summary: RunSummary) -> StorageResult<()> {
        self.emit_finished(&summary, RunStatus::Cancelled);
        self.ledger.cancel_run(&self.run_id, summary).await
    }

    fn emit_finished(&self, summary: &RunSummary, status: RunStatus) {
        crate::obs::emit_run_finished(
            self.run_id.as_str(),
            summary.duration_ms,
            summary.total_events,
            status.as_str(),
        );
    }

    /// Return a reference to the run ID.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}
