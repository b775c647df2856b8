//! Background tasks behind change feeds and replication.
//!
//! Each feed runs as one tokio task writing [`EngineEvent`]s into the feed's
//! channel. Tasks stop when the feed token is cancelled, when the consumer
//! drops the receiver, or, for non-live feeds, after `complete`.

use std::sync::Arc;

use serde_json::json;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::ChangeRecord;
use super::DocStore;
use crate::engine::EngineEvent;
use crate::engine::ACTIVE_EVENT;
use crate::engine::CHANGE_EVENT;
use crate::engine::COMPLETE_EVENT;
use crate::engine::ERROR_EVENT;
use crate::engine::PAUSED_EVENT;
use crate::EngineError;

pub(crate) struct ChangesTask {
    store: Arc<DocStore>,
    since: u64,
    live_changes: broadcast::Receiver<ChangeRecord>,
    live: bool,
    include_docs: bool,
}

impl ChangesTask {
    /// Subscribes to the store and fixes the start sequence before returning,
    /// so writes made before the task is first polled are still delivered.
    ///
    /// `since == None` starts at the current update sequence.
    pub(crate) fn new(
        store: Arc<DocStore>,
        since: Option<u64>,
        live: bool,
        include_docs: bool,
    ) -> Self {
        let live_changes = store.changes.subscribe();
        let since = since.unwrap_or_else(|| store.state.read().update_seq);
        Self {
            store,
            since,
            live_changes,
            live,
            include_docs,
        }
    }

    pub(crate) async fn run(
        mut self,
        events: mpsc::Sender<EngineEvent>,
        token: CancellationToken,
    ) {
        if token.is_cancelled() {
            return;
        }
        let records = self.store.state.read().changes_since(self.since);
        let mut last_seq = self.since;

        let mut delivered = 0_u64;
        for record in records {
            last_seq = last_seq.max(record.seq);
            let payload = record.to_event_payload(self.include_docs);
            if !emit(&events, &token, CHANGE_EVENT, payload).await {
                return;
            }
            delivered += 1;
        }

        if !self.live {
            let payload = json!({ "results": delivered, "last_seq": last_seq });
            emit(&events, &token, COMPLETE_EVENT, payload).await;
            return;
        }

        loop {
            let record = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                received = self.live_changes.recv() => received,
            };
            match record {
                Ok(record) if record.seq > last_seq => {
                    last_seq = record.seq;
                    let payload = record.to_event_payload(self.include_docs);
                    if !emit(&events, &token, CHANGE_EVENT, payload).await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(db = %self.store.name, skipped, "change feed lagged");
                    let error = EngineError::internal(format!("change feed skipped {} changes", skipped));
                    if !emit(&events, &token, ERROR_EVENT, crate::codec::error_payload(&error)).await {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(db = %self.store.name, "change feed stopped");
    }
}

/// One direction of a replication
pub(crate) struct Leg {
    pub source: Arc<DocStore>,
    pub target: Arc<DocStore>,
    pub direction: Option<&'static str>,
    pub checkpoint: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct LegStats {
    docs_read: usize,
    docs_written: usize,
    last_seq: u64,
}

impl LegStats {
    fn to_json(&self) -> Value {
        json!({
            "docs_read": self.docs_read,
            "docs_written": self.docs_written,
            "last_seq": self.last_seq,
        })
    }
}

impl Leg {
    /// Copies every revision the source gained after the checkpoint.
    fn pass(&mut self) -> Result<LegStats, EngineError> {
        if self.source.is_destroyed() {
            return Err(EngineError::not_found(format!("database {} was destroyed", self.source.name)));
        }
        if self.target.is_destroyed() {
            return Err(EngineError::not_found(format!("database {} was destroyed", self.target.name)));
        }

        let (records, last_seq) = {
            let state = self.source.state.read();
            let records: Vec<_> = state
                .docs
                .iter()
                .filter(|(_, d)| d.seq > self.checkpoint)
                .map(|(id, d)| (id.clone(), d.clone()))
                .collect();
            (records, state.update_seq)
        };

        let docs_read = records.len();
        let written: Vec<ChangeRecord> = {
            let mut state = self.target.state.write();
            records
                .into_iter()
                .filter_map(|(id, record)| state.merge(&id, record))
                .collect()
        };
        let docs_written = written.len();
        self.target.publish(written);
        self.checkpoint = last_seq;

        Ok(LegStats {
            docs_read,
            docs_written,
            last_seq,
        })
    }

    fn change_payload(
        &self,
        stats: &LegStats,
    ) -> Value {
        let mut payload = stats.to_json();
        if let Some(direction) = self.direction {
            payload = json!({ "direction": direction, "change": payload });
        }
        payload
    }
}

/// Runs one (replicate) or two (sync) legs until done or cancelled.
pub(crate) struct ReplicationTask {
    legs: Vec<Leg>,
    subscriptions: Vec<broadcast::Receiver<ChangeRecord>>,
    live: bool,
    caught_up: bool,
}

impl ReplicationTask {
    /// Subscribes to every leg's source before returning, so a live session
    /// sees writes made before the task is first polled.
    pub(crate) fn new(
        legs: Vec<Leg>,
        live: bool,
    ) -> Self {
        let subscriptions = legs.iter().map(|leg| leg.source.changes.subscribe()).collect();
        Self {
            legs,
            subscriptions,
            live,
            caught_up: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        events: mpsc::Sender<EngineEvent>,
        token: CancellationToken,
    ) {
        if token.is_cancelled() {
            debug!(legs = self.legs.len(), "replication cancelled before start");
            return;
        }
        let mut subscriptions = std::mem::take(&mut self.subscriptions);

        let mut totals = vec![LegStats::default(); self.legs.len()];
        for index in 0..self.legs.len() {
            if !self.run_pass(index, &mut totals, &events, &token).await {
                return;
            }
        }
        self.caught_up = true;

        if !self.live {
            emit(&events, &token, COMPLETE_EVENT, self.summary(&totals)).await;
            return;
        }
        if !emit(&events, &token, PAUSED_EVENT, json!({})).await {
            return;
        }

        loop {
            let woken = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                index = next_change(&mut subscriptions) => index,
            };
            let Some(index) = woken else {
                break;
            };
            if !self.run_pass(index, &mut totals, &events, &token).await {
                return;
            }
        }
        debug!(legs = self.legs.len(), "replication stopped");
    }

    /// Runs one pass of a leg and reports it. Returns false once the task
    /// must stop.
    ///
    /// Passes that write nothing are silent; after the initial catch-up a
    /// writing pass is framed by `active` and `paused`.
    async fn run_pass(
        &mut self,
        index: usize,
        totals: &mut [LegStats],
        events: &mpsc::Sender<EngineEvent>,
        token: &CancellationToken,
    ) -> bool {
        if token.is_cancelled() {
            return false;
        }
        let announce = self.caught_up;
        let leg = &mut self.legs[index];
        match leg.pass() {
            Ok(stats) => {
                let total = &mut totals[index];
                total.docs_read += stats.docs_read;
                total.docs_written += stats.docs_written;
                total.last_seq = stats.last_seq;
                if stats.docs_written == 0 {
                    return true;
                }
                let payload = leg.change_payload(&stats);
                if announce && !emit(events, token, ACTIVE_EVENT, json!({})).await {
                    return false;
                }
                if !emit(events, token, CHANGE_EVENT, payload).await {
                    return false;
                }
                !announce || emit(events, token, PAUSED_EVENT, json!({})).await
            }
            Err(error) => {
                warn!(%error, "replication failed");
                emit(events, token, ERROR_EVENT, crate::codec::error_payload(&error)).await;
                false
            }
        }
    }

    fn summary(
        &self,
        totals: &[LegStats],
    ) -> Value {
        match (self.legs.as_slice(), totals) {
            ([leg], [total]) if leg.direction.is_none() => {
                let mut summary = total.to_json();
                summary["ok"] = Value::Bool(true);
                summary["status"] = Value::from("complete");
                summary
            }
            _ => {
                let mut summary = json!({ "ok": true, "status": "complete" });
                for (leg, total) in self.legs.iter().zip(totals) {
                    let direction = leg.direction.unwrap_or("replicate");
                    summary[direction] = total.to_json();
                }
                summary
            }
        }
    }
}

/// Waits for the next change on any leg's source; yields the leg index, or
/// `None` when every source has gone away.
async fn next_change(subscriptions: &mut [broadcast::Receiver<ChangeRecord>]) -> Option<usize> {
    let mut open: Vec<bool> = vec![true; subscriptions.len()];
    loop {
        if open.iter().all(|o| !o) {
            return None;
        }
        let (first, rest) = subscriptions.split_first_mut()?;
        let outcome = match rest.first_mut() {
            Some(second) => tokio::select! {
                r = first.recv(), if open[0] => (0, r),
                r = second.recv(), if open[1] => (1, r),
            },
            None => (0, first.recv().await),
        };
        match outcome {
            (index, Ok(_)) | (index, Err(RecvError::Lagged(_))) => return Some(index),
            (index, Err(RecvError::Closed)) => open[index] = false,
        }
    }
}

/// Sends one event unless the feed was cancelled or its consumer is gone.
/// Returns false when the producer should stop.
async fn emit(
    events: &mpsc::Sender<EngineEvent>,
    token: &CancellationToken,
    name: &str,
    payload: Value,
) -> bool {
    if token.is_cancelled() {
        return false;
    }
    events.send(EngineEvent::new(name, payload)).await.is_ok()
}
