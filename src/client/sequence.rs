//! Sequence allocation and the pending-reply registry.
//!
//! Every request on a link carries a fresh monotonic sequence (stringified).
//! The registry maps outstanding sequences to one-shot completion sinks with
//! a deadline. A slot is freed exactly once by the first of reply, timeout,
//! or link close; late replies find no entry and are silently discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

/// Monotonic per-link id generator. Emitted values are distinct and
/// strictly increasing for the lifetime of the link.
pub(crate) struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        (self.next.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

/// Terminal outcome of a request.
#[derive(Debug, Clone)]
pub enum ReplyOutcome {
    /// `{status: "ok"}` reply; carries the response object.
    Ok(Value),
    /// `{status: "error"}` reply; carries the response (code, reason, ...).
    Error(Value),
    /// Deadline elapsed, or the link terminated while in flight.
    Timeout,
}

type CompletionSink = Box<dyn FnOnce(ReplyOutcome) + Send>;

struct PendingEntry {
    sink: CompletionSink,
    timer: tokio::task::JoinHandle<()>,
}

/// Registry of in-flight requests, keyed by sequence.
#[derive(Clone)]
pub(crate) struct PendingReplies {
    entries: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a sink for `seq`. The deadline starts now: requests queued
    /// while the link is down time out from enqueue, not from flush.
    pub fn register(&self, seq: String, deadline: Duration, sink: CompletionSink) {
        let entries = self.entries.clone();
        let timer_seq = seq.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let entry = entries
                .lock()
                .expect("pending registry lock poisoned")
                .remove(&timer_seq);
            if let Some(entry) = entry {
                (entry.sink)(ReplyOutcome::Timeout);
            }
        });
        self.entries
            .lock()
            .expect("pending registry lock poisoned")
            .insert(seq, PendingEntry { sink, timer });
    }

    /// Settle `seq` with `outcome`. Returns false when no entry exists
    /// (already settled, or a reply arriving after its deadline).
    pub fn settle(&self, seq: &str, outcome: ReplyOutcome) -> bool {
        let entry = self
            .entries
            .lock()
            .expect("pending registry lock poisoned")
            .remove(seq);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                (entry.sink)(outcome);
                true
            }
            None => false,
        }
    }

    /// Settle everything outstanding. Used when the transport terminates.
    pub fn settle_all(&self, outcome: ReplyOutcome) {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.entries.lock().expect("pending registry lock poisoned");
            entries.drain().map(|(_, e)| e).collect()
        };
        for entry in drained {
            entry.timer.abort();
            (entry.sink)(outcome.clone());
        }
    }

    pub fn outstanding(&self) -> usize {
        self.entries
            .lock()
            .expect("pending registry lock poisoned")
            .len()
    }
}
