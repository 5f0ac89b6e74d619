//! Heartbeat engine: periodic liveness probes with at most one outstanding.
//!
//! A tick while a probe is still outstanding is a liveness failure; the
//! socket closes the link (normal code, "heartbeat timeout") and lets the
//! reconnect timer take over. The status hook values are part of the public
//! contract so operators can build dashboards over them.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Probe status reported to the user-supplied hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Sent,
    Ok,
    Error,
    Timeout,
    Disconnected,
}

impl HeartbeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Disconnected => "disconnected",
        }
    }
}

pub type HeartbeatHook = Arc<dyn Fn(HeartbeatStatus, Option<Duration>) + Send + Sync>;

/// Round-trip aggregations over successful probes.
#[derive(Debug, Default, Clone)]
pub struct RttStats {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Option<Duration>,
    last: Option<Duration>,
}

impl RttStats {
    pub fn record(&mut self, rtt: Duration) {
        self.count += 1;
        self.total += rtt;
        self.last = Some(rtt);
        self.min = Some(self.min.map_or(rtt, |m| m.min(rtt)));
        self.max = Some(self.max.map_or(rtt, |m| m.max(rtt)));
    }

    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }

    pub fn avg(&self) -> Option<Duration> {
        if self.count == 0 {
            None
        } else {
            Some(self.total / self.count as u32)
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Outcome of an interval tick.
pub(crate) enum TickAction {
    /// Send a probe with this sequence.
    Probe(String),
    /// The previous probe never returned: close the link.
    LivenessFailure,
}

pub(crate) struct Heartbeat {
    outstanding: Option<(String, Instant)>,
    pub stats: RttStats,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            outstanding: None,
            stats: RttStats::default(),
        }
    }

    /// Interval tick. At most one probe may be in flight.
    pub fn tick(&mut self, seq: String) -> TickAction {
        if self.outstanding.is_some() {
            TickAction::LivenessFailure
        } else {
            self.outstanding = Some((seq.clone(), Instant::now()));
            TickAction::Probe(seq)
        }
    }

    /// Reply arrived. Returns the round trip when the sequence matches the
    /// outstanding probe.
    pub fn settle(&mut self, seq: &str) -> Option<Duration> {
        match &self.outstanding {
            Some((expected, sent_at)) if expected == seq => {
                let rtt = sent_at.elapsed();
                self.outstanding = None;
                self.stats.record(rtt);
                Some(rtt)
            }
            _ => None,
        }
    }

    /// Forget any in-flight probe (link closed).
    pub fn clear(&mut self) {
        self.outstanding = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_outstanding_probe() {
        let mut hb = Heartbeat::new();
        assert!(matches!(hb.tick("1".into()), TickAction::Probe(s) if s == "1"));
        assert!(matches!(hb.tick("2".into()), TickAction::LivenessFailure));
    }

    #[test]
    fn test_settle_clears_and_records_rtt() {
        let mut hb = Heartbeat::new();
        let _ = hb.tick("1".into());
        assert!(hb.settle("1").is_some());
        assert_eq!(hb.stats.count(), 1);
        assert!(hb.stats.min().is_some());
        assert!(matches!(hb.tick("2".into()), TickAction::Probe(_)));
    }

    #[test]
    fn test_settle_ignores_stale_sequence() {
        let mut hb = Heartbeat::new();
        let _ = hb.tick("1".into());
        assert!(hb.settle("99").is_none());
        assert!(matches!(hb.tick("2".into()), TickAction::LivenessFailure));
    }

    #[test]
    fn test_rtt_aggregations() {
        let mut stats = RttStats::default();
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        stats.record(Duration::from_millis(20));
        assert_eq!(stats.min(), Some(Duration::from_millis(10)));
        assert_eq!(stats.max(), Some(Duration::from_millis(30)));
        assert_eq!(stats.last(), Some(Duration::from_millis(20)));
        assert_eq!(stats.avg(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_status_strings_are_contract() {
        assert_eq!(HeartbeatStatus::Sent.as_str(), "sent");
        assert_eq!(HeartbeatStatus::Ok.as_str(), "ok");
        assert_eq!(HeartbeatStatus::Error.as_str(), "error");
        assert_eq!(HeartbeatStatus::Timeout.as_str(), "timeout");
        assert_eq!(HeartbeatStatus::Disconnected.as_str(), "disconnected");
    }
}
