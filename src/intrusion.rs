//! Append-only intrusion event log with subscriber notification.
//!
//! The connection layer reports a [`IntrusionEvent`] whenever replay
//! protection, signature verification, or rate limiting flags a bad
//! message. Events land in a capacity-bounded in-memory log, are appended
//! to an optional JSONL file, and are broadcast to subscribers.
//!
//! Subscriber failure isolation is structural: each subscriber owns an
//! independent broadcast receiver, so a slow, failed, or dropped
//! subscriber never affects the log, the reporting caller, or other
//! subscribers. A receiver that falls too far behind sees
//! `RecvError::Lagged` and continues from the oldest retained event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Default number of events retained in memory
pub const DEFAULT_CAPACITY: usize = 4096;

/// The kind of security violation a peer triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntrusionKind {
    /// Peer exceeded its request budget
    RateLimit,
    /// Message signature failed verification
    InvalidSignature,
    /// Replayed or stale message
    Replay,
}

/// A recorded security violation; immutable once appended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrusionEvent {
    pub id: Uuid,
    pub peer_id: String,
    pub kind: IntrusionKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl IntrusionEvent {
    /// Build an event stamped with the current time.
    pub fn new(peer_id: impl Into<String>, kind: IntrusionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_id: peer_id.into(),
            kind,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Attach context metadata to the event.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Intrusion detector configuration
#[derive(Debug, Clone)]
pub struct IntrusionConfig {
    /// Events retained in memory; oldest dropped beyond this
    pub capacity: usize,
    /// Optional JSONL file every event is also appended to
    pub log_file: Option<PathBuf>,
}

impl Default for IntrusionConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            log_file: None,
        }
    }
}

/// Append-only log of security violations with broadcast notification
pub struct IntrusionDetector {
    events: Mutex<VecDeque<IntrusionEvent>>,
    capacity: usize,
    tx: broadcast::Sender<IntrusionEvent>,
    sink: Option<Mutex<File>>,
}

impl Default for IntrusionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrusionDetector {
    /// Create a detector with default configuration (no file sink).
    pub fn new() -> Self {
        Self::with_config(IntrusionConfig::default())
    }

    /// Create a detector with explicit configuration.
    ///
    /// A sink that cannot be opened is logged and skipped; recording
    /// events must not depend on the disk.
    pub fn with_config(config: IntrusionConfig) -> Self {
        let sink = config.log_file.as_ref().and_then(|path| {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!("Failed to create intrusion log directory: {}", e);
                    return None;
                }
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    info!("Intrusion log sink: {:?}", path);
                    Some(Mutex::new(file))
                }
                Err(e) => {
                    warn!("Failed to open intrusion log {:?}: {}", path, e);
                    None
                }
            }
        });

        let (tx, _) = broadcast::channel(config.capacity.max(16));

        Self {
            events: Mutex::new(VecDeque::new()),
            // a zero cap would make the pop-at-capacity check unreachable
            // and let the log grow without bound
            capacity: config.capacity.max(1),
            tx,
            sink,
        }
    }

    /// Append an event to the log and notify all current subscribers.
    ///
    /// Never blocks on subscribers and never fails: a send with no
    /// receivers is not an error, and sink write failures are absorbed.
    pub fn report(&self, event: IntrusionEvent) {
        {
            let mut events = self.events.lock().unwrap();
            while events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }

        self.append_to_sink(&event);

        // Err here only means nobody is subscribed right now
        let _ = self.tx.send(event);
    }

    /// Convenience: build and report an event in one call.
    pub fn report_violation(
        &self,
        peer_id: &str,
        kind: IntrusionKind,
        metadata: Option<BTreeMap<String, String>>,
    ) {
        let mut event = IntrusionEvent::new(peer_id, kind);
        event.metadata = metadata;
        self.report(event);
    }

    /// Snapshot of the retained log in append order.
    pub fn events(&self) -> Vec<IntrusionEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    /// Number of events currently retained
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Whether the retained log is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register for every newly reported event.
    ///
    /// Dropping the receiver unsubscribes; already-delivered events are
    /// unaffected.
    pub fn subscribe(&self) -> broadcast::Receiver<IntrusionEvent> {
        self.tx.subscribe()
    }

    fn append_to_sink(&self, event: &IntrusionEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        match serde_json::to_string(event) {
            Ok(line) => {
                let mut file = sink.lock().unwrap();
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    warn!("Failed to append intrusion event: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize intrusion event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_test_dir() -> PathBuf {
        let dir = std::env::temp_dir()
            .join("syncguard_test_intrusion")
            .join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn report_appends_to_log() {
        let detector = IntrusionDetector::new();
        let event = IntrusionEvent::new("peer-1", IntrusionKind::Replay);
        let id = event.id;

        detector.report(event);

        let events = detector.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].peer_id, "peer-1");
        assert_eq!(events[0].kind, IntrusionKind::Replay);
    }

    #[test]
    fn events_returns_append_order_snapshots() {
        let detector = IntrusionDetector::new();

        detector.report_violation("peer-1", IntrusionKind::RateLimit, None);
        detector.report_violation("peer-2", IntrusionKind::InvalidSignature, None);

        let first = detector.events();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].peer_id, "peer-1");
        assert_eq!(first[1].peer_id, "peer-2");

        // restartable read: a second call returns the current full snapshot
        detector.report_violation("peer-3", IntrusionKind::Replay, None);
        assert_eq!(detector.events().len(), 3);
    }

    #[test]
    fn subscriber_receives_exactly_one_notification_per_event() {
        let detector = IntrusionDetector::new();
        let mut rx = detector.subscribe();

        let event = IntrusionEvent::new("peer-1", IntrusionKind::InvalidSignature);
        let id = event.id;
        detector.report(event);

        assert_eq!(rx.try_recv().unwrap().id, id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn every_subscriber_is_notified() {
        let detector = IntrusionDetector::new();
        let mut rx1 = detector.subscribe();
        let mut rx2 = detector.subscribe();

        detector.report_violation("peer-1", IntrusionKind::Replay, None);

        assert_eq!(rx1.try_recv().unwrap().peer_id, "peer-1");
        assert_eq!(rx2.try_recv().unwrap().peer_id, "peer-1");
    }

    #[test]
    fn dropped_subscriber_does_not_affect_log_or_others() {
        let detector = IntrusionDetector::new();
        let rx_dead = detector.subscribe();
        let mut rx_live = detector.subscribe();

        drop(rx_dead);
        detector.report_violation("peer-1", IntrusionKind::RateLimit, None);

        assert_eq!(detector.len(), 1);
        assert_eq!(rx_live.try_recv().unwrap().kind, IntrusionKind::RateLimit);
    }

    #[test]
    fn unsubscribing_stops_future_notifications_only() {
        let detector = IntrusionDetector::new();
        let mut rx = detector.subscribe();

        detector.report_violation("peer-1", IntrusionKind::Replay, None);
        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.peer_id, "peer-1");

        drop(rx);
        detector.report_violation("peer-2", IntrusionKind::Replay, None);
        assert_eq!(detector.len(), 2);
    }

    #[test]
    fn report_without_subscribers_is_fine() {
        let detector = IntrusionDetector::new();
        detector.report_violation("peer-1", IntrusionKind::Replay, None);
        assert_eq!(detector.len(), 1);
    }

    #[test]
    fn capacity_bounds_the_log() {
        let detector = IntrusionDetector::with_config(IntrusionConfig {
            capacity: 3,
            log_file: None,
        });

        for i in 0..5 {
            detector.report_violation(&format!("peer-{}", i), IntrusionKind::RateLimit, None);
        }

        let events = detector.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].peer_id, "peer-2");
        assert_eq!(events[2].peer_id, "peer-4");
    }

    #[test]
    fn zero_capacity_is_clamped_to_one_event() {
        let detector = IntrusionDetector::with_config(IntrusionConfig {
            capacity: 0,
            log_file: None,
        });

        for i in 0..5 {
            detector.report_violation(&format!("peer-{}", i), IntrusionKind::Replay, None);
        }

        // the log stays bounded even for a degenerate configured capacity
        let events = detector.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].peer_id, "peer-4");
    }

    #[test]
    fn metadata_is_carried_through() {
        let detector = IntrusionDetector::new();
        let mut rx = detector.subscribe();

        let mut metadata = BTreeMap::new();
        metadata.insert("nonce".to_string(), "abc123".to_string());
        detector.report_violation("peer-1", IntrusionKind::Replay, Some(metadata.clone()));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.metadata, Some(metadata));
    }

    #[test]
    fn sink_receives_parseable_jsonl() {
        let dir = make_test_dir();
        let log_file = dir.join("intrusions.jsonl");
        let detector = IntrusionDetector::with_config(IntrusionConfig {
            capacity: 16,
            log_file: Some(log_file.clone()),
        });

        detector.report_violation("peer-1", IntrusionKind::InvalidSignature, None);
        detector.report_violation("peer-2", IntrusionKind::Replay, None);

        let content = std::fs::read_to_string(&log_file).unwrap();
        let parsed: Vec<IntrusionEvent> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].peer_id, "peer-1");
        assert_eq!(parsed[1].kind, IntrusionKind::Replay);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn concurrent_reports_all_land() {
        let detector = Arc::new(IntrusionDetector::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let detector = Arc::clone(&detector);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        detector.report_violation(
                            &format!("peer-{}", i),
                            IntrusionKind::RateLimit,
                            None,
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(detector.len(), 80);
    }

    #[tokio::test]
    async fn async_subscriber_receives_events() {
        let detector = Arc::new(IntrusionDetector::new());
        let mut rx = detector.subscribe();

        let reporter = Arc::clone(&detector);
        let handle = tokio::spawn(async move {
            reporter.report_violation("peer-async", IntrusionKind::Replay, None);
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer_id, "peer-async");
        handle.await.unwrap();
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = IntrusionEvent::new("peer-1", IntrusionKind::InvalidSignature)
            .with_metadata(BTreeMap::from([(
                "reason".to_string(),
                "bad signature".to_string(),
            )]));

        let json = serde_json::to_string(&event).unwrap();
        let restored: IntrusionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, event.id);
        assert_eq!(restored.kind, IntrusionKind::InvalidSignature);
        assert_eq!(
            restored.metadata.unwrap().get("reason").unwrap(),
            "bad signature"
        );
    }
}
