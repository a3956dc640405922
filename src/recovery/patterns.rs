//! Cognitive-pattern tracker
//!
//! In-process taps keyed by agent uuid: tool-call fingerprints for loop
//! detection and investigation time-boxing. Bounded per agent; nothing here
//! is persisted.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use uuid::Uuid;

/// Window examined for repeated fingerprints.
pub const LOOP_WINDOW: Duration = Duration::minutes(30);

/// Repetitions within the window that count as a cognitive loop.
pub const LOOP_THRESHOLD: usize = 3;

/// An investigation without progress for this long is time-boxed out.
pub const INVESTIGATION_TIME_BOX: Duration = Duration::minutes(10);

const MAX_EVENTS_PER_AGENT: usize = 256;

#[derive(Debug, Clone)]
struct TrackedEvent {
    fingerprint: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Investigation {
    started_at: DateTime<Utc>,
    last_progress: DateTime<Utc>,
}

/// Shared tracker handle.
#[derive(Default)]
pub struct PatternTracker {
    events: DashMap<Uuid, VecDeque<TrackedEvent>>,
    investigations: DashMap<Uuid, Investigation>,
}

impl PatternTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable fingerprint of one tool call / update shape.
    pub fn fingerprint(task_type: Option<&str>, parameters: &[f64]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(task_type.unwrap_or("untyped"));
        for p in parameters {
            // Quantized so float noise does not defeat loop detection.
            hasher.update(((p * 100.0).round() as i64).to_le_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// Record one occurrence for the agent.
    pub fn record(&self, uuid: Uuid, fingerprint: String) {
        let mut events = self.events.entry(uuid).or_default();
        events.push_back(TrackedEvent {
            fingerprint,
            at: Utc::now(),
        });
        while events.len() > MAX_EVENTS_PER_AGENT {
            events.pop_front();
        }
    }

    /// The fingerprint repeated at least `LOOP_THRESHOLD` times within the
    /// window, if any.
    pub fn detect_loop(&self, uuid: Uuid) -> Option<String> {
        let events = self.events.get(&uuid)?;
        let cutoff = Utc::now() - LOOP_WINDOW;
        let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for event in events.iter().filter(|e| e.at >= cutoff) {
            let count = counts.entry(event.fingerprint.as_str()).or_insert(0);
            *count += 1;
            if *count >= LOOP_THRESHOLD {
                return Some(event.fingerprint.clone());
            }
        }
        None
    }

    /// Mark the agent as running an investigation session.
    pub fn begin_investigation(&self, uuid: Uuid) {
        let now = Utc::now();
        self.investigations.insert(
            uuid,
            Investigation {
                started_at: now,
                last_progress: now,
            },
        );
    }

    /// Record an investigation progress marker.
    pub fn mark_progress(&self, uuid: Uuid) {
        if let Some(mut investigation) = self.investigations.get_mut(&uuid) {
            investigation.last_progress = Utc::now();
        }
    }

    pub fn end_investigation(&self, uuid: Uuid) {
        self.investigations.remove(&uuid);
    }

    /// Whether an investigation has run past the time box without a
    /// progress marker.
    pub fn time_box_exceeded(&self, uuid: Uuid) -> bool {
        self.investigations
            .get(&uuid)
            .map(|inv| Utc::now() - inv.last_progress > INVESTIGATION_TIME_BOX)
            .unwrap_or(false)
    }

    /// Drop all tracking for an agent.
    pub fn forget(&self, uuid: Uuid) {
        self.events.remove(&uuid);
        self.investigations.remove(&uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stability() {
        let a = PatternTracker::fingerprint(Some("search"), &[0.1, 0.2]);
        let b = PatternTracker::fingerprint(Some("search"), &[0.1001, 0.2001]);
        let c = PatternTracker::fingerprint(Some("search"), &[0.5, 0.2]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, PatternTracker::fingerprint(Some("edit"), &[0.1, 0.2]));
    }

    #[test]
    fn test_loop_detection_threshold() {
        let tracker = PatternTracker::new();
        let uuid = Uuid::new_v4();
        let fp = PatternTracker::fingerprint(Some("search"), &[1.0]);

        tracker.record(uuid, fp.clone());
        tracker.record(uuid, fp.clone());
        assert_eq!(tracker.detect_loop(uuid), None);

        tracker.record(uuid, fp.clone());
        assert_eq!(tracker.detect_loop(uuid), Some(fp));
    }

    #[test]
    fn test_distinct_fingerprints_do_not_loop() {
        let tracker = PatternTracker::new();
        let uuid = Uuid::new_v4();
        for n in 0..10 {
            tracker.record(uuid, format!("fp-{}", n));
        }
        assert_eq!(tracker.detect_loop(uuid), None);
    }

    #[test]
    fn test_investigation_time_box() {
        let tracker = PatternTracker::new();
        let uuid = Uuid::new_v4();
        assert!(!tracker.time_box_exceeded(uuid));

        tracker.begin_investigation(uuid);
        assert!(!tracker.time_box_exceeded(uuid));

        // Backdate the progress marker past the box.
        tracker.investigations.get_mut(&uuid).unwrap().last_progress =
            Utc::now() - Duration::minutes(11);
        assert!(tracker.time_box_exceeded(uuid));

        tracker.mark_progress(uuid);
        assert!(!tracker.time_box_exceeded(uuid));

        tracker.end_investigation(uuid);
        assert!(!tracker.time_box_exceeded(uuid));
    }
}
