//! Security event log, statistics, and threat tracking.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::{SecurityEventType, SecurityStatus, ThreatLevel};

/// An immutable record of something the gate observed or refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub threat_level: ThreatLevel,
    /// Structured details such as `path` or `plugin`.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Component that raised the event.
    pub source: String,
}

impl SecurityEvent {
    /// Create an event stamped now, at the type's default threat level.
    pub fn new(event_type: SecurityEventType, description: impl Into<String>) -> Self {
        Self {
            event_type,
            description: description.into(),
            timestamp: Utc::now(),
            threat_level: event_type.default_threat_level(),
            context: BTreeMap::new(),
            source: "security".to_string(),
        }
    }

    pub fn with_threat_level(mut self, level: ThreatLevel) -> Self {
        self.threat_level = level;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Key identifying what the event is about, for threat grouping.
    fn subject(&self) -> &str {
        self.context
            .get("path")
            .or_else(|| self.context.get("plugin"))
            .map(String::as_str)
            .unwrap_or(&self.description)
    }
}

/// Aggregate counters, updated alongside every append.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStatistics {
    pub total_events: u64,
    pub blocked_operations: u64,
    pub signature_verifications: u64,
    pub file_access_checks: u64,
    pub hijacking_attempts: u64,
    pub active_threats: u64,
    pub last_update: Option<DateTime<Utc>>,
}

/// A group of high-severity events about the same subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityThreat {
    pub id: String,
    pub level: ThreatLevel,
    pub description: String,
    pub first_detected: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub active: bool,
    pub related_events: Vec<SecurityEvent>,
}

/// Criteria for selecting events from the log.
///
/// Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Vec<SecurityEventType>,
    pub min_threat_level: ThreatLevel,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<String>,
    /// Case-insensitive substring of the description or a context value.
    pub text: Option<String>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: SecurityEventType) -> Self {
        self.event_types.push(event_type);
        self
    }

    pub fn min_threat_level(mut self, level: ThreatLevel) -> Self {
        self.min_threat_level = level;
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Whether `event` satisfies every criterion.
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if event.threat_level < self.min_threat_level {
            return false;
        }
        if self.start.is_some_and(|start| event.timestamp < start)
            || self.end.is_some_and(|end| event.timestamp > end)
        {
            return false;
        }
        if let Some(source) = &self.source
            && &event.source != source
        {
            return false;
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let found = event.description.to_lowercase().contains(&needle)
                || event
                    .context
                    .values()
                    .any(|v| v.to_lowercase().contains(&needle));
            if !found {
                return false;
            }
        }
        true
    }
}

/// Receives security notifications.
///
/// Handlers are invoked after the log lock is released, on the thread that
/// raised the event.
pub trait SecurityEventHandler: Send + Sync {
    fn on_event(&self, event: &SecurityEvent);

    fn on_threat(&self, _threat: &SecurityThreat) {}

    fn on_status_changed(&self, _old: SecurityStatus, _new: SecurityStatus) {}
}

/// Threshold at which events open or feed a threat.
const THREAT_THRESHOLD: ThreatLevel = ThreatLevel::High;

/// Most related events kept per threat.
const MAX_RELATED_EVENTS: usize = 32;

/// Capacity-bounded FIFO of events plus the statistics derived from them.
///
/// Open threats share the same bound; the one idle longest is dropped first.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<SecurityEvent>,
    capacity: usize,
    retain: bool,
    stats: SecurityStatistics,
    threats: IndexMap<String, SecurityThreat>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
            retain: true,
            stats: SecurityStatistics::default(),
            threats: IndexMap::new(),
        }
    }

    /// Change the capacity, dropping the oldest events and threats if needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        while self.threats.len() > self.capacity {
            self.threats.shift_remove_index(0);
        }
        self.refresh_threat_count();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether appended events are kept. Statistics are always updated.
    pub fn set_retain(&mut self, retain: bool) {
        self.retain = retain;
    }

    /// Append an event and fold it into the statistics.
    ///
    /// Returns the threat the event opened or extended, if any.
    pub fn record(&mut self, event: SecurityEvent) -> Option<SecurityThreat> {
        let now = Utc::now();
        self.stats.total_events += 1;
        self.stats.last_update = Some(now);
        if event.event_type.is_blocking() {
            self.stats.blocked_operations += 1;
        }
        if event.event_type == SecurityEventType::HijackingAttempt {
            self.stats.hijacking_attempts += 1;
        }

        let threat = (event.threat_level >= THREAT_THRESHOLD).then(|| self.track_threat(&event));

        if self.retain {
            self.events.push_back(event);
            while self.events.len() > self.capacity {
                self.events.pop_front();
            }
        }
        threat
    }

    // The most recently active threat sits last; the front is evicted first.
    fn track_threat(&mut self, event: &SecurityEvent) -> SecurityThreat {
        let id = format!("{}:{}", event.event_type, event.subject());
        let mut threat = self
            .threats
            .shift_remove(&id)
            .unwrap_or_else(|| SecurityThreat {
                id: id.clone(),
                level: event.threat_level,
                description: event.description.clone(),
                first_detected: event.timestamp,
                last_activity: event.timestamp,
                active: true,
                related_events: Vec::new(),
            });
        threat.active = true;
        threat.last_activity = event.timestamp;
        threat.level = threat.level.max(event.threat_level);
        threat.related_events.push(event.clone());
        if threat.related_events.len() > MAX_RELATED_EVENTS {
            threat.related_events.remove(0);
        }

        while self.threats.len() >= self.capacity {
            self.threats.shift_remove_index(0);
        }
        let snapshot = threat.clone();
        self.threats.insert(id, threat);
        self.refresh_threat_count();
        snapshot
    }

    fn refresh_threat_count(&mut self) {
        self.stats.active_threats = self.threats.values().filter(|t| t.active).count() as u64;
    }

    pub(crate) fn count_signature_verification(&mut self) {
        self.stats.signature_verifications += 1;
        self.stats.last_update = Some(Utc::now());
    }

    pub(crate) fn count_file_access_check(&mut self) {
        self.stats.file_access_checks += 1;
        self.stats.last_update = Some(Utc::now());
    }

    /// At most `n` events, most recent first.
    pub fn recent(&self, n: usize) -> Vec<SecurityEvent> {
        self.events.iter().rev().take(n).cloned().collect()
    }

    /// Events matching `filter`, oldest first.
    pub fn filtered(&self, filter: &EventFilter) -> Vec<SecurityEvent> {
        self.events.iter().filter(|e| filter.matches(e)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn statistics(&self) -> SecurityStatistics {
        self.stats.clone()
    }

    pub fn active_threats(&self) -> Vec<SecurityThreat> {
        self.threats.values().filter(|t| t.active).cloned().collect()
    }

    /// Mark a threat as handled and forget it.
    pub fn resolve_threat(&mut self, id: &str) -> bool {
        let resolved = self.threats.shift_remove(id).is_some();
        self.refresh_threat_count();
        resolved
    }

    /// Drop all events, threats, and counters.
    pub fn clear(&mut self) {
        self.events.clear();
        self.threats.clear();
        self.stats = SecurityStatistics::default();
    }
}

/// Write events as JSON lines. Returns the number written.
pub(crate) fn write_json_lines<W: Write>(
    mut writer: W,
    events: &[SecurityEvent],
) -> std::io::Result<usize> {
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(events.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: SecurityEventType, description: &str) -> SecurityEvent {
        SecurityEvent::new(kind, description)
    }

    #[test]
    fn test_bounded_fifo() {
        let mut log = EventLog::new(3);
        for i in 0..5 {
            log.record(event(SecurityEventType::FileAccessDenied, &format!("e{i}")));
        }
        assert_eq!(log.len(), 3);

        let recent = log.recent(10);
        let names: Vec<_> = recent.iter().map(|e| e.description.as_str()).collect();
        assert_eq!(names, vec!["e4", "e3", "e2"]);
        assert_eq!(log.statistics().total_events, 5);
        assert_eq!(log.statistics().blocked_operations, 5);
    }

    #[test]
    fn test_recent_is_bounded() {
        let mut log = EventLog::new(100);
        for i in 0..10 {
            log.record(event(SecurityEventType::SandboxViolation, &format!("e{i}")));
        }
        let recent = log.recent(4);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].description, "e9");
        assert!(log.recent(0).is_empty());
    }

    #[test]
    fn test_shrinking_capacity() {
        let mut log = EventLog::new(10);
        for i in 0..10 {
            log.record(event(SecurityEventType::SandboxViolation, &format!("e{i}")));
        }
        log.set_capacity(2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.recent(1)[0].description, "e9");
    }

    #[test]
    fn test_threat_grouping() {
        let mut log = EventLog::new(100);
        let first = SecurityEvent::new(SecurityEventType::HijackingAttempt, "planted")
            .with_context("path", "/home/me/libc.so.6");
        let threat = log.record(first.clone()).unwrap();
        assert!(threat.active);
        assert_eq!(threat.level, ThreatLevel::Critical);

        let threat = log.record(first).unwrap();
        assert_eq!(threat.related_events.len(), 2);
        assert_eq!(log.active_threats().len(), 1);
        assert_eq!(log.statistics().hijacking_attempts, 2);
        assert_eq!(log.statistics().active_threats, 1);

        assert!(log.record(event(SecurityEventType::FileAccessDenied, "low")).is_none());

        assert!(log.resolve_threat(&threat.id));
        assert!(!log.resolve_threat(&threat.id));
        assert!(log.active_threats().is_empty());
        assert_eq!(log.statistics().active_threats, 0);
    }

    #[test]
    fn test_threats_share_the_log_bound() {
        let mut log = EventLog::new(4);
        for i in 0..50 {
            log.record(
                event(SecurityEventType::PathTraversalAttempt, "traversal")
                    .with_context("path", format!("../secret{i}")),
            );
        }
        let threats = log.active_threats();
        assert_eq!(threats.len(), 4);
        assert!(threats[3].id.ends_with("../secret49"));
        assert_eq!(log.statistics().active_threats, 4);

        // Renewed activity keeps a threat from being evicted.
        let renewed = threats[0].id.clone();
        let idle = threats[1].id.clone();
        log.record(
            event(SecurityEventType::PathTraversalAttempt, "traversal")
                .with_context("path", "../secret46"),
        );
        log.record(
            event(SecurityEventType::PathTraversalAttempt, "traversal")
                .with_context("path", "../fresh"),
        );
        let ids: Vec<_> = log.active_threats().into_iter().map(|t| t.id).collect();
        assert!(ids.contains(&renewed));
        assert!(!ids.contains(&idle));
        assert!(ids.iter().any(|id| id.ends_with("../fresh")));

        for id in &ids {
            assert!(log.resolve_threat(id));
        }
        assert!(log.active_threats().is_empty());
        assert_eq!(log.statistics().active_threats, 0);

        log.record(
            event(SecurityEventType::PathTraversalAttempt, "traversal")
                .with_context("path", "../again"),
        );
        log.set_capacity(1);
        assert_eq!(log.active_threats().len(), 1);
    }

    #[test]
    fn test_not_retained_still_counted() {
        let mut log = EventLog::new(10);
        log.set_retain(false);
        log.record(event(SecurityEventType::FileAccessDenied, "x"));
        assert!(log.is_empty());
        assert_eq!(log.statistics().total_events, 1);
    }

    #[test]
    fn test_filter() {
        let mut log = EventLog::new(10);
        log.record(
            event(SecurityEventType::FileAccessDenied, "denied read")
                .with_context("path", "/etc/shadow"),
        );
        log.record(event(SecurityEventType::HijackingAttempt, "planted").with_source("registry"));
        log.record(event(SecurityEventType::PathTraversalAttempt, "traversal"));

        let by_type = EventFilter::new().event_type(SecurityEventType::FileAccessDenied);
        assert_eq!(log.filtered(&by_type).len(), 1);

        let by_level = EventFilter::new().min_threat_level(ThreatLevel::High);
        assert_eq!(log.filtered(&by_level).len(), 2);

        let by_source = EventFilter::new().source("registry");
        assert_eq!(log.filtered(&by_source)[0].description, "planted");

        let by_text = EventFilter::new().text("SHADOW");
        assert_eq!(log.filtered(&by_text).len(), 1);

        let future = Utc::now() + chrono::Duration::hours(1);
        let by_time = EventFilter::new().between(future, future + chrono::Duration::hours(1));
        assert!(log.filtered(&by_time).is_empty());
    }

    #[test]
    fn test_json_lines() {
        let events = vec![
            event(SecurityEventType::FileAccessDenied, "a"),
            event(SecurityEventType::InvalidSignature, "b"),
        ];
        let mut out = Vec::new();
        assert_eq!(write_json_lines(&mut out, &events).unwrap(), 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: SecurityEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, events[1]);
    }
}
