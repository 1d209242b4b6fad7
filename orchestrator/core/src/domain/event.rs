// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Discovered Facts (Events)
//!
//! An [`Event`] is one fact discovered about a scan target: a type, a data
//! payload, the module that produced it and a frozen reference to the event
//! it was derived from. Every scan has exactly one synthetic `ROOT` event;
//! all other events hang off it, forming the scan's lineage forest.
//!
//! ## Lineage Invariant
//!
//! The parent reference and depth are fixed in [`Event::derived`] and have no
//! setters. A child can only be built from a parent that already exists, so an
//! ancestor chain can never loop back on itself.
//!
//! ## Fingerprints
//!
//! [`Fingerprint`] is the SHA-256 of `(event_type, data, source_module)`. The
//! pipeline deduplicates on it, so the same fact reported twice by the same
//! module is delivered once, while the same fact found by two different
//! modules is kept twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::domain::scan::Target;

/// Source module name stamped on events the orchestrator creates itself.
pub const CORE_MODULE: &str = "argus";

/// Upper bound for the confidence/visibility/risk scales.
pub const SCORE_MAX: u8 = 100;

/// Event type name. Normalised to upper case so `domain` and `DOMAIN` are
/// the same subscription key, including when read from a manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct EventType(String);

impl EventType {
    pub const ROOT: &'static str = "ROOT";
    pub const WILDCARD: &'static str = "*";

    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_uppercase())
    }

    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    /// The "watch everything" subscription marker.
    pub fn wildcard() -> Self {
        Self(Self::WILDCARD.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable dedup key: hex SHA-256 over `(event_type, data, source_module)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(event_type: &EventType, data: &str, source_module: &str) -> Self {
        let mut hasher = Sha256::new();
        // NUL separators keep ("AB", "C") and ("A", "BC") apart.
        hasher.update(event_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(data.as_bytes());
        hasher.update([0u8]);
        hasher.update(source_module.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, enough for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    event_type: EventType,
    data: String,
    source_module: String,
    parent: Option<EventId>,
    depth: u32,
    confidence: u8,
    visibility: u8,
    risk: u8,
    false_positive: bool,
    fingerprint: Fingerprint,
    sequence: Option<u64>,
    generated_at: DateTime<Utc>,
}

impl Event {
    /// The synthetic root of a scan's lineage. Its data is the target value.
    pub fn root(target: &Target) -> Self {
        let event_type = EventType::root();
        let fingerprint = Fingerprint::compute(&event_type, target.value(), CORE_MODULE);
        Self {
            id: EventId::new(),
            event_type,
            data: target.value().to_string(),
            source_module: CORE_MODULE.to_string(),
            parent: None,
            depth: 0,
            confidence: SCORE_MAX,
            visibility: SCORE_MAX,
            risk: 0,
            false_positive: false,
            fingerprint,
            sequence: None,
            generated_at: Utc::now(),
        }
    }

    /// Build a child of `parent`. The parent reference is frozen here.
    pub fn derived(
        event_type: impl Into<EventType>,
        data: impl Into<String>,
        source_module: impl Into<String>,
        parent: &Event,
    ) -> Self {
        let event_type = event_type.into();
        let data = data.into();
        let source_module = source_module.into();
        let fingerprint = Fingerprint::compute(&event_type, &data, &source_module);
        Self {
            id: EventId::new(),
            event_type,
            data,
            source_module,
            parent: Some(parent.id),
            depth: parent.depth.saturating_add(1),
            confidence: SCORE_MAX,
            visibility: SCORE_MAX,
            risk: 0,
            false_positive: false,
            fingerprint,
            sequence: None,
            generated_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence.min(SCORE_MAX);
        self
    }

    pub fn with_visibility(mut self, visibility: u8) -> Self {
        self.visibility = visibility.min(SCORE_MAX);
        self
    }

    pub fn with_risk(mut self, risk: u8) -> Self {
        self.risk = risk.min(SCORE_MAX);
        self
    }

    pub fn with_false_positive(mut self, false_positive: bool) -> Self {
        self.false_positive = false_positive;
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn source_module(&self) -> &str {
        &self.source_module
    }

    pub fn parent(&self) -> Option<EventId> {
        self.parent
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn confidence(&self) -> u8 {
        self.confidence
    }

    pub fn visibility(&self) -> u8 {
        self.visibility
    }

    pub fn risk(&self) -> u8 {
        self.risk
    }

    pub fn is_false_positive(&self) -> bool {
        self.false_positive
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Pipeline sequence number, `None` until the event is accepted.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none() && self.event_type.is_root()
    }

    pub(crate) fn stamp_sequence(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    /// Reporting flag only; flipping it never retracts dispatched work.
    pub(crate) fn set_false_positive(&mut self, false_positive: bool) {
        self.false_positive = false_positive;
    }
}

/// Why an accepted event produced no work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    LowConfidence,
    LowVisibility,
    FalsePositive,
}

/// Why an event was refused outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Parent is not an accepted event of this scan.
    UnknownParent,
    /// Same `(type, data)` as its parent.
    EchoesParent,
    DepthExceeded { depth: u32, limit: u32 },
    EmptyData,
    /// A second root for a scan that already has one.
    RootAlreadySeeded,
    /// The scan is no longer accepting events.
    Closed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownParent => write!(f, "parent event is not part of this scan"),
            RejectReason::EchoesParent => write!(f, "event repeats its parent's type and data"),
            RejectReason::DepthExceeded { depth, limit } => {
                write!(f, "lineage depth {} exceeds limit {}", depth, limit)
            }
            RejectReason::EmptyData => write!(f, "event data is empty"),
            RejectReason::RootAlreadySeeded => write!(f, "scan already has a root event"),
            RejectReason::Closed => write!(f, "scan is no longer accepting events"),
        }
    }
}

/// Result of handing an event to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted {
        event_id: EventId,
        sequence: u64,
        /// Work items created for subscribed modules.
        dispatched: usize,
        filtered: Option<FilterReason>,
    },
    DuplicateSuppressed {
        fingerprint: Fingerprint,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, SubmitOutcome::DuplicateSuppressed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::scan::Target;

    fn target() -> Target {
        Target::new("DOMAIN", "example.com").unwrap()
    }

    #[test]
    fn test_event_type_is_normalised_when_deserialized() {
        let types: Vec<EventType> = serde_json::from_str(r#"["domain", " Ip_Address ", "*"]"#).unwrap();
        assert_eq!(
            types,
            vec![EventType::new("DOMAIN"), EventType::new("IP_ADDRESS"), EventType::wildcard()]
        );
        assert_eq!(serde_json::to_string(&types[1]).unwrap(), r#""IP_ADDRESS""#);
    }

    #[test]
    fn test_fingerprint_ignores_scores_and_parent() {
        let root = Event::root(&target());
        let a = Event::derived("SUBDOMAIN", "www.example.com", "sfp_a", &root).with_confidence(10);
        let b = Event::derived("SUBDOMAIN", "www.example.com", "sfp_a", &a).with_risk(90);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_fingerprint_includes_source_module() {
        let root = Event::root(&target());
        let a = Event::derived("SUBDOMAIN", "www.example.com", "module_a", &root);
        let b = Event::derived("SUBDOMAIN", "www.example.com", "module_b", &root);

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_field_boundaries_are_unambiguous() {
        let ab_c = Fingerprint::compute(&EventType::new("X"), "ab", "c");
        let a_bc = Fingerprint::compute(&EventType::new("X"), "a", "bc");
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn test_derived_event_freezes_lineage() {
        let root = Event::root(&target());
        let child = Event::derived("DOMAIN", "example.com", "m", &root);
        let grandchild = Event::derived("IP_ADDRESS", "93.184.216.34", "m", &child);

        assert!(root.is_root());
        assert_eq!(child.parent(), Some(root.id()));
        assert_eq!(grandchild.parent(), Some(child.id()));
        assert_eq!(grandchild.depth(), 2);
    }

    #[test]
    fn test_scores_are_clamped() {
        let root = Event::root(&target());
        let event = Event::derived("X", "y", "m", &root)
            .with_confidence(250)
            .with_visibility(101)
            .with_risk(200);

        assert_eq!(event.confidence(), SCORE_MAX);
        assert_eq!(event.visibility(), SCORE_MAX);
        assert_eq!(event.risk(), SCORE_MAX);
    }

    #[test]
    fn test_event_type_normalisation() {
        assert_eq!(EventType::new(" domain "), EventType::new("DOMAIN"));
        assert!(EventType::wildcard().is_wildcard());
        assert!(EventType::from("root").is_root());
    }
}
