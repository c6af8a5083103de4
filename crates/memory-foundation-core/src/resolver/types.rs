use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ResolverError;
use crate::audit::AuditEntry;
use crate::ids::ConflictId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictCategory {
    ValueContradiction,
    TemporalInconsistency,
    SpatialInconsistency,
    LogicalContradiction,
    SourceConflict,
    MissingRequired,
    CircularReference,
    Other,
}

/// Severity inferred for each category when the caller does not supply one.
const SEVERITY_BY_CATEGORY: [(ConflictCategory, ConflictSeverity); 8] = [
    (ConflictCategory::ValueContradiction, ConflictSeverity::Warning),
    (ConflictCategory::TemporalInconsistency, ConflictSeverity::Error),
    (ConflictCategory::SpatialInconsistency, ConflictSeverity::Error),
    (ConflictCategory::LogicalContradiction, ConflictSeverity::Critical),
    (ConflictCategory::SourceConflict, ConflictSeverity::Warning),
    (ConflictCategory::MissingRequired, ConflictSeverity::Info),
    (ConflictCategory::CircularReference, ConflictSeverity::Critical),
    (ConflictCategory::Other, ConflictSeverity::Info),
];

impl ConflictCategory {
    pub const ALL: [Self; 8] = [
        Self::ValueContradiction,
        Self::TemporalInconsistency,
        Self::SpatialInconsistency,
        Self::LogicalContradiction,
        Self::SourceConflict,
        Self::MissingRequired,
        Self::CircularReference,
        Self::Other,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValueContradiction => "VALUE_CONTRADICTION",
            Self::TemporalInconsistency => "TEMPORAL_INCONSISTENCY",
            Self::SpatialInconsistency => "SPATIAL_INCONSISTENCY",
            Self::LogicalContradiction => "LOGICAL_CONTRADICTION",
            Self::SourceConflict => "SOURCE_CONFLICT",
            Self::MissingRequired => "MISSING_REQUIRED",
            Self::CircularReference => "CIRCULAR_REFERENCE",
            Self::Other => "OTHER",
        }
    }

    #[must_use]
    pub fn default_severity(self) -> ConflictSeverity {
        SEVERITY_BY_CATEGORY
            .iter()
            .find(|(category, _)| *category == self)
            .map_or(ConflictSeverity::Info, |(_, severity)| *severity)
    }
}

impl Display for ConflictCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictCategory {
    type Err = ResolverError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| ResolverError::InvalidCategory(value.to_string()))
    }
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ConflictSeverity {
    pub const ALL: [Self; 4] = [Self::Info, Self::Warning, Self::Error, Self::Critical];

    #[must_use]
    pub fn value(self) -> u8 {
        match self {
            Self::Info => 1,
            Self::Warning => 2,
            Self::Error => 3,
            Self::Critical => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Pending,
    Reviewing,
    ResolvedByUser,
    ResolvedAuto,
    Ignored,
    Deferred,
}

impl ConflictStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Reviewing,
        Self::ResolvedByUser,
        Self::ResolvedAuto,
        Self::Ignored,
        Self::Deferred,
    ];

    /// Terminal statuses accept no further disposition.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ResolvedByUser | Self::ResolvedAuto | Self::Ignored)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictFlag {
    RequiresUserAttention,
    AutoResolvable,
    Linked,
    Recurring,
    Urgent,
}

/// Flag inferred from whether the two parties share a priority.
const FLAG_BY_EQUAL_PRIORITY: [(bool, ConflictFlag); 2] = [
    (true, ConflictFlag::RequiresUserAttention),
    (false, ConflictFlag::AutoResolvable),
];

impl ConflictFlag {
    /// Exactly one of `AUTO_RESOLVABLE` or `REQUIRES_USER_ATTENTION`.
    #[must_use]
    pub fn infer(party_a: &ConflictParty, party_b: &ConflictParty) -> Vec<Self> {
        let equal = party_a.priority == party_b.priority;
        FLAG_BY_EQUAL_PRIORITY
            .iter()
            .filter(|(when_equal, _)| *when_equal == equal)
            .map(|(_, flag)| *flag)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    KeepExisting,
    UseNew,
    Custom,
    ApplyPriority,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PartySide {
    A,
    B,
}

/// One side of a disagreement.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictParty {
    pub entity_id: String,
    pub entity_type: String,
    pub value: String,
    pub source: String,
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictMetadata {
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
    pub detected_by: String,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<PartySide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_value: Option<String>,
    pub reason: String,
    pub is_automatic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub category: ConflictCategory,
    pub severity: ConflictSeverity,
    pub status: ConflictStatus,
    pub party_a: ConflictParty,
    pub party_b: ConflictParty,
    pub description: String,
    pub flags: Vec<ConflictFlag>,
    pub metadata: ConflictMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl ConflictRecord {
    #[must_use]
    pub fn has_flag(&self, flag: ConflictFlag) -> bool {
        self.flags.contains(&flag)
    }

    #[must_use]
    pub fn party(&self, side: PartySide) -> &ConflictParty {
        match side {
            PartySide::A => &self.party_a,
            PartySide::B => &self.party_b,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectConflictInput {
    pub category: ConflictCategory,
    pub party_a: ConflictParty,
    pub party_b: ConflictParty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConflictSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_by: Option<String>,
}

impl DetectConflictInput {
    #[must_use]
    pub fn new(category: ConflictCategory, party_a: ConflictParty, party_b: ConflictParty) -> Self {
        Self { category, party_a, party_b, severity: None, description: None, detected_by: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictInput {
    pub strategy: ResolutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<PartySide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub resolved_by: String,
}

impl ResolveConflictInput {
    #[must_use]
    pub fn new(strategy: ResolutionStrategy, resolved_by: impl Into<String>) -> Self {
        Self { strategy, winner: None, custom_value: None, reason: None, resolved_by: resolved_by.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ConflictCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConflictStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<ConflictSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<ConflictFlag>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub detected_after: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictEventKind {
    Detected,
    Resolved,
    AutoResolved,
    Ignored,
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEvent {
    pub kind: ConflictEventKind,
    pub conflict: ConflictRecord,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Handle returned by `add_listener`, used to unregister it again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolverAuditAction {
    Detected,
    Resolved,
    Ignored,
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ResolverAuditDetails {
    Detected {
        category: ConflictCategory,
        severity: ConflictSeverity,
    },
    Resolved {
        strategy: ResolutionStrategy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        winner: Option<PartySide>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_value: Option<String>,
        automatic: bool,
    },
    Disposition {
        reason: String,
    },
}

pub type ResolverAuditEntry = AuditEntry<ResolverAuditAction, ResolverAuditDetails>;

/// A detection `scan` attempted but the resolver refused.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RejectedDetection {
    pub entity_type: String,
    pub entity_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub detected: Vec<ConflictRecord>,
    pub rejected: Vec<RejectedDetection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolverMetrics {
    pub total_detected: u32,
    pub total_resolved: u32,
    pub total_pending: usize,
    pub total_ignored: usize,
    pub by_category: BTreeMap<ConflictCategory, usize>,
    pub by_severity: BTreeMap<ConflictSeverity, usize>,
    pub by_status: BTreeMap<ConflictStatus, usize>,
    pub avg_resolution_time_ms: f64,
    pub auto_resolution_rate: f64,
}
