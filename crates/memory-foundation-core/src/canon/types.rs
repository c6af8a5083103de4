use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::CanonError;
use crate::audit::AuditEntry;
use crate::hash::{digest, HashError};
use crate::ids::{CanonSnapshotId, FactConflictId, FactId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactType {
    Character,
    Location,
    Object,
    Event,
    Relation,
    WorldRule,
    Temporal,
    Meta,
}

impl FactType {
    pub const ALL: [Self; 8] = [
        Self::Character,
        Self::Location,
        Self::Object,
        Self::Event,
        Self::Relation,
        Self::WorldRule,
        Self::Temporal,
        Self::Meta,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "CHARACTER",
            Self::Location => "LOCATION",
            Self::Object => "OBJECT",
            Self::Event => "EVENT",
            Self::Relation => "RELATION",
            Self::WorldRule => "WORLD_RULE",
            Self::Temporal => "TEMPORAL",
            Self::Meta => "META",
        }
    }
}

impl FromStr for FactType {
    type Err = CanonError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| CanonError::InvalidType(value.to_string()))
    }
}

/// Where a fact came from. Higher priority sources override lower ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactSource {
    User,
    Text,
    Imported,
    Inferred,
}

impl FactSource {
    pub const ALL: [Self; 4] = [Self::User, Self::Text, Self::Imported, Self::Inferred];

    #[must_use]
    pub fn priority(self) -> u32 {
        match self {
            Self::User => 1000,
            Self::Text => 100,
            Self::Imported => 10,
            Self::Inferred => 1,
        }
    }

    #[must_use]
    pub fn default_confidence(self) -> Confidence {
        match self {
            Self::User => Confidence::Absolute,
            Self::Text => Confidence::High,
            Self::Imported => Confidence::Medium,
            Self::Inferred => Confidence::Low,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Text => "TEXT",
            Self::Imported => "IMPORTED",
            Self::Inferred => "INFERRED",
        }
    }
}

impl FromStr for FactSource {
    type Err = CanonError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| CanonError::InvalidSource(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactStatus {
    Active,
    Archived,
    Deleted,
    Conflicted,
}

impl FactStatus {
    pub const ALL: [Self; 4] = [Self::Active, Self::Archived, Self::Deleted, Self::Conflicted];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Archived => "ARCHIVED",
            Self::Deleted => "DELETED",
            Self::Conflicted => "CONFLICTED",
        }
    }
}

impl FromStr for FactStatus {
    type Err = CanonError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| CanonError::InvalidValue(format!("unknown fact status {value}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Absolute,
    High,
    Medium,
    Low,
    Speculative,
}

impl Confidence {
    pub const ALL: [Self; 5] =
        [Self::Absolute, Self::High, Self::Medium, Self::Low, Self::Speculative];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absolute => "ABSOLUTE",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Speculative => "SPECULATIVE",
        }
    }
}

impl FromStr for Confidence {
    type Err = CanonError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| CanonError::InvalidValue(format!("unknown confidence {value}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FactMetadata {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One version of a subject/predicate/value statement.
///
/// `hash` seals the fact's content when it is created. Lifecycle fields
/// (`status`, `metadata.updatedAt`, `metadata.notes`) change in place on
/// archive, delete and conflict handling and are not covered by it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    pub id: FactId,
    #[serde(rename = "type")]
    pub fact_type: FactType,
    pub subject: String,
    pub predicate: String,
    pub value: String,
    pub source: FactSource,
    pub status: FactStatus,
    pub confidence: Confidence,
    pub version: u32,
    pub previous_hash: String,
    pub hash: String,
    pub metadata: FactMetadata,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SealedFact<'a> {
    id: FactId,
    #[serde(rename = "type")]
    fact_type: FactType,
    subject: &'a str,
    predicate: &'a str,
    value: &'a str,
    source: FactSource,
    confidence: Confidence,
    version: u32,
    previous_hash: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    created_by: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_ref: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_position: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a [String]>,
}

impl Fact {
    /// Digest of the fact's sealed content.
    ///
    /// # Errors
    /// Returns [`HashError::Encoding`] when the fact cannot be canonically encoded.
    pub fn compute_hash(&self) -> Result<String, HashError> {
        digest(&SealedFact {
            id: self.id,
            fact_type: self.fact_type,
            subject: &self.subject,
            predicate: &self.predicate,
            value: &self.value,
            source: self.source,
            confidence: self.confidence,
            version: self.version,
            previous_hash: &self.previous_hash,
            created_at: self.metadata.created_at,
            created_by: &self.metadata.created_by,
            source_ref: self.metadata.source_ref.as_deref(),
            source_position: self.metadata.source_position.as_deref(),
            tags: self.metadata.tags.as_deref(),
        })
    }

    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.compute_hash().is_ok_and(|computed| computed == self.hash)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateFactInput {
    #[serde(rename = "type")]
    pub fact_type: FactType,
    pub subject: String,
    pub predicate: String,
    pub value: String,
    pub source: FactSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl CreateFactInput {
    #[must_use]
    pub fn new(
        fact_type: FactType,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        value: impl Into<String>,
        source: FactSource,
    ) -> Self {
        Self {
            fact_type,
            subject: subject.into(),
            predicate: predicate.into(),
            value: value.into(),
            source,
            confidence: None,
            created_by: None,
            source_ref: None,
            source_position: None,
            tags: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFactInput {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FactSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactConflictCategory {
    ValueMismatch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactConflictResolution {
    Pending,
    AutoPriority,
    UserChoice,
    Coexist,
}

/// Which side of a pending canon conflict the user keeps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    Existing,
    Incoming,
}

impl ConflictChoice {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Existing => "existing",
            Self::Incoming => "incoming",
        }
    }
}

impl FromStr for ConflictChoice {
    type Err = CanonError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [Self::Existing, Self::Incoming]
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| CanonError::InvalidValue(format!("unknown conflict choice {value}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FactConflict {
    pub id: FactConflictId,
    pub category: FactConflictCategory,
    pub existing_fact: Fact,
    pub incoming: CreateFactInput,
    pub resolution: FactConflictResolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_fact_id: Option<FactId>,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonSnapshot {
    pub id: CanonSnapshotId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub root_hash: String,
    pub fact_count: usize,
    pub last_fact_hash: String,
    pub version: String,
}

/// Every fact of the store, bucketed relative to an earlier snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonDiff {
    pub from: CanonSnapshot,
    pub to: CanonSnapshot,
    pub added: Vec<Fact>,
    pub modified: Vec<Fact>,
    pub archived: Vec<Fact>,
    pub deleted: Vec<Fact>,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FactFilter {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub fact_type: Option<FactType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FactSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FactStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub created_after: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub created_before: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonMetrics {
    pub total_facts: usize,
    pub active_facts: usize,
    pub archived_facts: usize,
    pub deleted_facts: usize,
    pub conflicted_facts: usize,
    pub by_type: BTreeMap<FactType, usize>,
    pub by_source: BTreeMap<FactSource, usize>,
    pub current_root_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub last_modified: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonAuditAction {
    Create,
    Update,
    Delete,
    Archive,
    ResolveConflict,
}

/// Typed payload attached to canon audit entries.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum CanonAuditDetails {
    /// Explicit `update` of the active fact.
    Update {
        previous_id: FactId,
        previous_value: String,
        new_value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A higher priority source replaced the active fact.
    Supersede { previous_id: FactId, reason: String, resolution: FactConflictResolution },
    Delete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ResolveConflict { conflict_id: FactConflictId, choice: ConflictChoice },
}

pub type CanonAuditEntry = AuditEntry<CanonAuditAction, CanonAuditDetails>;

/// Self-verifying dump of a canon store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonExport {
    pub magic: String,
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
    pub snapshot: CanonSnapshot,
    pub facts: Vec<Fact>,
    /// Every conflict the store has seen, pending or settled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<FactConflict>,
    pub audit_trail: Vec<CanonAuditEntry>,
    pub export_hash: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportDigest<'a> {
    facts: &'a [Fact],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    conflicts: &'a [FactConflict],
    audit_trail: &'a [CanonAuditEntry],
    root_hash: &'a str,
}

/// `sha256(canonical({facts, conflicts, auditTrail, rootHash}))`, with
/// `conflicts` omitted when empty.
///
/// # Errors
/// Returns [`HashError::Encoding`] when the payload cannot be canonically encoded.
pub fn export_hash(
    facts: &[Fact],
    conflicts: &[FactConflict],
    audit_trail: &[CanonAuditEntry],
    root_hash: &str,
) -> Result<String, HashError> {
    digest(&ExportDigest { facts, conflicts, audit_trail, root_hash })
}
