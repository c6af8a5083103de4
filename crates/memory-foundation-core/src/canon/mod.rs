//! The canon: authoritative, versioned facts about the story world.
//!
//! Facts are never physically removed. Competing statements for the same
//! `(subject, predicate)` key are settled by source priority; two sources of
//! equal priority that disagree open a conflict that only a caller can close.

mod types;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};

use regex_lite::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use types::{
    export_hash, CanonAuditAction, CanonAuditDetails, CanonAuditEntry, CanonDiff, CanonExport,
    CanonMetrics, CanonSnapshot, Confidence, ConflictChoice, CreateFactInput, Fact, FactConflict,
    FactConflictCategory, FactConflictResolution, FactFilter, FactMetadata, FactSource, FactStatus,
    FactType, UpdateFactInput,
};

use crate::audit::{AuditChain, IntegrityReport};
use crate::clock::SharedClock;
use crate::hash::{merkle_root, HashError, GENESIS_HASH};
use crate::ids::{CanonSnapshotId, FactConflictId, FactId, IdSequence};

pub const CANON_MAGIC: &str = "OMEGA_CANON_V1";
pub const CANON_VERSION: &str = "1.0.0";

const DEFAULT_ACTOR: &str = "system";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CanonError {
    #[error("subject is required")]
    InvalidSubject,
    #[error("subject exceeds {max} characters")]
    SubjectTooLong { max: usize },
    #[error("predicate is required")]
    InvalidPredicate,
    #[error("predicate exceeds {max} characters")]
    PredicateTooLong { max: usize },
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("value exceeds {max} characters")]
    ValueTooLong { max: usize },
    #[error("unknown fact type {0}")]
    InvalidType(String),
    #[error("unknown fact source {0}")]
    InvalidSource(String),
    #[error("invalid subject pattern: {0}")]
    InvalidPattern(String),
    #[error("maximum facts ({max}) exceeded")]
    MaxFactsExceeded { max: usize },
    #[error("maximum versions ({max}) exceeded")]
    MaxVersionsExceeded { max: u32 },
    #[error("no fact found for {subject}:{predicate}")]
    FactNotFound { subject: String, predicate: String },
    #[error("fact {0} is deleted")]
    FactDeleted(FactId),
    #[error("conflict {conflict_id} detected for {subject}:{predicate}")]
    ConflictUnresolved { conflict_id: FactConflictId, subject: String, predicate: String },
    #[error("conflict {0} not found")]
    ConflictNotFound(FactConflictId),
    #[error("conflict {0} is already resolved")]
    ConflictAlreadyResolved(FactConflictId),
    #[error("export hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("invalid snapshot: {0}")]
    SnapshotInvalid(String),
    #[error(transparent)]
    Encoding(#[from] HashError),
}

impl CanonError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSubject => "INVALID_SUBJECT",
            Self::SubjectTooLong { .. } => "SUBJECT_TOO_LONG",
            Self::InvalidPredicate => "INVALID_PREDICATE",
            Self::PredicateTooLong { .. } => "PREDICATE_TOO_LONG",
            Self::InvalidValue(_) => "INVALID_VALUE",
            Self::ValueTooLong { .. } => "VALUE_TOO_LONG",
            Self::InvalidType(_) => "INVALID_TYPE",
            Self::InvalidSource(_) => "INVALID_SOURCE",
            Self::InvalidPattern(_) => "INVALID_PATTERN",
            Self::MaxFactsExceeded { .. } => "MAX_FACTS_EXCEEDED",
            Self::MaxVersionsExceeded { .. } => "MAX_VERSIONS_EXCEEDED",
            Self::FactNotFound { .. } => "FACT_NOT_FOUND",
            Self::FactDeleted(_) => "FACT_DELETED",
            Self::ConflictUnresolved { .. } => "CONFLICT_UNRESOLVED",
            Self::ConflictNotFound(_) => "CONFLICT_NOT_FOUND",
            Self::ConflictAlreadyResolved(_) => "CONFLICT_ALREADY_RESOLVED",
            Self::HashMismatch { .. } => "HASH_MISMATCH",
            Self::SnapshotInvalid(_) => "SNAPSHOT_INVALID",
            Self::Encoding(_) => "ENCODING_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CanonLimits {
    pub max_subject_length: usize,
    pub max_predicate_length: usize,
    pub max_value_length: usize,
    pub max_total_facts: usize,
    pub max_versions_per_fact: u32,
}

impl Default for CanonLimits {
    fn default() -> Self {
        Self {
            max_subject_length: 256,
            max_predicate_length: 128,
            max_value_length: 10_000,
            max_total_facts: 100_000,
            max_versions_per_fact: 1_000,
        }
    }
}

/// Versioned fact store with a fact hash chain and a separate audit chain.
///
/// Storage is an arena of facts plus id-list indices by subject and by
/// `(subject, predicate)`. Indices are appended to and never pruned, so
/// archived and deleted history stays queryable.
pub struct CanonStore {
    clock: SharedClock,
    limits: CanonLimits,
    facts: Vec<Fact>,
    by_id: HashMap<FactId, usize>,
    by_subject: BTreeMap<String, Vec<usize>>,
    by_key: HashMap<(String, String), Vec<usize>>,
    conflicts: BTreeMap<FactConflictId, FactConflict>,
    audit: AuditChain<CanonAuditAction, CanonAuditDetails>,
    last_hash: String,
    ids: IdSequence,
}

impl Debug for CanonStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanonStore")
            .field("limits", &self.limits)
            .field("facts", &self.facts.len())
            .field("conflicts", &self.conflicts.len())
            .field("audit_entries", &self.audit.len())
            .field("last_hash", &self.last_hash)
            .finish_non_exhaustive()
    }
}

impl CanonStore {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self::with_limits(clock, CanonLimits::default())
    }

    #[must_use]
    pub fn with_limits(clock: SharedClock, limits: CanonLimits) -> Self {
        Self {
            clock,
            limits,
            facts: Vec::new(),
            by_id: HashMap::new(),
            by_subject: BTreeMap::new(),
            by_key: HashMap::new(),
            conflicts: BTreeMap::new(),
            audit: AuditChain::new(None),
            last_hash: GENESIS_HASH.to_string(),
            ids: IdSequence::new("canon"),
        }
    }

    #[must_use]
    pub fn limits(&self) -> &CanonLimits {
        &self.limits
    }

    /// Hash of the most recently stored fact, or [`GENESIS_HASH`].
    #[must_use]
    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    /// Add a fact, settling any collision with the active fact for its key by
    /// source priority.
    ///
    /// Returns the fact that is authoritative afterwards: the new fact, or the
    /// existing one when the incoming source ranks lower (the incoming fact is
    /// still stored, as ARCHIVED) or repeats the same value.
    ///
    /// # Errors
    /// Returns a validation or limit error when the input is rejected, and
    /// [`CanonError::ConflictUnresolved`] when a source of equal priority
    /// disagrees with the active fact. In that case the active fact is marked
    /// CONFLICTED and a pending [`FactConflict`] is recorded.
    pub fn add(&mut self, input: CreateFactInput) -> Result<Fact, CanonError> {
        self.validate_input(&input)?;
        let now = self.clock.now();

        let Some(existing_index) = self.active_index(&input.subject, &input.predicate) else {
            return self.create_fact(input, now);
        };
        let existing = self.facts[existing_index].clone();

        match input.source.priority().cmp(&existing.source.priority()) {
            std::cmp::Ordering::Greater => {
                self.replace_with_higher_priority(existing_index, input, now)
            }
            std::cmp::Ordering::Equal if existing.value == input.value => Ok(existing),
            std::cmp::Ordering::Equal => Err(self.open_conflict(existing_index, input, now)),
            std::cmp::Ordering::Less => self.archive_as_lower_priority(&existing, input, now),
        }
    }

    /// Replace the active fact for a key with a new version.
    ///
    /// # Errors
    /// Returns [`CanonError::FactNotFound`] when no fact is active for the key,
    /// [`CanonError::FactDeleted`] when the key's latest fact was deleted, and
    /// [`CanonError::ValueTooLong`] or [`CanonError::MaxVersionsExceeded`]
    /// before anything is mutated.
    pub fn update(
        &mut self,
        subject: &str,
        predicate: &str,
        input: UpdateFactInput,
    ) -> Result<Fact, CanonError> {
        let existing_index = self.require_active(subject, predicate)?;
        let existing = self.facts[existing_index].clone();

        if input.value.chars().count() > self.limits.max_value_length {
            return Err(CanonError::ValueTooLong { max: self.limits.max_value_length });
        }
        let version = self.next_version(existing.version)?;

        let now = self.clock.now();
        let actor = input.updated_by.clone().unwrap_or_else(|| DEFAULT_ACTOR.to_string());
        let source = input.source.unwrap_or(existing.source);
        self.archive_in_place(existing_index, now, &actor)?;

        let mut fact = Fact {
            id: FactId(self.ids.next(now, &format!("{subject}:{predicate}"))),
            fact_type: existing.fact_type,
            subject: existing.subject.clone(),
            predicate: existing.predicate.clone(),
            value: input.value.clone(),
            source,
            status: FactStatus::Active,
            confidence: input.confidence.unwrap_or_else(|| source.default_confidence()),
            version,
            previous_hash: self.last_hash.clone(),
            hash: String::new(),
            metadata: FactMetadata {
                created_at: existing.metadata.created_at,
                updated_at: now,
                created_by: existing.metadata.created_by.clone(),
                source_ref: existing.metadata.source_ref.clone(),
                source_position: existing.metadata.source_position.clone(),
                tags: existing.metadata.tags.clone(),
                notes: input.reason.clone().or_else(|| existing.metadata.notes.clone()),
            },
        };
        fact.hash = fact.compute_hash()?;
        self.store_fact(fact.clone());
        self.audit.append(
            now,
            CanonAuditAction::Update,
            &fact.id.to_string(),
            &actor,
            Some(CanonAuditDetails::Update {
                previous_id: existing.id,
                previous_value: existing.value,
                new_value: input.value,
                reason: input.reason,
            }),
        )?;
        tracing::debug!(fact_id = %fact.id, subject, predicate, version, "canon fact updated");
        Ok(fact)
    }

    /// Soft delete: the active fact keeps its id, hash and version and flips
    /// to DELETED.
    ///
    /// # Errors
    /// Returns [`CanonError::FactNotFound`] or [`CanonError::FactDeleted`] when
    /// there is no active fact for the key.
    pub fn delete(
        &mut self,
        subject: &str,
        predicate: &str,
        deleted_by: &str,
        reason: Option<String>,
    ) -> Result<Fact, CanonError> {
        let index = self.require_active(subject, predicate)?;
        let now = self.clock.now();

        let fact = &mut self.facts[index];
        fact.status = FactStatus::Deleted;
        fact.metadata.updated_at = now;
        if reason.is_some() {
            fact.metadata.notes.clone_from(&reason);
        }
        let deleted = fact.clone();

        self.audit.append(
            now,
            CanonAuditAction::Delete,
            &deleted.id.to_string(),
            deleted_by,
            Some(CanonAuditDetails::Delete { reason }),
        )?;
        tracing::debug!(fact_id = %deleted.id, subject, predicate, "canon fact deleted");
        Ok(deleted)
    }

    /// Facts matching `filter`, sorted by subject, predicate, then version
    /// descending, with offset/limit applied last.
    ///
    /// # Errors
    /// Returns [`CanonError::InvalidPattern`] when `subject_pattern` is not a
    /// valid regular expression.
    pub fn query(&self, filter: &FactFilter) -> Result<Vec<Fact>, CanonError> {
        let pattern = filter
            .subject_pattern
            .as_deref()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| CanonError::InvalidPattern(err.to_string()))
            })
            .transpose()?;

        let mut results: Vec<&Fact> = match &filter.subject {
            Some(subject) => self
                .by_subject
                .get(subject)
                .map(|indices| indices.iter().map(|index| &self.facts[*index]).collect())
                .unwrap_or_default(),
            None => self.facts.iter().collect(),
        };
        results.retain(|fact| matches_filter(fact, filter, pattern.as_ref()));
        results.sort_by(|left, right| {
            left.subject
                .cmp(&right.subject)
                .then_with(|| left.predicate.cmp(&right.predicate))
                .then_with(|| right.version.cmp(&left.version))
        });

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(results.into_iter().skip(offset).take(limit).cloned().collect())
    }

    /// The ACTIVE fact with the highest source priority for the key.
    #[must_use]
    pub fn get_fact(&self, subject: &str, predicate: &str) -> Option<&Fact> {
        self.active_index(subject, predicate).map(|index| &self.facts[index])
    }

    #[must_use]
    pub fn get_fact_by_id(&self, id: FactId) -> Option<&Fact> {
        self.by_id.get(&id).map(|index| &self.facts[*index])
    }

    #[must_use]
    pub fn has(&self, subject: &str, predicate: &str) -> bool {
        self.active_index(subject, predicate).is_some()
    }

    /// Number of facts, optionally restricted to a filter.
    ///
    /// # Errors
    /// Returns [`CanonError::InvalidPattern`] for an invalid subject pattern.
    pub fn count(&self, filter: Option<&FactFilter>) -> Result<usize, CanonError> {
        match filter {
            Some(filter) => Ok(self.query(filter)?.len()),
            None => Ok(self.facts.len()),
        }
    }

    /// ACTIVE facts of one subject.
    #[must_use]
    pub fn get_subject_facts(&self, subject: &str) -> Vec<Fact> {
        let mut facts: Vec<Fact> = self
            .by_subject
            .get(subject)
            .into_iter()
            .flatten()
            .map(|index| &self.facts[*index])
            .filter(|fact| fact.status == FactStatus::Active)
            .cloned()
            .collect();
        facts.sort_by(|left, right| {
            left.predicate.cmp(&right.predicate).then_with(|| right.version.cmp(&left.version))
        });
        facts
    }

    /// Point-in-time fingerprint of the ACTIVE facts.
    #[must_use]
    pub fn create_snapshot(&mut self) -> CanonSnapshot {
        let now = self.clock.now();
        let active_hashes = self.active_hashes();
        let root_hash = merkle_root(&active_hashes);
        let snapshot = CanonSnapshot {
            id: CanonSnapshotId(self.ids.next(now, &root_hash)),
            timestamp: now,
            root_hash,
            fact_count: active_hashes.len(),
            last_fact_hash: self.last_hash.clone(),
            version: CANON_VERSION.to_string(),
        };
        tracing::debug!(snapshot_id = %snapshot.id, facts = snapshot.fact_count, "canon snapshot created");
        snapshot
    }

    /// Bucket every fact relative to `from`. Each fact lands in exactly one of
    /// `added`, `modified`, `archived`, `deleted`, or is counted as unchanged.
    #[must_use]
    pub fn diff(&mut self, from: &CanonSnapshot) -> CanonDiff {
        let to = self.create_snapshot();
        let mut diff = CanonDiff {
            from: from.clone(),
            to,
            added: Vec::new(),
            modified: Vec::new(),
            archived: Vec::new(),
            deleted: Vec::new(),
            unchanged: 0,
        };

        for fact in &self.facts {
            let created_after = fact.metadata.created_at > from.timestamp;
            let updated_after = fact.metadata.updated_at > from.timestamp;
            match fact.status {
                FactStatus::Active if created_after && fact.version == 1 => {
                    diff.added.push(fact.clone());
                }
                FactStatus::Active | FactStatus::Conflicted if updated_after => {
                    diff.modified.push(fact.clone());
                }
                FactStatus::Archived if updated_after => diff.archived.push(fact.clone()),
                FactStatus::Deleted if updated_after => diff.deleted.push(fact.clone()),
                _ => diff.unchanged += 1,
            }
        }
        diff
    }

    /// Conflicts still waiting for a decision, oldest first.
    #[must_use]
    pub fn get_pending_conflicts(&self) -> Vec<&FactConflict> {
        self.conflicts
            .values()
            .filter(|conflict| conflict.resolution == FactConflictResolution::Pending)
            .collect()
    }

    #[must_use]
    pub fn get_conflict(&self, id: FactConflictId) -> Option<&FactConflict> {
        self.conflicts.get(&id)
    }

    /// Close a pending conflict with the user's choice.
    ///
    /// `Existing` restores the conflicted fact to ACTIVE. `Incoming` archives
    /// it and commits the incoming input as the next ACTIVE version.
    ///
    /// # Errors
    /// Returns [`CanonError::ConflictNotFound`] for an unknown id,
    /// [`CanonError::ConflictAlreadyResolved`] for a closed conflict and
    /// [`CanonError::MaxVersionsExceeded`] when the incoming version would
    /// exceed the cap.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: FactConflictId,
        choice: ConflictChoice,
        resolved_by: &str,
    ) -> Result<Fact, CanonError> {
        let conflict = self
            .conflicts
            .get(&conflict_id)
            .cloned()
            .ok_or(CanonError::ConflictNotFound(conflict_id))?;
        if conflict.resolution != FactConflictResolution::Pending {
            return Err(CanonError::ConflictAlreadyResolved(conflict_id));
        }
        let existing_index = self
            .by_id
            .get(&conflict.existing_fact.id)
            .copied()
            .ok_or_else(|| CanonError::SnapshotInvalid(format!(
                "conflicted fact {} is missing from the store",
                conflict.existing_fact.id
            )))?;

        let version = match choice {
            ConflictChoice::Existing => self.facts[existing_index].version,
            ConflictChoice::Incoming => self.next_version(self.facts[existing_index].version)?,
        };

        let now = self.clock.now();
        if let Some(competing) =
            self.active_index(&conflict.incoming.subject, &conflict.incoming.predicate)
        {
            self.archive_in_place(competing, now, resolved_by)?;
        }

        let winner = match choice {
            ConflictChoice::Existing => {
                let fact = &mut self.facts[existing_index];
                fact.status = FactStatus::Active;
                fact.metadata.updated_at = now;
                let restored = fact.clone();
                self.audit.append(
                    now,
                    CanonAuditAction::ResolveConflict,
                    &restored.id.to_string(),
                    resolved_by,
                    Some(CanonAuditDetails::ResolveConflict { conflict_id, choice }),
                )?;
                restored
            }
            ConflictChoice::Incoming => {
                self.archive_in_place(existing_index, now, resolved_by)?;
                let existing = self.facts[existing_index].clone();
                let input = conflict.incoming.clone();
                let mut fact = self.draft_fact(&input, FactStatus::Active, version, now);
                fact.metadata.created_at = existing.metadata.created_at;
                fact.metadata.created_by = resolved_by.to_string();
                fact.metadata.notes =
                    Some(format!("Resolved by user choice (conflict {conflict_id})"));
                fact.hash = fact.compute_hash()?;
                self.store_fact(fact.clone());
                self.audit.append(
                    now,
                    CanonAuditAction::ResolveConflict,
                    &fact.id.to_string(),
                    resolved_by,
                    Some(CanonAuditDetails::ResolveConflict { conflict_id, choice }),
                )?;
                fact
            }
        };

        if let Some(stored) = self.conflicts.get_mut(&conflict_id) {
            stored.resolution = FactConflictResolution::UserChoice;
            stored.winning_fact_id = Some(winner.id);
            stored.resolved_at = Some(winner.metadata.updated_at);
            stored.resolved_by = Some(resolved_by.to_string());
        }
        tracing::debug!(%conflict_id, choice = choice.as_str(), winner = %winner.id, "canon conflict resolved");
        Ok(winner)
    }

    #[must_use]
    pub fn get_metrics(&self) -> CanonMetrics {
        let mut metrics = CanonMetrics {
            total_facts: self.facts.len(),
            active_facts: 0,
            archived_facts: 0,
            deleted_facts: 0,
            conflicted_facts: 0,
            by_type: FactType::ALL.into_iter().map(|kind| (kind, 0)).collect(),
            by_source: FactSource::ALL.into_iter().map(|source| (source, 0)).collect(),
            current_root_hash: merkle_root(&self.active_hashes()),
            last_modified: None,
        };

        for fact in &self.facts {
            *metrics.by_type.entry(fact.fact_type).or_insert(0) += 1;
            *metrics.by_source.entry(fact.source).or_insert(0) += 1;
            match fact.status {
                FactStatus::Active => metrics.active_facts += 1,
                FactStatus::Archived => metrics.archived_facts += 1,
                FactStatus::Deleted => metrics.deleted_facts += 1,
                FactStatus::Conflicted => metrics.conflicted_facts += 1,
            }
            metrics.last_modified = match metrics.last_modified {
                Some(last) if last >= fact.metadata.updated_at => Some(last),
                _ => Some(fact.metadata.updated_at),
            };
        }
        metrics
    }

    /// Audit entries, optionally only those about one fact.
    #[must_use]
    pub fn get_audit_trail(&self, fact_id: Option<FactId>) -> Vec<CanonAuditEntry> {
        match fact_id {
            Some(id) => self.audit.for_subject(&id.to_string()).into_iter().cloned().collect(),
            None => self.audit.iter().cloned().collect(),
        }
    }

    /// Recompute every fact's hash. Breaks in the `previousHash` chain are not
    /// reported: supersession legitimately branches it.
    #[must_use]
    pub fn verify_integrity(&self) -> IntegrityReport {
        let errors: Vec<String> = self
            .facts
            .iter()
            .filter(|fact| !fact.verify_hash())
            .map(|fact| format!("hash mismatch for fact {}", fact.id))
            .collect();
        if !errors.is_empty() {
            tracing::warn!(failures = errors.len(), "canon integrity check failed");
        }
        IntegrityReport::from_errors(errors)
    }

    #[must_use]
    pub fn verify_audit_chain(&self) -> IntegrityReport {
        let report = self.audit.verify();
        if !report.valid {
            tracing::warn!(failures = report.errors.len(), "canon audit chain check failed");
        }
        report
    }

    /// Self-verifying dump of every fact, conflict and audit entry.
    ///
    /// # Errors
    /// Returns [`CanonError::Encoding`] when the payload cannot be hashed.
    pub fn export(&mut self) -> Result<CanonExport, CanonError> {
        let exported_at = self.clock.now();
        let snapshot = self.create_snapshot();
        let audit_trail: Vec<CanonAuditEntry> = self.audit.iter().cloned().collect();
        let conflicts: Vec<FactConflict> = self.conflicts.values().cloned().collect();
        let export_hash = export_hash(&self.facts, &conflicts, &audit_trail, &snapshot.root_hash)?;
        Ok(CanonExport {
            magic: CANON_MAGIC.to_string(),
            version: CANON_VERSION.to_string(),
            exported_at,
            snapshot,
            facts: self.facts.clone(),
            conflicts,
            audit_trail,
            export_hash,
        })
    }

    /// Rebuild a store from an export envelope.
    ///
    /// The magic string and the export hash are checked before any state is
    /// built. Indices are rebuilt from the fact list; the fact chain head is
    /// the last fact's hash and the audit chain head the last entry's hash.
    ///
    /// # Errors
    /// Returns [`CanonError::SnapshotInvalid`] on a magic mismatch and
    /// [`CanonError::HashMismatch`] when the recomputed export hash differs.
    pub fn import(
        clock: SharedClock,
        limits: CanonLimits,
        data: CanonExport,
    ) -> Result<Self, CanonError> {
        if data.magic != CANON_MAGIC {
            return Err(CanonError::SnapshotInvalid(format!("invalid magic {}", data.magic)));
        }
        let computed =
            export_hash(&data.facts, &data.conflicts, &data.audit_trail, &data.snapshot.root_hash)?;
        if computed != data.export_hash {
            tracing::warn!(expected = %data.export_hash, %computed, "canon import rejected");
            return Err(CanonError::HashMismatch { expected: data.export_hash, computed });
        }

        let mut store = Self::with_limits(clock, limits);
        let fact_count = data.facts.len();
        for fact in data.facts {
            store.store_fact(fact);
        }
        store.conflicts =
            data.conflicts.into_iter().map(|conflict| (conflict.id, conflict)).collect();
        store.audit.restore(data.audit_trail);
        store.ids = IdSequence::resume(
            "canon",
            &format!("{}:{}", store.last_hash, store.audit.head()),
            u64::try_from(fact_count).unwrap_or(u64::MAX),
        );
        tracing::debug!(facts = fact_count, audit_entries = store.audit.len(), "canon imported");
        Ok(store)
    }

    /// Reset to an empty store at genesis.
    pub fn clear(&mut self) {
        self.facts.clear();
        self.by_id.clear();
        self.by_subject.clear();
        self.by_key.clear();
        self.conflicts.clear();
        self.audit.clear();
        self.last_hash = GENESIS_HASH.to_string();
        self.ids = IdSequence::new("canon");
    }

    fn validate_input(&self, input: &CreateFactInput) -> Result<(), CanonError> {
        let limits = &self.limits;
        if input.subject.is_empty() {
            return Err(CanonError::InvalidSubject);
        }
        if input.subject.chars().count() > limits.max_subject_length {
            return Err(CanonError::SubjectTooLong { max: limits.max_subject_length });
        }
        if input.predicate.is_empty() {
            return Err(CanonError::InvalidPredicate);
        }
        if input.predicate.chars().count() > limits.max_predicate_length {
            return Err(CanonError::PredicateTooLong { max: limits.max_predicate_length });
        }
        if input.value.chars().count() > limits.max_value_length {
            return Err(CanonError::ValueTooLong { max: limits.max_value_length });
        }
        if self.facts.len() >= limits.max_total_facts {
            return Err(CanonError::MaxFactsExceeded { max: limits.max_total_facts });
        }
        Ok(())
    }

    fn next_version(&self, current: u32) -> Result<u32, CanonError> {
        let next = current.saturating_add(1);
        if next > self.limits.max_versions_per_fact {
            return Err(CanonError::MaxVersionsExceeded { max: self.limits.max_versions_per_fact });
        }
        Ok(next)
    }

    fn key_indices(&self, subject: &str, predicate: &str) -> &[usize] {
        self.by_key
            .get(&(subject.to_string(), predicate.to_string()))
            .map_or(&[], Vec::as_slice)
    }

    fn active_index(&self, subject: &str, predicate: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        for index in self.key_indices(subject, predicate) {
            let fact = &self.facts[*index];
            if fact.status != FactStatus::Active {
                continue;
            }
            let better = match best {
                Some(current) => fact.source.priority() > self.facts[current].source.priority(),
                None => true,
            };
            if better {
                best = Some(*index);
            }
        }
        best
    }

    fn require_active(&self, subject: &str, predicate: &str) -> Result<usize, CanonError> {
        if let Some(index) = self.active_index(subject, predicate) {
            return Ok(index);
        }
        let latest = self.key_indices(subject, predicate).last().map(|index| &self.facts[*index]);
        match latest {
            Some(fact) if fact.status == FactStatus::Deleted => Err(CanonError::FactDeleted(fact.id)),
            _ => Err(CanonError::FactNotFound {
                subject: subject.to_string(),
                predicate: predicate.to_string(),
            }),
        }
    }

    fn active_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .facts
            .iter()
            .filter(|fact| fact.status == FactStatus::Active)
            .map(|fact| fact.hash.clone())
            .collect();
        hashes.sort();
        hashes
    }

    fn draft_fact(
        &mut self,
        input: &CreateFactInput,
        status: FactStatus,
        version: u32,
        now: OffsetDateTime,
    ) -> Fact {
        Fact {
            id: FactId(self.ids.next(now, &format!("{}:{}", input.subject, input.predicate))),
            fact_type: input.fact_type,
            subject: input.subject.clone(),
            predicate: input.predicate.clone(),
            value: input.value.clone(),
            source: input.source,
            status,
            confidence: input.confidence.unwrap_or_else(|| input.source.default_confidence()),
            version,
            previous_hash: self.last_hash.clone(),
            hash: String::new(),
            metadata: FactMetadata {
                created_at: now,
                updated_at: now,
                created_by: input.created_by.clone().unwrap_or_else(|| DEFAULT_ACTOR.to_string()),
                source_ref: input.source_ref.clone(),
                source_position: input.source_position.clone(),
                tags: input.tags.clone(),
                notes: input.notes.clone(),
            },
        }
    }

    fn store_fact(&mut self, fact: Fact) -> usize {
        let index = self.facts.len();
        self.last_hash.clone_from(&fact.hash);
        self.by_id.insert(fact.id, index);
        self.by_subject.entry(fact.subject.clone()).or_default().push(index);
        self.by_key.entry((fact.subject.clone(), fact.predicate.clone())).or_default().push(index);
        self.facts.push(fact);
        index
    }

    fn archive_in_place(
        &mut self,
        index: usize,
        now: OffsetDateTime,
        actor: &str,
    ) -> Result<(), CanonError> {
        let fact = &mut self.facts[index];
        fact.status = FactStatus::Archived;
        fact.metadata.updated_at = now;
        let id = fact.id;
        self.audit.append(now, CanonAuditAction::Archive, &id.to_string(), actor, None)?;
        Ok(())
    }

    fn create_fact(&mut self, input: CreateFactInput, now: OffsetDateTime) -> Result<Fact, CanonError> {
        let mut fact = self.draft_fact(&input, FactStatus::Active, 1, now);
        fact.hash = fact.compute_hash()?;
        self.store_fact(fact.clone());
        self.audit.append(
            now,
            CanonAuditAction::Create,
            &fact.id.to_string(),
            &fact.metadata.created_by,
            None,
        )?;
        tracing::debug!(fact_id = %fact.id, subject = %fact.subject, predicate = %fact.predicate, "canon fact created");
        Ok(fact)
    }

    fn replace_with_higher_priority(
        &mut self,
        existing_index: usize,
        input: CreateFactInput,
        now: OffsetDateTime,
    ) -> Result<Fact, CanonError> {
        let version = self.next_version(self.facts[existing_index].version)?;
        let actor = input.created_by.clone().unwrap_or_else(|| DEFAULT_ACTOR.to_string());
        self.archive_in_place(existing_index, now, &actor)?;

        let existing_id = self.facts[existing_index].id;
        let mut fact = self.draft_fact(&input, FactStatus::Active, version, now);
        fact.metadata.created_at = self.facts[existing_index].metadata.created_at;
        fact.hash = fact.compute_hash()?;
        self.store_fact(fact.clone());
        self.audit.append(
            now,
            CanonAuditAction::Update,
            &fact.id.to_string(),
            &actor,
            Some(CanonAuditDetails::Supersede {
                previous_id: existing_id,
                reason: "higher priority source".to_string(),
                resolution: FactConflictResolution::AutoPriority,
            }),
        )?;
        tracing::debug!(fact_id = %fact.id, previous_id = %existing_id, version, "canon fact superseded by higher priority source");
        Ok(fact)
    }

    fn archive_as_lower_priority(
        &mut self,
        existing: &Fact,
        input: CreateFactInput,
        now: OffsetDateTime,
    ) -> Result<Fact, CanonError> {
        // Never counts against the version cap: the active fact is unchanged.
        let version = existing.version.saturating_add(1);
        let mut fact = self.draft_fact(&input, FactStatus::Archived, version, now);
        fact.metadata.notes = Some("Archived: lower priority source".to_string());
        fact.hash = fact.compute_hash()?;
        self.store_fact(fact.clone());
        self.audit.append(
            now,
            CanonAuditAction::Archive,
            &fact.id.to_string(),
            &fact.metadata.created_by,
            None,
        )?;
        tracing::debug!(fact_id = %fact.id, kept = %existing.id, "lower priority fact stored as archived");
        Ok(existing.clone())
    }

    fn open_conflict(
        &mut self,
        existing_index: usize,
        input: CreateFactInput,
        now: OffsetDateTime,
    ) -> CanonError {
        let existing = &mut self.facts[existing_index];
        existing.status = FactStatus::Conflicted;
        existing.metadata.updated_at = now;
        let existing = existing.clone();

        let conflict_id =
            FactConflictId(self.ids.next(now, &format!("conflict:{}", existing.id)));
        let subject = input.subject.clone();
        let predicate = input.predicate.clone();
        self.conflicts.insert(
            conflict_id,
            FactConflict {
                id: conflict_id,
                category: FactConflictCategory::ValueMismatch,
                existing_fact: existing,
                incoming: input,
                resolution: FactConflictResolution::Pending,
                winning_fact_id: None,
                detected_at: now,
                resolved_at: None,
                resolved_by: None,
            },
        );
        tracing::warn!(%conflict_id, %subject, %predicate, "canon conflict detected");
        CanonError::ConflictUnresolved { conflict_id, subject, predicate }
    }
}

fn matches_filter(fact: &Fact, filter: &FactFilter, pattern: Option<&Regex>) -> bool {
    if filter.fact_type.is_some_and(|kind| kind != fact.fact_type) {
        return false;
    }
    if filter.subject.as_ref().is_some_and(|subject| *subject != fact.subject) {
        return false;
    }
    if pattern.is_some_and(|regex| !regex.is_match(&fact.subject)) {
        return false;
    }
    if filter.predicate.as_ref().is_some_and(|predicate| *predicate != fact.predicate) {
        return false;
    }
    if filter.source.is_some_and(|source| source != fact.source) {
        return false;
    }
    if filter.status.is_some_and(|status| status != fact.status) {
        return false;
    }
    if filter.created_after.is_some_and(|after| fact.metadata.created_at <= after) {
        return false;
    }
    if filter.created_before.is_some_and(|before| fact.metadata.created_at >= before) {
        return false;
    }
    if let Some(wanted) = filter.tags.as_ref().filter(|tags| !tags.is_empty()) {
        let tags = fact.metadata.tags.as_deref().unwrap_or_default();
        if !wanted.iter().any(|tag| tags.contains(tag)) {
            return false;
        }
    }
    true
}
