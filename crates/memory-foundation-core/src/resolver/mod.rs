//! Ledger of disagreements between sourced values.
//!
//! A detected conflict is never dropped: every detection is audited and
//! broadcast to listeners, and leaves the ledger only through an explicit
//! resolution, ignore or defer.

mod types;

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use types::{
    ConflictCategory, ConflictEvent, ConflictEventKind, ConflictFilter, ConflictFlag,
    ConflictMetadata, ConflictParty, ConflictRecord, ConflictResolution, ConflictSeverity,
    ConflictStatus, DetectConflictInput, ListenerId, PartySide, RejectedDetection,
    ResolutionStrategy, ResolveConflictInput, ResolverAuditAction, ResolverAuditDetails,
    ResolverAuditEntry, ResolverMetrics, ScanOutcome,
};

use crate::audit::{AuditChain, IntegrityReport};
use crate::clock::SharedClock;
use crate::hash::HashError;
use crate::ids::{ConflictId, IdSequence};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ResolverError {
    #[error("invalid conflict category: {0}")]
    InvalidCategory(String),
    #[error("party {0:?} is missing an entity id")]
    InvalidParty(PartySide),
    #[error("max pending conflicts ({max}) exceeded")]
    MaxPendingConflictsExceeded { max: usize },
    #[error("conflict {0} not found")]
    ConflictNotFound(ConflictId),
    #[error("conflict {id} is already {status:?}")]
    AlreadyResolved { id: ConflictId, status: ConflictStatus },
    #[error("conflict {0} is not flagged auto-resolvable")]
    CannotAutoResolve(ConflictId),
    #[error("conflict {0} has equal priorities and needs a user decision")]
    RequiresUserInput(ConflictId),
    #[error("CUSTOM resolution requires a custom value")]
    CustomValueRequired,
    #[error(transparent)]
    Encoding(#[from] HashError),
}

impl ResolverError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCategory(_) => "INVALID_CATEGORY",
            Self::InvalidParty(_) => "INVALID_PARTY",
            Self::MaxPendingConflictsExceeded { .. } => "MAX_PENDING_CONFLICTS_EXCEEDED",
            Self::ConflictNotFound(_) => "CONFLICT_NOT_FOUND",
            Self::AlreadyResolved { .. } => "CONFLICT_ALREADY_RESOLVED",
            Self::CannotAutoResolve(_) => "CANNOT_AUTO_RESOLVE",
            Self::RequiresUserInput(_) => "REQUIRES_USER_INPUT",
            Self::CustomValueRequired => "CUSTOM_VALUE_REQUIRED",
            Self::Encoding(_) => "ENCODING_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolverLimits {
    pub max_pending_conflicts: usize,
    /// Oldest audit entries are evicted past this size.
    pub max_audit_entries: usize,
}

impl Default for ResolverLimits {
    fn default() -> Self {
        Self { max_pending_conflicts: 1_000, max_audit_entries: 10_000 }
    }
}

type Listener = Box<dyn Fn(&ConflictEvent) + Send + Sync>;

pub struct ConflictResolver {
    clock: SharedClock,
    limits: ResolverLimits,
    conflicts: BTreeMap<ConflictId, ConflictRecord>,
    audit: AuditChain<ResolverAuditAction, ResolverAuditDetails>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    total_detected: u32,
    total_resolved: u32,
    auto_resolutions: u32,
    resolution_times_ms: Vec<f64>,
    ids: IdSequence,
}

impl Debug for ConflictResolver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("limits", &self.limits)
            .field("conflicts", &self.conflicts.len())
            .field("audit", &self.audit.len())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self::with_limits(clock, ResolverLimits::default())
    }

    #[must_use]
    pub fn with_limits(clock: SharedClock, limits: ResolverLimits) -> Self {
        Self {
            clock,
            limits,
            conflicts: BTreeMap::new(),
            audit: AuditChain::new(Some(limits.max_audit_entries)),
            listeners: Vec::new(),
            next_listener: 0,
            total_detected: 0,
            total_resolved: 0,
            auto_resolutions: 0,
            resolution_times_ms: Vec::new(),
            ids: IdSequence::new("resolver"),
        }
    }

    #[must_use]
    pub fn limits(&self) -> &ResolverLimits {
        &self.limits
    }

    /// Record a new PENDING conflict between two parties.
    ///
    /// Severity defaults from the category; flags are inferred from the
    /// parties' priorities. The detection is audited and broadcast.
    ///
    /// # Errors
    /// Returns [`ResolverError::InvalidParty`] when a party has no entity id and
    /// [`ResolverError::MaxPendingConflictsExceeded`] once the pending cap is hit.
    pub fn detect(&mut self, input: DetectConflictInput) -> Result<ConflictRecord, ResolverError> {
        if input.party_a.entity_id.trim().is_empty() {
            return Err(ResolverError::InvalidParty(PartySide::A));
        }
        if input.party_b.entity_id.trim().is_empty() {
            return Err(ResolverError::InvalidParty(PartySide::B));
        }
        if self.count_by_status(ConflictStatus::Pending) >= self.limits.max_pending_conflicts {
            return Err(ResolverError::MaxPendingConflictsExceeded {
                max: self.limits.max_pending_conflicts,
            });
        }

        let now = self.clock.now();
        let severity = input.severity.unwrap_or_else(|| input.category.default_severity());
        let flags = ConflictFlag::infer(&input.party_a, &input.party_b);
        let description = input.description.unwrap_or_else(|| {
            format!(
                "{}: {}:{} has conflicting values \"{}\" vs \"{}\"",
                input.category,
                input.party_a.entity_type,
                input.party_a.entity_id,
                input.party_a.value,
                input.party_b.value
            )
        });
        let discriminator = format!("{}:{}", input.party_a.entity_id, input.party_b.entity_id);
        let conflict = ConflictRecord {
            id: ConflictId(self.ids.next(now, &discriminator)),
            category: input.category,
            severity,
            status: ConflictStatus::Pending,
            party_a: input.party_a,
            party_b: input.party_b,
            description,
            flags,
            metadata: ConflictMetadata {
                detected_at: now,
                detected_by: input.detected_by.unwrap_or_else(|| "system".to_string()),
                resolved_at: None,
                resolved_by: None,
                notes: None,
            },
            resolution: None,
        };

        self.audit.append(
            now,
            ResolverAuditAction::Detected,
            &conflict.id.to_string(),
            &conflict.metadata.detected_by,
            Some(ResolverAuditDetails::Detected { category: conflict.category, severity }),
        )?;
        self.conflicts.insert(conflict.id, conflict.clone());
        self.total_detected = self.total_detected.saturating_add(1);
        tracing::warn!(
            conflict_id = %conflict.id,
            category = %conflict.category,
            ?severity,
            "conflict detected"
        );
        self.notify(ConflictEventKind::Detected, &conflict, now);
        Ok(conflict)
    }

    /// Compare every pair of parties describing the same `(entityType,
    /// entityId)` and detect a conflict for each pair whose values differ.
    /// Equal priorities yield `SOURCE_CONFLICT`, differing ones
    /// `VALUE_CONTRADICTION`. Refused detections are reported, not dropped.
    pub fn scan(&mut self, parties: &[ConflictParty]) -> ScanOutcome {
        let mut groups: BTreeMap<(&str, &str), Vec<&ConflictParty>> = BTreeMap::new();
        for party in parties {
            groups
                .entry((party.entity_type.as_str(), party.entity_id.as_str()))
                .or_default()
                .push(party);
        }

        let mut outcome = ScanOutcome::default();
        for group in groups.values() {
            for (index, party_a) in group.iter().enumerate() {
                for party_b in &group[index + 1..] {
                    if party_a.value == party_b.value {
                        continue;
                    }
                    let category = if party_a.priority == party_b.priority {
                        ConflictCategory::SourceConflict
                    } else {
                        ConflictCategory::ValueContradiction
                    };
                    let input =
                        DetectConflictInput::new(category, (*party_a).clone(), (*party_b).clone());
                    match self.detect(input) {
                        Ok(conflict) => outcome.detected.push(conflict),
                        Err(err) => {
                            tracing::warn!(
                                entity_type = %party_a.entity_type,
                                entity_id = %party_a.entity_id,
                                code = err.code(),
                                "scan detection rejected"
                            );
                            outcome.rejected.push(RejectedDetection {
                                entity_type: party_a.entity_type.clone(),
                                entity_id: party_a.entity_id.clone(),
                                code: err.code().to_string(),
                                message: err.to_string(),
                            });
                        }
                    }
                }
            }
        }
        outcome
    }

    /// Resolve a conflict on a user's behalf.
    ///
    /// The final value follows the strategy: `KEEP_EXISTING` takes party A,
    /// `USE_NEW` party B, `CUSTOM` the supplied value and `APPLY_PRIORITY` the
    /// higher-priority party (A on ties). The winner defaults accordingly.
    ///
    /// # Errors
    /// Returns [`ResolverError::ConflictNotFound`],
    /// [`ResolverError::AlreadyResolved`] for terminal conflicts, or
    /// [`ResolverError::CustomValueRequired`].
    pub fn resolve(
        &mut self,
        id: ConflictId,
        input: ResolveConflictInput,
    ) -> Result<ConflictRecord, ResolverError> {
        let conflict = self.open_conflict(id)?;

        let priority_side = if conflict.party_a.priority >= conflict.party_b.priority {
            PartySide::A
        } else {
            PartySide::B
        };
        let (final_value, inferred_winner) = match input.strategy {
            ResolutionStrategy::KeepExisting => (conflict.party_a.value.clone(), Some(PartySide::A)),
            ResolutionStrategy::UseNew => (conflict.party_b.value.clone(), Some(PartySide::B)),
            ResolutionStrategy::Custom => {
                (input.custom_value.clone().ok_or(ResolverError::CustomValueRequired)?, None)
            }
            ResolutionStrategy::ApplyPriority => {
                (conflict.party(priority_side).value.clone(), Some(priority_side))
            }
        };
        let resolution = ConflictResolution {
            strategy: input.strategy,
            winner: input.winner.or(inferred_winner),
            final_value: Some(final_value),
            reason: input.reason.unwrap_or_else(|| format!("Resolved by {}", input.resolved_by)),
            is_automatic: false,
        };

        self.settle(id, resolution, ConflictStatus::ResolvedByUser, &input.resolved_by)
    }

    /// Resolve automatically in favour of the higher-priority party.
    ///
    /// # Errors
    /// Returns [`ResolverError::CannotAutoResolve`] when the conflict is not
    /// flagged `AUTO_RESOLVABLE` and [`ResolverError::RequiresUserInput`] when
    /// the priorities are in fact equal.
    pub fn try_auto_resolve(&mut self, id: ConflictId) -> Result<ConflictRecord, ResolverError> {
        let conflict = self.open_conflict(id)?;
        if !conflict.has_flag(ConflictFlag::AutoResolvable) {
            return Err(ResolverError::CannotAutoResolve(id));
        }
        if conflict.party_a.priority == conflict.party_b.priority {
            return Err(ResolverError::RequiresUserInput(id));
        }

        let winner = if conflict.party_a.priority > conflict.party_b.priority {
            PartySide::A
        } else {
            PartySide::B
        };
        let winning = conflict.party(winner);
        let resolution = ConflictResolution {
            strategy: ResolutionStrategy::ApplyPriority,
            winner: Some(winner),
            final_value: Some(winning.value.clone()),
            reason: format!("Auto-resolved by priority ({} has higher priority)", winning.source),
            is_automatic: true,
        };

        self.settle(id, resolution, ConflictStatus::ResolvedAuto, "system")
    }

    /// Close a conflict without resolving it. IGNORED is terminal.
    ///
    /// # Errors
    /// Returns [`ResolverError::ConflictNotFound`] or
    /// [`ResolverError::AlreadyResolved`].
    pub fn ignore(
        &mut self,
        id: ConflictId,
        reason: &str,
        ignored_by: &str,
    ) -> Result<ConflictRecord, ResolverError> {
        self.open_conflict(id)?;
        let now = self.clock.now();
        self.audit.append(
            now,
            ResolverAuditAction::Ignored,
            &id.to_string(),
            ignored_by,
            Some(ResolverAuditDetails::Disposition { reason: reason.to_string() }),
        )?;

        let conflict = self.conflicts.get_mut(&id).ok_or(ResolverError::ConflictNotFound(id))?;
        conflict.status = ConflictStatus::Ignored;
        conflict.metadata.resolved_at = Some(now);
        conflict.metadata.resolved_by = Some(ignored_by.to_string());
        conflict.metadata.notes = Some(reason.to_string());
        let ignored = conflict.clone();

        tracing::debug!(conflict_id = %id, actor = ignored_by, "conflict ignored");
        self.notify(ConflictEventKind::Ignored, &ignored, now);
        Ok(ignored)
    }

    /// Postpone a decision. A deferred conflict can still be resolved,
    /// ignored or deferred again.
    ///
    /// # Errors
    /// Returns [`ResolverError::ConflictNotFound`] or
    /// [`ResolverError::AlreadyResolved`].
    pub fn defer(
        &mut self,
        id: ConflictId,
        reason: &str,
        deferred_by: &str,
    ) -> Result<ConflictRecord, ResolverError> {
        self.open_conflict(id)?;
        let now = self.clock.now();
        self.audit.append(
            now,
            ResolverAuditAction::Deferred,
            &id.to_string(),
            deferred_by,
            Some(ResolverAuditDetails::Disposition { reason: reason.to_string() }),
        )?;

        let conflict = self.conflicts.get_mut(&id).ok_or(ResolverError::ConflictNotFound(id))?;
        conflict.status = ConflictStatus::Deferred;
        conflict.metadata.notes = Some(reason.to_string());
        let deferred = conflict.clone();

        tracing::debug!(conflict_id = %id, actor = deferred_by, "conflict deferred");
        self.notify(ConflictEventKind::Deferred, &deferred, now);
        Ok(deferred)
    }

    #[must_use]
    pub fn get_conflict(&self, id: ConflictId) -> Option<&ConflictRecord> {
        self.conflicts.get(&id)
    }

    /// Conflicts matching `filter`, most severe first, then most recently
    /// detected.
    #[must_use]
    pub fn query_conflicts(&self, filter: &ConflictFilter) -> Vec<ConflictRecord> {
        let mut results: Vec<&ConflictRecord> =
            self.conflicts.values().filter(|conflict| matches_filter(conflict, filter)).collect();
        results.sort_by(|left, right| {
            right
                .severity
                .cmp(&left.severity)
                .then(right.metadata.detected_at.cmp(&left.metadata.detected_at))
                .then(right.id.cmp(&left.id))
        });
        let limit = filter.limit.unwrap_or(usize::MAX);
        results.into_iter().take(limit).cloned().collect()
    }

    #[must_use]
    pub fn get_pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.query_conflicts(&ConflictFilter {
            status: Some(ConflictStatus::Pending),
            ..ConflictFilter::default()
        })
    }

    #[must_use]
    pub fn get_requiring_user_attention(&self) -> Vec<ConflictRecord> {
        self.query_conflicts(&ConflictFilter {
            flag: Some(ConflictFlag::RequiresUserAttention),
            ..ConflictFilter::default()
        })
    }

    #[must_use]
    pub fn count_by_status(&self, status: ConflictStatus) -> usize {
        self.conflicts.values().filter(|conflict| conflict.status == status).count()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.conflicts.len()
    }

    /// Audit entries, oldest first, optionally for a single conflict.
    #[must_use]
    pub fn get_audit_trail(&self, conflict_id: Option<ConflictId>) -> Vec<ResolverAuditEntry> {
        match conflict_id {
            Some(id) => self.audit.for_subject(&id.to_string()).into_iter().cloned().collect(),
            None => self.audit.iter().cloned().collect(),
        }
    }

    /// Check that every conflict has a DETECTED audit entry and that the hash
    /// chain recomputes. Conflicts whose entries were evicted from a capped
    /// trail are skipped.
    #[must_use]
    pub fn verify_audit_integrity(&self) -> IntegrityReport {
        let mut errors = Vec::new();
        for conflict in self.conflicts.values() {
            let subject = conflict.id.to_string();
            if self.audit.was_evicted(&subject) {
                continue;
            }
            if self.audit.for_subject(&subject).is_empty() {
                errors.push(format!("no audit entries for conflict {subject}"));
            }
            if !self.audit.has_action(&subject, ResolverAuditAction::Detected) {
                errors.push(format!("missing DETECTED entry for conflict {subject}"));
            }
        }

        let report = IntegrityReport::from_errors(errors).merge(self.audit.verify());
        if !report.valid {
            tracing::warn!(errors = report.errors.len(), "resolver audit integrity check failed");
        }
        report
    }

    #[must_use]
    pub fn get_metrics(&self) -> ResolverMetrics {
        let mut metrics = ResolverMetrics {
            total_detected: self.total_detected,
            total_resolved: self.total_resolved,
            total_pending: 0,
            total_ignored: 0,
            by_category: ConflictCategory::ALL.into_iter().map(|category| (category, 0)).collect(),
            by_severity: ConflictSeverity::ALL.into_iter().map(|severity| (severity, 0)).collect(),
            by_status: ConflictStatus::ALL.into_iter().map(|status| (status, 0)).collect(),
            avg_resolution_time_ms: 0.0,
            auto_resolution_rate: 0.0,
        };

        for conflict in self.conflicts.values() {
            *metrics.by_category.entry(conflict.category).or_insert(0) += 1;
            *metrics.by_severity.entry(conflict.severity).or_insert(0) += 1;
            *metrics.by_status.entry(conflict.status).or_insert(0) += 1;
        }
        metrics.total_pending = metrics.by_status.get(&ConflictStatus::Pending).copied().unwrap_or(0);
        metrics.total_ignored = metrics.by_status.get(&ConflictStatus::Ignored).copied().unwrap_or(0);

        let samples = u32::try_from(self.resolution_times_ms.len()).unwrap_or(u32::MAX);
        if samples > 0 {
            metrics.avg_resolution_time_ms =
                self.resolution_times_ms.iter().sum::<f64>() / f64::from(samples);
        }
        if self.total_resolved > 0 {
            metrics.auto_resolution_rate =
                f64::from(self.auto_resolutions) / f64::from(self.total_resolved);
        }
        metrics
    }

    /// Register a callback invoked after every detection and disposition.
    /// A panicking listener is logged and skipped.
    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&ConflictEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener = self.next_listener.saturating_add(1);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns whether a listener was registered under `id`.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(registered, _)| *registered != id);
        self.listeners.len() != before
    }

    /// Drop every conflict, audit entry, listener and counter.
    pub fn clear(&mut self) {
        self.conflicts.clear();
        self.audit.clear();
        self.listeners.clear();
        self.total_detected = 0;
        self.total_resolved = 0;
        self.auto_resolutions = 0;
        self.resolution_times_ms.clear();
    }

    fn open_conflict(&self, id: ConflictId) -> Result<&ConflictRecord, ResolverError> {
        let conflict = self.conflicts.get(&id).ok_or(ResolverError::ConflictNotFound(id))?;
        if conflict.status.is_terminal() {
            return Err(ResolverError::AlreadyResolved { id, status: conflict.status });
        }
        Ok(conflict)
    }

    fn settle(
        &mut self,
        id: ConflictId,
        resolution: ConflictResolution,
        status: ConflictStatus,
        actor: &str,
    ) -> Result<ConflictRecord, ResolverError> {
        let now = self.clock.now();
        self.audit.append(
            now,
            ResolverAuditAction::Resolved,
            &id.to_string(),
            actor,
            Some(ResolverAuditDetails::Resolved {
                strategy: resolution.strategy,
                winner: resolution.winner,
                final_value: resolution.final_value.clone(),
                automatic: resolution.is_automatic,
            }),
        )?;

        let conflict = self.conflicts.get_mut(&id).ok_or(ResolverError::ConflictNotFound(id))?;
        let automatic = resolution.is_automatic;
        conflict.status = status;
        conflict.resolution = Some(resolution);
        conflict.metadata.resolved_at = Some(now);
        conflict.metadata.resolved_by = Some(actor.to_string());
        let resolved = conflict.clone();

        self.total_resolved = self.total_resolved.saturating_add(1);
        if automatic {
            self.auto_resolutions = self.auto_resolutions.saturating_add(1);
        }
        let elapsed = now - resolved.metadata.detected_at;
        self.resolution_times_ms.push(elapsed.as_seconds_f64() * 1_000.0);

        tracing::debug!(conflict_id = %id, ?status, actor, "conflict resolved");
        let kind = if automatic { ConflictEventKind::AutoResolved } else { ConflictEventKind::Resolved };
        self.notify(kind, &resolved, now);
        Ok(resolved)
    }

    fn notify(&self, kind: ConflictEventKind, conflict: &ConflictRecord, timestamp: OffsetDateTime) {
        if self.listeners.is_empty() {
            return;
        }
        let event = ConflictEvent { kind, conflict: conflict.clone(), timestamp };
        for (id, listener) in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(listener = id.0, conflict_id = %conflict.id, "conflict listener panicked");
            }
        }
    }
}

fn matches_filter(conflict: &ConflictRecord, filter: &ConflictFilter) -> bool {
    !(filter.category.is_some_and(|category| category != conflict.category)
        || filter.status.is_some_and(|status| status != conflict.status)
        || filter.min_severity.is_some_and(|min| conflict.severity < min)
        || filter.entity_id.as_ref().is_some_and(|entity_id| {
            *entity_id != conflict.party_a.entity_id && *entity_id != conflict.party_b.entity_id
        })
        || filter.flag.is_some_and(|flag| !conflict.has_flag(flag))
        || filter.detected_after.is_some_and(|after| conflict.metadata.detected_at <= after))
}
