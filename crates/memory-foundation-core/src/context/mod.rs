//! Tracks which story elements are in view at the current reading position.
//!
//! Moving the position decays element weights linearly with narrative
//! distance. History is a bounded ring buffer; snapshots are capped and
//! rejected, not evicted, once the cap is reached.

mod types;

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Debug, Formatter};

use regex_lite::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use types::{
    AddElementInput, ContextAction, ContextElement, ContextMetrics, ContextScope, ContextSnapshot,
    ContextState, ElementFilter, ElementMetadata, ElementState, ElementType, HistoryEntry,
    HistoryState, TextPosition, UpdateElementInput,
};

use crate::clock::SharedClock;
use crate::hash::{digest, HashError};
use crate::ids::{ContextSnapshotId, ElementId, HistoryId, IdSequence};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ContextError {
    #[error("invalid position: {0} cannot be negative")]
    InvalidPosition(&'static str),
    #[error("invalid weight {0}: must lie in [0, 1]")]
    InvalidWeight(String),
    #[error("entity reference is required")]
    InvalidEntityRef,
    #[error("invalid entity reference pattern: {0}")]
    InvalidPattern(String),
    #[error("max elements ({max}) exceeded for scope {scope:?}")]
    MaxElementsExceeded { scope: ContextScope, max: usize },
    #[error("max snapshots ({max}) exceeded")]
    MaxSnapshotsExceeded { max: usize },
    #[error("entity {entity_ref} is already live as element {live}")]
    EntityAlreadyLive { entity_ref: String, live: ElementId },
    #[error("element {0} not found")]
    ElementNotFound(ElementId),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("no history to undo")]
    HistoryEmpty,
    #[error(transparent)]
    Encoding(#[from] HashError),
}

impl ContextError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPosition(_) => "INVALID_POSITION",
            Self::InvalidWeight(_) => "INVALID_WEIGHT",
            Self::InvalidEntityRef => "INVALID_ENTITY_REF",
            Self::InvalidPattern(_) => "INVALID_PATTERN",
            Self::MaxElementsExceeded { .. } => "MAX_ELEMENTS_EXCEEDED",
            Self::MaxSnapshotsExceeded { .. } => "MAX_SNAPSHOTS_EXCEEDED",
            Self::EntityAlreadyLive { .. } => "ENTITY_ALREADY_LIVE",
            Self::ElementNotFound(_) => "ELEMENT_NOT_FOUND",
            Self::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            Self::HistoryEmpty => "HISTORY_EMPTY",
            Self::Encoding(_) => "ENCODING_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextLimits {
    /// ACTIVE elements decaying below this weight drop to BACKGROUND.
    pub min_active_weight: f64,
    pub max_elements_per_scope: usize,
    pub max_history_depth: usize,
    pub max_snapshots: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            min_active_weight: 0.1,
            max_elements_per_scope: 100,
            max_history_depth: 1_000,
            max_snapshots: 50,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnsealedSnapshot<'a> {
    id: ContextSnapshotId,
    position: &'a TextPosition,
    elements: &'a [ContextElement],
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<&'a str>,
}

#[derive(Serialize)]
struct StateDigest<'a> {
    position: &'a TextPosition,
    elements: &'a [ContextElement],
}

pub struct ContextTracker {
    clock: SharedClock,
    limits: ContextLimits,
    position: TextPosition,
    elements: BTreeMap<ElementId, ContextElement>,
    history: VecDeque<HistoryEntry>,
    snapshots: BTreeMap<ContextSnapshotId, ContextSnapshot>,
    ids: IdSequence,
}

impl Debug for ContextTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTracker")
            .field("limits", &self.limits)
            .field("position", &self.position)
            .field("elements", &self.elements.len())
            .field("history", &self.history.len())
            .field("snapshots", &self.snapshots.len())
            .finish_non_exhaustive()
    }
}

impl ContextTracker {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self::with_limits(clock, ContextLimits::default())
    }

    #[must_use]
    pub fn with_limits(clock: SharedClock, limits: ContextLimits) -> Self {
        Self {
            clock,
            limits,
            position: TextPosition::default(),
            elements: BTreeMap::new(),
            history: VecDeque::new(),
            snapshots: BTreeMap::new(),
            ids: IdSequence::new("context"),
        }
    }

    #[must_use]
    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    #[must_use]
    pub fn get_position(&self) -> TextPosition {
        self.position
    }

    /// Move to `position`, decaying every live element by the distance
    /// travelled.
    ///
    /// # Errors
    /// Returns [`ContextError::InvalidPosition`] when any component is negative.
    pub fn move_to(&mut self, position: TextPosition) -> Result<TextPosition, ContextError> {
        if let Some(component) = position.first_negative_component() {
            return Err(ContextError::InvalidPosition(component));
        }
        let now = self.clock.now();
        let previous = std::mem::replace(&mut self.position, position);
        self.apply_decay(&previous, &position);
        self.record(
            ContextAction::Move,
            now,
            None,
            Some(HistoryState::Position(previous)),
            Some(HistoryState::Position(position)),
        );
        Ok(self.position)
    }

    /// Advance by one paragraph within the current scene.
    ///
    /// # Errors
    /// Propagates [`ContextTracker::move_to`] errors.
    pub fn advance(&mut self) -> Result<TextPosition, ContextError> {
        let next =
            TextPosition { paragraph: self.position.paragraph.saturating_add(1), ..self.position };
        self.move_to(next)
    }

    /// Add an element at the current position. A live element for the same
    /// entity is updated instead of duplicated.
    ///
    /// # Errors
    /// Returns [`ContextError::InvalidEntityRef`], [`ContextError::InvalidWeight`]
    /// or [`ContextError::MaxElementsExceeded`] when the scope is full.
    pub fn add_element(&mut self, input: AddElementInput) -> Result<ContextElement, ContextError> {
        if input.entity_ref.trim().is_empty() {
            return Err(ContextError::InvalidEntityRef);
        }
        validate_weight(input.weight)?;

        if let Some(existing) = self.live_element_for(&input.entity_ref) {
            let id = existing.id;
            return self.update_element(
                id,
                UpdateElementInput {
                    state: Some(input.state.unwrap_or(ElementState::Active)),
                    weight: input.weight,
                    scope: input.scope,
                    notes: None,
                },
            );
        }

        let scope = input.scope.unwrap_or(ContextScope::Local);
        if self.count_live_in_scope(scope) >= self.limits.max_elements_per_scope {
            return Err(ContextError::MaxElementsExceeded {
                scope,
                max: self.limits.max_elements_per_scope,
            });
        }

        let now = self.clock.now();
        let state = input.state.unwrap_or(ElementState::Active);
        let element = ContextElement {
            id: ElementId(self.ids.next(now, &input.entity_ref)),
            entity_ref: input.entity_ref,
            element_type: input.element_type,
            state,
            weight: input.weight.unwrap_or_else(|| state.default_weight()),
            scope,
            entered_at: self.position,
            exited_at: None,
            metadata: ElementMetadata {
                created_at: now,
                updated_at: now,
                role: input.role,
                notes: input.notes,
            },
        };
        self.elements.insert(element.id, element.clone());
        self.record(
            ContextAction::AddElement,
            now,
            Some(element.id),
            None,
            Some(HistoryState::Element(state)),
        );
        tracing::debug!(element_id = %element.id, entity_ref = %element.entity_ref, ?scope, "context element added");
        Ok(element)
    }

    /// Bringing an EXITED element back to life, or moving a live element to
    /// another scope, is checked against the other live elements first.
    ///
    /// # Errors
    /// Returns [`ContextError::ElementNotFound`] for an unknown id,
    /// [`ContextError::InvalidWeight`] for a weight outside `[0, 1]`,
    /// [`ContextError::EntityAlreadyLive`] when reviving an element whose
    /// entity has another live element, and
    /// [`ContextError::MaxElementsExceeded`] when the target scope is full.
    pub fn update_element(
        &mut self,
        id: ElementId,
        input: UpdateElementInput,
    ) -> Result<ContextElement, ContextError> {
        validate_weight(input.weight)?;
        let current = self.elements.get(&id).ok_or(ContextError::ElementNotFound(id))?;
        let revived = current.state == ElementState::Exited
            && input.state.is_some_and(|state| state != ElementState::Exited);
        let target_scope = input.scope.unwrap_or(current.scope);
        let stays_live = revived || current.state != ElementState::Exited;
        let joins_scope = stays_live
            && input.state != Some(ElementState::Exited)
            && (revived || target_scope != current.scope);

        if revived {
            if let Some(live) = self.live_element_for(&current.entity_ref) {
                return Err(ContextError::EntityAlreadyLive {
                    entity_ref: live.entity_ref.clone(),
                    live: live.id,
                });
            }
        }
        if joins_scope && self.count_live_in_scope(target_scope) >= self.limits.max_elements_per_scope {
            return Err(ContextError::MaxElementsExceeded {
                scope: target_scope,
                max: self.limits.max_elements_per_scope,
            });
        }

        let now = self.clock.now();
        let position = self.position;
        let element = self.elements.get_mut(&id).ok_or(ContextError::ElementNotFound(id))?;

        let before = element.state;
        element.state = input.state.unwrap_or(element.state);
        element.weight = input.weight.unwrap_or(element.weight);
        element.scope = input.scope.unwrap_or(element.scope);
        if element.state == ElementState::Exited {
            element.exited_at = Some(position);
        } else if before == ElementState::Exited {
            element.exited_at = None;
        }
        element.metadata.updated_at = now;
        if input.notes.is_some() {
            element.metadata.notes = input.notes;
        }
        let updated = element.clone();

        self.record(
            ContextAction::UpdateElement,
            now,
            Some(id),
            Some(HistoryState::Element(before)),
            Some(HistoryState::Element(updated.state)),
        );
        Ok(updated)
    }

    /// Soft remove: the element stays in the map as EXITED with weight 0.
    ///
    /// # Errors
    /// Returns [`ContextError::ElementNotFound`] for an unknown id.
    pub fn remove_element(&mut self, id: ElementId) -> Result<ContextElement, ContextError> {
        self.update_element(
            id,
            UpdateElementInput {
                state: Some(ElementState::Exited),
                weight: Some(0.0),
                ..UpdateElementInput::default()
            },
        )
    }

    /// Force an element back to ACTIVE, bypassing decay.
    ///
    /// # Errors
    /// Returns [`ContextError::ElementNotFound`], [`ContextError::InvalidWeight`],
    /// or the liveness errors of [`ContextTracker::update_element`] when an
    /// EXITED element is revived.
    pub fn reactivate(
        &mut self,
        id: ElementId,
        weight: Option<f64>,
    ) -> Result<ContextElement, ContextError> {
        self.update_element(
            id,
            UpdateElementInput {
                state: Some(ElementState::Active),
                weight: Some(weight.unwrap_or_else(|| ElementState::Active.default_weight())),
                ..UpdateElementInput::default()
            },
        )
    }

    #[must_use]
    pub fn get_element(&self, id: ElementId) -> Option<&ContextElement> {
        self.elements.get(&id)
    }

    /// The live (non-EXITED) element for an entity, if any.
    #[must_use]
    pub fn get_by_entity_ref(&self, entity_ref: &str) -> Option<&ContextElement> {
        self.live_element_for(entity_ref)
    }

    #[must_use]
    pub fn has_element(&self, id: ElementId) -> bool {
        self.elements.contains_key(&id)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.elements.len()
    }

    /// Elements matching `filter`, heaviest first (ties by id).
    ///
    /// # Errors
    /// Returns [`ContextError::InvalidPattern`] when `entity_ref_pattern` is
    /// not a valid regular expression.
    pub fn query_elements(&self, filter: &ElementFilter) -> Result<Vec<ContextElement>, ContextError> {
        let pattern = filter
            .entity_ref_pattern
            .as_deref()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| ContextError::InvalidPattern(err.to_string()))
            })
            .transpose()?;
        Ok(self.select(filter, pattern.as_ref()))
    }

    #[must_use]
    pub fn get_active_elements(&self) -> Vec<ContextElement> {
        self.select(
            &ElementFilter { state: Some(ElementState::Active), ..ElementFilter::default() },
            None,
        )
    }

    #[must_use]
    pub fn get_elements_by_scope(&self, scope: ContextScope) -> Vec<ContextElement> {
        self.select(&ElementFilter { scope: Some(scope), ..ElementFilter::default() }, None)
    }

    /// Decay every live element by the distance between two positions.
    ///
    /// Weight drops by `rate(scope) * distance`, floored at 0. An ACTIVE
    /// element falling below the minimum active weight becomes BACKGROUND, or
    /// EXITED at exactly 0; other states keep their state. Returns the number
    /// of elements whose weight or state changed.
    pub fn apply_decay(&mut self, from: &TextPosition, to: &TextPosition) -> usize {
        let distance = from.distance_to(to);
        if distance == 0 {
            return 0;
        }

        let now = self.clock.now();
        let position = self.position;
        let min_active_weight = self.limits.min_active_weight;
        let mut changed = 0;
        for element in self.elements.values_mut() {
            if element.state == ElementState::Exited {
                continue;
            }
            let weight =
                (element.weight - element.scope.decay_rate() * f64::from(distance)).max(0.0);
            let falls_out = element.state == ElementState::Active && weight < min_active_weight;
            if falls_out {
                element.state = if weight <= 0.0 {
                    element.exited_at = Some(position);
                    ElementState::Exited
                } else {
                    ElementState::Background
                };
            } else if (weight - element.weight).abs() < f64::EPSILON {
                continue;
            }
            element.weight = weight;
            element.metadata.updated_at = now;
            changed += 1;
        }

        self.record(ContextAction::Decay, now, None, None, None);
        tracing::debug!(distance, changed, "context decay applied");
        changed
    }

    /// Capture the current position and every element.
    ///
    /// # Errors
    /// Returns [`ContextError::MaxSnapshotsExceeded`] once the cap is reached.
    pub fn create_snapshot(&mut self, label: Option<String>) -> Result<ContextSnapshot, ContextError> {
        if self.snapshots.len() >= self.limits.max_snapshots {
            return Err(ContextError::MaxSnapshotsExceeded { max: self.limits.max_snapshots });
        }

        let now = self.clock.now();
        let elements: Vec<ContextElement> = self.elements.values().cloned().collect();
        let id = ContextSnapshotId(self.ids.next(now, "snapshot"));
        let hash = digest(&UnsealedSnapshot {
            id,
            position: &self.position,
            elements: &elements,
            timestamp: now,
            label: label.as_deref(),
        })?;
        let snapshot = ContextSnapshot { id, position: self.position, elements, timestamp: now, label, hash };
        self.snapshots.insert(id, snapshot.clone());
        self.record(ContextAction::Snapshot, now, None, None, Some(HistoryState::Snapshot(id)));
        tracing::debug!(snapshot_id = %id, elements = snapshot.elements.len(), "context snapshot created");
        Ok(snapshot)
    }

    /// Replace the live elements and position with a snapshot's.
    ///
    /// # Errors
    /// Returns [`ContextError::SnapshotNotFound`] for an unknown id.
    pub fn rollback_to(&mut self, id: ContextSnapshotId) -> Result<ContextState, ContextError> {
        let snapshot = self
            .snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| ContextError::SnapshotNotFound(id.to_string()))?;

        let now = self.clock.now();
        self.position = snapshot.position;
        self.elements = snapshot.elements.into_iter().map(|element| (element.id, element)).collect();
        self.record(ContextAction::Rollback, now, None, Some(HistoryState::Snapshot(id)), None);
        tracing::debug!(snapshot_id = %id, "context rolled back");
        self.get_state()
    }

    /// Roll back to the most recent snapshot. This does not step back through
    /// individual history entries.
    ///
    /// # Errors
    /// Returns [`ContextError::HistoryEmpty`] when nothing has happened yet and
    /// [`ContextError::SnapshotNotFound`] when no snapshot exists.
    pub fn undo(&mut self) -> Result<ContextState, ContextError> {
        if self.history.is_empty() {
            return Err(ContextError::HistoryEmpty);
        }
        let latest = self
            .snapshots
            .values()
            .max_by(|left, right| left.timestamp.cmp(&right.timestamp).then(left.id.cmp(&right.id)))
            .map(|snapshot| snapshot.id)
            .ok_or_else(|| ContextError::SnapshotNotFound("no snapshots available for undo".to_string()))?;
        self.rollback_to(latest)
    }

    #[must_use]
    pub fn get_snapshot(&self, id: ContextSnapshotId) -> Option<&ContextSnapshot> {
        self.snapshots.get(&id)
    }

    /// Snapshots, newest first.
    #[must_use]
    pub fn list_snapshots(&self) -> Vec<&ContextSnapshot> {
        let mut snapshots: Vec<&ContextSnapshot> = self.snapshots.values().collect();
        snapshots.sort_by(|left, right| right.timestamp.cmp(&left.timestamp).then(right.id.cmp(&left.id)));
        snapshots
    }

    /// # Errors
    /// Returns [`ContextError::Encoding`] when the state cannot be hashed.
    pub fn get_state(&self) -> Result<ContextState, ContextError> {
        let elements: Vec<ContextElement> = self.elements.values().cloned().collect();
        let hash = digest(&StateDigest { position: &self.position, elements: &elements })?;
        Ok(ContextState { position: self.position, elements, timestamp: self.clock.now(), hash })
    }

    /// The most recent `limit` history entries, oldest first.
    #[must_use]
    pub fn get_history(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        let skip = limit.map_or(0, |limit| self.history.len().saturating_sub(limit));
        self.history.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn get_metrics(&self) -> ContextMetrics {
        let mut metrics = ContextMetrics {
            current_position: self.position,
            elements_by_state: ElementState::ALL.into_iter().map(|state| (state, 0)).collect(),
            elements_by_type: ElementType::ALL.into_iter().map(|kind| (kind, 0)).collect(),
            elements_by_scope: ContextScope::ALL.into_iter().map(|scope| (scope, 0)).collect(),
            history_size: self.history.len(),
            snapshot_count: self.snapshots.len(),
            avg_active_weight: 0.0,
        };

        let mut active_weight = 0.0;
        let mut active_count = 0_u32;
        for element in self.elements.values() {
            *metrics.elements_by_state.entry(element.state).or_insert(0) += 1;
            *metrics.elements_by_type.entry(element.element_type).or_insert(0) += 1;
            *metrics.elements_by_scope.entry(element.scope).or_insert(0) += 1;
            if element.state == ElementState::Active {
                active_weight += element.weight;
                active_count += 1;
            }
        }
        if active_count > 0 {
            metrics.avg_active_weight = active_weight / f64::from(active_count);
        }
        metrics
    }

    pub fn clear(&mut self) {
        self.position = TextPosition::default();
        self.elements.clear();
        self.history.clear();
        self.snapshots.clear();
    }

    fn select(&self, filter: &ElementFilter, pattern: Option<&Regex>) -> Vec<ContextElement> {
        let mut results: Vec<&ContextElement> = self
            .elements
            .values()
            .filter(|element| matches_filter(element, filter, pattern))
            .collect();
        results.sort_by(|left, right| {
            right.weight.total_cmp(&left.weight).then(left.id.cmp(&right.id))
        });
        let limit = filter.limit.unwrap_or(usize::MAX);
        results.into_iter().take(limit).cloned().collect()
    }

    fn live_element_for(&self, entity_ref: &str) -> Option<&ContextElement> {
        self.elements
            .values()
            .find(|element| element.entity_ref == entity_ref && element.state != ElementState::Exited)
    }

    fn count_live_in_scope(&self, scope: ContextScope) -> usize {
        self.elements
            .values()
            .filter(|element| element.scope == scope && element.state != ElementState::Exited)
            .count()
    }

    fn record(
        &mut self,
        action: ContextAction,
        timestamp: OffsetDateTime,
        element_id: Option<ElementId>,
        state_before: Option<HistoryState>,
        state_after: Option<HistoryState>,
    ) {
        while self.history.len() >= self.limits.max_history_depth.max(1) {
            self.history.pop_front();
        }
        let id = HistoryId(self.ids.next(timestamp, "history"));
        self.history.push_back(HistoryEntry {
            id,
            position: self.position,
            action,
            element_id,
            state_before,
            state_after,
            timestamp,
        });
    }
}

fn matches_filter(element: &ContextElement, filter: &ElementFilter, pattern: Option<&Regex>) -> bool {
    !(filter.element_type.is_some_and(|kind| kind != element.element_type)
        || filter.state.is_some_and(|state| state != element.state)
        || filter.scope.is_some_and(|scope| scope != element.scope)
        || filter.min_weight.is_some_and(|min| element.weight < min)
        || pattern.is_some_and(|regex| !regex.is_match(&element.entity_ref)))
}

fn validate_weight(weight: Option<f64>) -> Result<(), ContextError> {
    match weight {
        Some(weight) if !(0.0..=1.0).contains(&weight) => {
            Err(ContextError::InvalidWeight(weight.to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests;
