//! Intent lock: every mutation a caller plans is declared as an intent and
//! walked through an explicit state machine, with at most one intent
//! executing at a time.

mod types;

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

pub use types::{
    CreateIntentInput, Intent, IntentAction, IntentEvent, IntentFailureCode, IntentMetadata,
    IntentMetrics, IntentPriority, IntentState, IntentTransition, IntentType, QueuedIntent,
};

use crate::audit::IntegrityReport;
use crate::clock::SharedClock;
use crate::hash::{canonical_json, HashError};
use crate::ids::{IdSequence, IntentId};
use crate::resolver::ListenerId;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IntentError {
    #[error("invalid intent type: {0}")]
    InvalidType(String),
    #[error("invalid intent priority: {0}")]
    InvalidPriority(String),
    #[error("invalid intent payload: {0}")]
    InvalidPayload(String),
    #[error("payload is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("intent queue is full ({max})")]
    QueueFull { max: usize },
    #[error("intent {0} not found")]
    IntentNotFound(IntentId),
    #[error("cannot {action} intent {id} while {from}")]
    InvalidTransition { id: IntentId, from: IntentState, action: IntentAction },
    #[error("intent {id} already retried {max} times")]
    MaxRetriesExceeded { id: IntentId, max: u32 },
    #[error("intent {current} is already executing")]
    AlreadyExecuting { current: IntentId },
    #[error(transparent)]
    Encoding(#[from] HashError),
}

impl IntentError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidType(_) => "INVALID_TYPE",
            Self::InvalidPriority(_) => "INVALID_PRIORITY",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::IntentNotFound(_) => "INTENT_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::MaxRetriesExceeded { .. } => "MAX_RETRIES_EXCEEDED",
            Self::AlreadyExecuting { .. } => "ALREADY_EXECUTING",
            Self::Encoding(_) => "ENCODING_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct IntentLimits {
    /// Cap on intents waiting in PENDING or LOCKED.
    pub max_queue_size: usize,
    pub max_retries: u32,
    /// Measured on the canonical JSON encoding of the payload.
    pub max_payload_bytes: usize,
    pub execution_timeout_ms: u64,
}

impl Default for IntentLimits {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_retries: 3,
            max_payload_bytes: 65_536,
            execution_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueSlot {
    id: IntentId,
    position: u64,
    priority_score: u32,
    added_at: OffsetDateTime,
}

type Listener = Box<dyn Fn(&IntentEvent) + Send + Sync>;

pub struct IntentLock {
    clock: SharedClock,
    limits: IntentLimits,
    intents: BTreeMap<IntentId, Intent>,
    history: BTreeMap<IntentId, Vec<IntentTransition>>,
    queue: Vec<QueueSlot>,
    next_position: u64,
    current: Option<IntentId>,
    started_at: BTreeMap<IntentId, OffsetDateTime>,
    execution_times_ms: Vec<f64>,
    total_created: u32,
    total_completed: u32,
    total_failed: u32,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    ids: IdSequence,
}

impl Debug for IntentLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentLock")
            .field("limits", &self.limits)
            .field("intents", &self.intents.len())
            .field("queue", &self.queue.len())
            .field("current", &self.current)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl IntentLock {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self::with_limits(clock, IntentLimits::default())
    }

    #[must_use]
    pub fn with_limits(clock: SharedClock, limits: IntentLimits) -> Self {
        Self {
            clock,
            limits,
            intents: BTreeMap::new(),
            history: BTreeMap::new(),
            queue: Vec::new(),
            next_position: 0,
            current: None,
            started_at: BTreeMap::new(),
            execution_times_ms: Vec::new(),
            total_created: 0,
            total_completed: 0,
            total_failed: 0,
            listeners: Vec::new(),
            next_listener: 0,
            ids: IdSequence::new("intent"),
        }
    }

    #[must_use]
    pub fn limits(&self) -> &IntentLimits {
        &self.limits
    }

    /// Declare a new intent. It starts PENDING and joins the queue.
    ///
    /// # Errors
    /// Returns [`IntentError::InvalidPayload`] for a blank description or a
    /// payload that is not a JSON object, [`IntentError::PayloadTooLarge`],
    /// or [`IntentError::QueueFull`].
    pub fn create(&mut self, input: CreateIntentInput) -> Result<Intent, IntentError> {
        if input.description.trim().is_empty() {
            return Err(IntentError::InvalidPayload("description is required".to_string()));
        }
        let payload = input.payload.unwrap_or_else(|| Value::Object(Map::new()));
        if !payload.is_object() {
            return Err(IntentError::InvalidPayload("payload must be a JSON object".to_string()));
        }
        let size = canonical_json(&payload)?.len();
        if size > self.limits.max_payload_bytes {
            return Err(IntentError::PayloadTooLarge { size, max: self.limits.max_payload_bytes });
        }
        self.ensure_queue_room()?;

        let now = self.clock.now();
        let created_by = input.created_by.unwrap_or_else(|| "system".to_string());
        let mut draft = Intent {
            id: IntentId(self.ids.next(now, &input.description)),
            intent_type: input.intent_type,
            state: IntentState::Idle,
            priority: input.priority.unwrap_or_default(),
            description: input.description,
            payload,
            retry_count: 0,
            result: None,
            failure_code: None,
            failure_message: None,
            metadata: IntentMetadata {
                created_at: now,
                updated_at: now,
                created_by,
                context_id: input.context_id,
                tags: input.tags,
            },
            hash: String::new(),
        };
        draft.hash = draft.compute_hash()?;

        let mut intent = draft.clone();
        intent.state = IntentState::Pending;
        intent.hash = intent.compute_hash()?;
        let transition = IntentTransition {
            from: IntentState::Idle,
            to: IntentState::Pending,
            action: IntentAction::Create,
            timestamp: now,
            actor: intent.metadata.created_by.clone(),
        };

        self.intents.insert(intent.id, intent.clone());
        self.history.insert(intent.id, vec![transition.clone()]);
        self.sync_queue(&intent, now);
        self.total_created = self.total_created.saturating_add(1);
        tracing::debug!(
            intent_id = %intent.id,
            intent_type = intent.intent_type.as_str(),
            priority = intent.priority.as_str(),
            "intent created"
        );
        self.notify(&intent, draft, transition);
        Ok(intent)
    }

    /// PENDING to LOCKED.
    ///
    /// # Errors
    /// Returns [`IntentError::IntentNotFound`] or
    /// [`IntentError::InvalidTransition`].
    pub fn lock(&mut self, id: IntentId) -> Result<Intent, IntentError> {
        self.apply(id, IntentAction::Lock, |_| {})
    }

    /// LOCKED to EXECUTING. Only one intent may execute at a time.
    ///
    /// # Errors
    /// Returns [`IntentError::AlreadyExecuting`] while another intent runs,
    /// besides the lookup and transition errors of [`IntentLock::lock`].
    pub fn execute(&mut self, id: IntentId) -> Result<Intent, IntentError> {
        if let Some(current) = self.current.filter(|current| *current != id) {
            return Err(IntentError::AlreadyExecuting { current });
        }
        let intent = self.apply(id, IntentAction::Execute, |_| {})?;
        self.current = Some(id);
        self.started_at.insert(id, intent.metadata.updated_at);
        Ok(intent)
    }

    /// EXECUTING to COMPLETE, storing `result` and releasing the lock.
    ///
    /// # Errors
    /// Returns [`IntentError::IntentNotFound`] or
    /// [`IntentError::InvalidTransition`].
    pub fn complete(&mut self, id: IntentId, result: Option<Value>) -> Result<Intent, IntentError> {
        let intent = self.apply(id, IntentAction::Complete, |intent| intent.result = result)?;
        self.release(id, intent.metadata.updated_at, true);
        self.total_completed = self.total_completed.saturating_add(1);
        Ok(intent)
    }

    /// EXECUTING to FAILED, releasing the lock.
    ///
    /// # Errors
    /// Returns [`IntentError::IntentNotFound`] or
    /// [`IntentError::InvalidTransition`].
    pub fn fail(
        &mut self,
        id: IntentId,
        code: IntentFailureCode,
        message: &str,
    ) -> Result<Intent, IntentError> {
        let intent = self.apply(id, IntentAction::Fail, |intent| {
            intent.failure_code = Some(code);
            intent.failure_message = Some(message.to_string());
        })?;
        self.release(id, intent.metadata.updated_at, false);
        self.total_failed = self.total_failed.saturating_add(1);
        tracing::warn!(intent_id = %id, ?code, reason = message, "intent failed");
        Ok(intent)
    }

    /// PENDING or LOCKED back to IDLE, marked CANCELLED.
    ///
    /// # Errors
    /// Returns [`IntentError::IntentNotFound`] or
    /// [`IntentError::InvalidTransition`].
    pub fn cancel(&mut self, id: IntentId, reason: &str) -> Result<Intent, IntentError> {
        self.apply(id, IntentAction::Cancel, |intent| {
            intent.failure_code = Some(IntentFailureCode::Cancelled);
            intent.failure_message = Some(reason.to_string());
        })
    }

    /// COMPLETE or FAILED back to IDLE, clearing result and failure.
    ///
    /// # Errors
    /// Returns [`IntentError::IntentNotFound`] or
    /// [`IntentError::InvalidTransition`].
    pub fn reset(&mut self, id: IntentId) -> Result<Intent, IntentError> {
        self.apply(id, IntentAction::Reset, |intent| {
            intent.result = None;
            intent.failure_code = None;
            intent.failure_message = None;
        })
    }

    /// FAILED back to PENDING, counting the attempt and requeueing.
    ///
    /// # Errors
    /// Returns [`IntentError::MaxRetriesExceeded`] once the retry budget is
    /// spent and [`IntentError::QueueFull`] when the queue has no room.
    pub fn retry(&mut self, id: IntentId) -> Result<Intent, IntentError> {
        let intent = self.intents.get(&id).ok_or(IntentError::IntentNotFound(id))?;
        if intent.state == IntentState::Failed {
            if intent.retry_count >= self.limits.max_retries {
                return Err(IntentError::MaxRetriesExceeded { id, max: self.limits.max_retries });
            }
            self.ensure_queue_room()?;
        }
        self.apply(id, IntentAction::Retry, |intent| {
            intent.retry_count = intent.retry_count.saturating_add(1);
            intent.failure_code = None;
            intent.failure_message = None;
        })
    }

    /// Fail the executing intent with `TIMEOUT` once it has run longer than
    /// `executionTimeoutMs`. Returns the failed intent, if any.
    ///
    /// # Errors
    /// Returns [`IntentError::Encoding`] when the failed intent cannot be hashed.
    pub fn expire_timeouts(&mut self) -> Result<Option<Intent>, IntentError> {
        let Some(current) = self.current else {
            return Ok(None);
        };
        let Some(started) = self.started_at.get(&current).copied() else {
            return Ok(None);
        };
        let timeout =
            Duration::milliseconds(i64::try_from(self.limits.execution_timeout_ms).unwrap_or(i64::MAX));
        if self.clock.now() - started < timeout {
            return Ok(None);
        }
        let message = format!("execution exceeded {}ms", self.limits.execution_timeout_ms);
        self.fail(current, IntentFailureCode::Timeout, &message).map(Some)
    }

    #[must_use]
    pub fn get_intent(&self, id: IntentId) -> Option<&Intent> {
        self.intents.get(&id)
    }

    /// The intent currently holding the execution lock.
    #[must_use]
    pub fn get_current(&self) -> Option<&Intent> {
        self.current.and_then(|id| self.intents.get(&id))
    }

    /// Transitions of one intent, oldest first.
    #[must_use]
    pub fn get_history(&self, id: IntentId) -> &[IntentTransition] {
        self.history.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Waiting intents, highest priority first, then in arrival order.
    #[must_use]
    pub fn get_queue(&self) -> Vec<QueuedIntent> {
        self.queue
            .iter()
            .filter_map(|slot| {
                self.intents.get(&slot.id).map(|intent| QueuedIntent {
                    intent: intent.clone(),
                    position: slot.position,
                    priority_score: slot.priority_score,
                    added_at: slot.added_at,
                })
            })
            .collect()
    }

    /// Highest-priority queued intent still PENDING.
    #[must_use]
    pub fn get_next_in_queue(&self) -> Option<&Intent> {
        self.queue
            .iter()
            .filter_map(|slot| self.intents.get(&slot.id))
            .find(|intent| intent.state == IntentState::Pending)
    }

    #[must_use]
    pub fn get_by_state(&self, state: IntentState) -> Vec<&Intent> {
        self.intents.values().filter(|intent| intent.state == state).collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.intents.len()
    }

    /// Check that at most one intent executes, that the lock points at it,
    /// that every intent's last transition lands on its state and that every
    /// hash recomputes.
    #[must_use]
    pub fn verify_no_ambiguity(&self) -> IntegrityReport {
        let mut errors = Vec::new();
        let executing: Vec<IntentId> = self
            .intents
            .values()
            .filter(|intent| intent.state == IntentState::Executing)
            .map(|intent| intent.id)
            .collect();
        if executing.len() > 1 {
            errors.push(format!("{} intents are executing at once", executing.len()));
        }
        if executing.first().copied() != self.current && executing.len() <= 1 {
            errors.push("execution lock does not match the executing intent".to_string());
        }

        for intent in self.intents.values() {
            match self.history.get(&intent.id).and_then(|history| history.last()) {
                Some(last) if last.to == intent.state => {}
                Some(last) => errors.push(format!(
                    "intent {} is {} but its last transition ends in {}",
                    intent.id, intent.state, last.to
                )),
                None => errors.push(format!("intent {} has no transition history", intent.id)),
            }
            if !intent.verify_hash() {
                errors.push(format!("hash mismatch for intent {}", intent.id));
            }
        }

        let report = IntegrityReport::from_errors(errors);
        if !report.valid {
            tracing::warn!(errors = report.errors.len(), "intent ambiguity check failed");
        }
        report
    }

    #[must_use]
    pub fn get_metrics(&self) -> IntentMetrics {
        let mut metrics = IntentMetrics {
            total_created: self.total_created,
            total_completed: self.total_completed,
            total_failed: self.total_failed,
            current_pending: 0,
            current_locked: 0,
            current_executing: 0,
            avg_execution_time_ms: 0.0,
            by_type: IntentType::ALL.into_iter().map(|intent_type| (intent_type, 0)).collect(),
            by_state: IntentState::ALL.into_iter().map(|state| (state, 0)).collect(),
        };
        for intent in self.intents.values() {
            *metrics.by_type.entry(intent.intent_type).or_insert(0) += 1;
            *metrics.by_state.entry(intent.state).or_insert(0) += 1;
        }
        metrics.current_pending = metrics.by_state.get(&IntentState::Pending).copied().unwrap_or(0);
        metrics.current_locked = metrics.by_state.get(&IntentState::Locked).copied().unwrap_or(0);
        metrics.current_executing =
            metrics.by_state.get(&IntentState::Executing).copied().unwrap_or(0);

        let samples = u32::try_from(self.execution_times_ms.len()).unwrap_or(u32::MAX);
        if samples > 0 {
            metrics.avg_execution_time_ms =
                self.execution_times_ms.iter().sum::<f64>() / f64::from(samples);
        }
        metrics
    }

    /// Register a callback invoked after every transition. A panicking
    /// listener is logged and skipped.
    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&IntentEvent) + Send + Sync + 'static,
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

    /// Drop every intent, the queue, the lock, listeners and counters.
    pub fn clear(&mut self) {
        self.intents.clear();
        self.history.clear();
        self.queue.clear();
        self.current = None;
        self.started_at.clear();
        self.execution_times_ms.clear();
        self.total_created = 0;
        self.total_completed = 0;
        self.total_failed = 0;
        self.listeners.clear();
    }

    fn ensure_queue_room(&self) -> Result<(), IntentError> {
        if self.queue.len() >= self.limits.max_queue_size {
            return Err(IntentError::QueueFull { max: self.limits.max_queue_size });
        }
        Ok(())
    }

    fn apply<F>(&mut self, id: IntentId, action: IntentAction, update: F) -> Result<Intent, IntentError>
    where
        F: FnOnce(&mut Intent),
    {
        let previous = self.intents.get(&id).ok_or(IntentError::IntentNotFound(id))?.clone();
        let to = action
            .target(previous.state)
            .ok_or(IntentError::InvalidTransition { id, from: previous.state, action })?;

        let now = self.clock.now();
        let mut intent = previous.clone();
        intent.state = to;
        update(&mut intent);
        intent.metadata.updated_at = now;
        intent.hash = intent.compute_hash()?;

        let transition = IntentTransition {
            from: previous.state,
            to,
            action,
            timestamp: now,
            actor: intent.metadata.created_by.clone(),
        };
        self.intents.insert(id, intent.clone());
        self.history.entry(id).or_default().push(transition.clone());
        self.sync_queue(&intent, now);

        tracing::debug!(intent_id = %id, %action, from = %previous.state, %to, "intent transition");
        self.notify(&intent, previous, transition);
        Ok(intent)
    }

    /// Keep exactly the PENDING and LOCKED intents queued, ordered by score
    /// then arrival.
    fn sync_queue(&mut self, intent: &Intent, now: OffsetDateTime) {
        let waiting = matches!(intent.state, IntentState::Pending | IntentState::Locked);
        let queued = self.queue.iter().any(|slot| slot.id == intent.id);
        if waiting && !queued {
            self.queue.push(QueueSlot {
                id: intent.id,
                position: self.next_position,
                priority_score: intent.priority.score(),
                added_at: now,
            });
            self.next_position = self.next_position.saturating_add(1);
            self.queue.sort_by(|left, right| {
                right.priority_score.cmp(&left.priority_score).then(left.position.cmp(&right.position))
            });
        } else if !waiting && queued {
            self.queue.retain(|slot| slot.id != intent.id);
        }
    }

    fn release(&mut self, id: IntentId, finished_at: OffsetDateTime, record_time: bool) {
        if self.current == Some(id) {
            self.current = None;
        }
        if let Some(started) = self.started_at.remove(&id) {
            if record_time {
                self.execution_times_ms.push((finished_at - started).as_seconds_f64() * 1_000.0);
            }
        }
    }

    fn notify(&self, intent: &Intent, previous: Intent, transition: IntentTransition) {
        if self.listeners.is_empty() {
            return;
        }
        let event = IntentEvent { intent: intent.clone(), previous, transition };
        for (id, listener) in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(listener = id.0, intent_id = %intent.id, "intent listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests;
