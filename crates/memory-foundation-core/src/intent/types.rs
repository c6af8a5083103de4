use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::IntentError;
use crate::hash::{digest, HashError};
use crate::ids::IntentId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    Create,
    Update,
    Delete,
    Query,
    Composite,
    Custom,
}

impl IntentType {
    pub const ALL: [Self; 6] =
        [Self::Create, Self::Update, Self::Delete, Self::Query, Self::Composite, Self::Custom];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Query => "QUERY",
            Self::Composite => "COMPOSITE",
            Self::Custom => "CUSTOM",
        }
    }
}

impl FromStr for IntentType {
    type Err = IntentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| IntentError::InvalidType(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentState {
    Idle,
    Pending,
    Locked,
    Executing,
    Complete,
    Failed,
}

impl IntentState {
    pub const ALL: [Self; 6] =
        [Self::Idle, Self::Pending, Self::Locked, Self::Executing, Self::Complete, Self::Failed];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Pending => "PENDING",
            Self::Locked => "LOCKED",
            Self::Executing => "EXECUTING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

impl Display for IntentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl IntentPriority {
    pub const ALL: [Self; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Queue score; higher runs first.
    #[must_use]
    pub fn score(self) -> u32 {
        match self {
            Self::Low => 10,
            Self::Normal => 50,
            Self::High => 100,
            Self::Critical => 1_000,
        }
    }
}

impl FromStr for IntentPriority {
    type Err = IntentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| IntentError::InvalidPriority(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentAction {
    Create,
    Lock,
    Execute,
    Complete,
    Fail,
    Cancel,
    Reset,
    Retry,
}

/// Every legal edge of the state machine. An action not listed for a state
/// is rejected.
const TRANSITIONS: [(IntentAction, &[IntentState], IntentState); 8] = [
    (IntentAction::Create, &[IntentState::Idle], IntentState::Pending),
    (IntentAction::Lock, &[IntentState::Pending], IntentState::Locked),
    (IntentAction::Execute, &[IntentState::Locked], IntentState::Executing),
    (IntentAction::Complete, &[IntentState::Executing], IntentState::Complete),
    (IntentAction::Fail, &[IntentState::Executing], IntentState::Failed),
    (IntentAction::Cancel, &[IntentState::Pending, IntentState::Locked], IntentState::Idle),
    (IntentAction::Reset, &[IntentState::Complete, IntentState::Failed], IntentState::Idle),
    (IntentAction::Retry, &[IntentState::Failed], IntentState::Pending),
];

impl IntentAction {
    pub const ALL: [Self; 8] = [
        Self::Create,
        Self::Lock,
        Self::Execute,
        Self::Complete,
        Self::Fail,
        Self::Cancel,
        Self::Reset,
        Self::Retry,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Lock => "LOCK",
            Self::Execute => "EXECUTE",
            Self::Complete => "COMPLETE",
            Self::Fail => "FAIL",
            Self::Cancel => "CANCEL",
            Self::Reset => "RESET",
            Self::Retry => "RETRY",
        }
    }

    /// Target state when the action is legal from `from`.
    #[must_use]
    pub fn target(self, from: IntentState) -> Option<IntentState> {
        TRANSITIONS
            .iter()
            .find(|(action, _, _)| *action == self)
            .and_then(|(_, sources, to)| sources.contains(&from).then_some(*to))
    }
}

impl Display for IntentAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentFailureCode {
    Timeout,
    ValidationFailed,
    ExecutionError,
    Cancelled,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntentMetadata {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub id: IntentId,
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    pub state: IntentState,
    pub priority: IntentPriority,
    pub description: String,
    pub payload: Value,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<IntentFailureCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    pub metadata: IntentMetadata,
    pub hash: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SealedIntent<'a> {
    id: IntentId,
    #[serde(rename = "type")]
    intent_type: IntentType,
    state: IntentState,
    priority: IntentPriority,
    description: &'a str,
    payload: &'a Value,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

impl Intent {
    /// Digest over identity, state and payload. Bookkeeping such as
    /// `retryCount` and `updatedAt` is left out.
    ///
    /// # Errors
    /// Returns [`HashError::Encoding`] when the intent cannot be canonically encoded.
    pub fn compute_hash(&self) -> Result<String, HashError> {
        digest(&SealedIntent {
            id: self.id,
            intent_type: self.intent_type,
            state: self.state,
            priority: self.priority,
            description: &self.description,
            payload: &self.payload,
            created_at: self.metadata.created_at,
        })
    }

    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.compute_hash().is_ok_and(|computed| computed == self.hash)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentInput {
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<IntentPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl CreateIntentInput {
    #[must_use]
    pub fn new(intent_type: IntentType, description: impl Into<String>) -> Self {
        Self {
            intent_type,
            description: description.into(),
            priority: None,
            payload: None,
            created_by: None,
            context_id: None,
            tags: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: IntentPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntentTransition {
    pub from: IntentState,
    pub to: IntentState,
    pub action: IntentAction,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub actor: String,
}

/// A queued intent with its current record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedIntent {
    pub intent: Intent,
    pub position: u64,
    pub priority_score: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntentEvent {
    pub intent: Intent,
    pub previous: Intent,
    pub transition: IntentTransition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntentMetrics {
    pub total_created: u32,
    pub total_completed: u32,
    pub total_failed: u32,
    pub current_pending: usize,
    pub current_locked: usize,
    pub current_executing: usize,
    pub avg_execution_time_ms: f64,
    pub by_type: BTreeMap<IntentType, usize>,
    pub by_state: BTreeMap<IntentState, usize>,
}
