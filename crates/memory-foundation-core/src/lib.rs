//! Deterministic in-memory stores for narrative memory: a canon of versioned
//! facts, a context tracker that follows the reading position, a general
//! conflict ledger and an intent lock serialising planned mutations. They
//! share one canonical hashing primitive, one audit chain type, one id
//! sequence and an injected clock.

pub mod audit;
pub mod canon;
pub mod clock;
pub mod context;
pub mod hash;
pub mod ids;
pub mod intent;
pub mod resolver;

use serde::{Deserialize, Serialize};

pub use audit::{AuditChain, AuditEntry, IntegrityReport};
pub use canon::{
    CanonAuditAction, CanonAuditDetails, CanonAuditEntry, CanonDiff, CanonError, CanonExport,
    CanonLimits, CanonMetrics, CanonSnapshot, CanonStore, Confidence, ConflictChoice,
    CreateFactInput, Fact, FactConflict, FactConflictCategory, FactConflictResolution, FactFilter,
    FactMetadata, FactSource, FactStatus, FactType, UpdateFactInput, CANON_MAGIC, CANON_VERSION,
};
pub use clock::{Clock, SharedClock, SteppingClock, SystemClock};
pub use context::{
    AddElementInput, ContextAction, ContextElement, ContextError, ContextLimits, ContextMetrics,
    ContextScope, ContextSnapshot, ContextState, ContextTracker, ElementFilter, ElementMetadata,
    ElementState, ElementType, HistoryEntry, HistoryState, TextPosition, UpdateElementInput,
};
pub use hash::{canonical_json, merkle_root, sha256_hex, HashError, GENESIS_HASH};
pub use ids::{
    AuditId, CanonSnapshotId, ConflictId, ContextSnapshotId, ElementId, FactConflictId, FactId,
    HistoryId, IdSequence, IntentId,
};
pub use intent::{
    CreateIntentInput, Intent, IntentAction, IntentError, IntentEvent, IntentFailureCode,
    IntentLimits, IntentLock, IntentMetadata, IntentMetrics, IntentPriority, IntentState,
    IntentTransition, IntentType, QueuedIntent,
};
pub use resolver::{
    ConflictCategory, ConflictEvent, ConflictEventKind, ConflictFilter, ConflictFlag,
    ConflictMetadata, ConflictParty, ConflictRecord, ConflictResolution, ConflictResolver,
    ConflictSeverity, ConflictStatus, DetectConflictInput, ListenerId, PartySide,
    RejectedDetection, ResolutionStrategy, ResolveConflictInput, ResolverAuditAction,
    ResolverAuditDetails, ResolverAuditEntry, ResolverError, ResolverLimits, ResolverMetrics,
    ScanOutcome,
};

/// Limits for every store, loadable from a config file. Missing
/// sections fall back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FoundationConfig {
    pub canon: CanonLimits,
    pub context: ContextLimits,
    pub resolver: ResolverLimits,
    pub intent: IntentLimits,
}
