use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{ContextSnapshotId, ElementId, HistoryId};

/// Nested coordinate in the manuscript. Absent components order as 0.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TextPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<i32>,
    pub paragraph: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence: Option<i32>,
}

impl TextPosition {
    #[must_use]
    pub fn paragraph(paragraph: i32) -> Self {
        Self { paragraph, ..Self::default() }
    }

    #[must_use]
    pub fn in_chapter(chapter: i32, paragraph: i32) -> Self {
        Self { chapter: Some(chapter), paragraph, ..Self::default() }
    }

    fn sort_key(&self) -> (i32, i32, i32, i32, i32) {
        (
            self.part.unwrap_or(0),
            self.chapter.unwrap_or(0),
            self.scene.unwrap_or(0),
            self.paragraph,
            self.sentence.unwrap_or(0),
        )
    }

    /// Reading order: lexicographic over part, chapter, scene, paragraph,
    /// sentence with absent components treated as 0.
    #[must_use]
    pub fn reading_order(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }

    /// Narrative distance used for decay: paragraph delta plus 10 when the
    /// chapter changes and 5 when the scene changes. An absent component
    /// differs from any present one.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> u32 {
        let paragraphs = (i64::from(other.paragraph) - i64::from(self.paragraph)).unsigned_abs();
        let mut distance = u32::try_from(paragraphs).unwrap_or(u32::MAX);
        if self.chapter != other.chapter {
            distance = distance.saturating_add(10);
        }
        if self.scene != other.scene {
            distance = distance.saturating_add(5);
        }
        distance
    }

    pub(crate) fn first_negative_component(&self) -> Option<&'static str> {
        [
            ("part", self.part),
            ("chapter", self.chapter),
            ("scene", self.scene),
            ("paragraph", Some(self.paragraph)),
            ("sentence", self.sentence),
        ]
        .into_iter()
        .find(|(_, value)| value.is_some_and(|value| value < 0))
        .map(|(name, _)| name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementType {
    Character,
    Location,
    Object,
    Concept,
    Event,
    Relation,
    Emotion,
    Tension,
}

impl ElementType {
    pub const ALL: [Self; 8] = [
        Self::Character,
        Self::Location,
        Self::Object,
        Self::Concept,
        Self::Event,
        Self::Relation,
        Self::Emotion,
        Self::Tension,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementState {
    Active,
    Background,
    Mentioned,
    Implicit,
    Exited,
}

impl ElementState {
    pub const ALL: [Self; 5] =
        [Self::Active, Self::Background, Self::Mentioned, Self::Implicit, Self::Exited];

    /// Weight an element starts with when it enters in this state.
    #[must_use]
    pub fn default_weight(self) -> f64 {
        match self {
            Self::Active => 1.0,
            Self::Background => 0.5,
            Self::Mentioned => 0.3,
            Self::Implicit => 0.2,
            Self::Exited => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextScope {
    Global,
    Part,
    Chapter,
    Scene,
    Local,
}

impl ContextScope {
    pub const ALL: [Self; 5] = [Self::Global, Self::Part, Self::Chapter, Self::Scene, Self::Local];

    /// Weight lost per unit of narrative distance.
    #[must_use]
    pub fn decay_rate(self) -> f64 {
        match self {
            Self::Global => 0.0,
            Self::Part => 0.01,
            Self::Chapter => 0.05,
            Self::Scene => 0.1,
            Self::Local => 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementMetadata {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextElement {
    pub id: ElementId,
    pub entity_ref: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub state: ElementState,
    pub weight: f64,
    pub scope: ContextScope,
    pub entered_at: TextPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<TextPosition>,
    pub metadata: ElementMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddElementInput {
    pub entity_ref: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ElementState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ContextScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl AddElementInput {
    #[must_use]
    pub fn new(entity_ref: impl Into<String>, element_type: ElementType) -> Self {
        Self {
            entity_ref: entity_ref.into(),
            element_type,
            state: None,
            weight: None,
            scope: None,
            role: None,
            notes: None,
        }
    }

    #[must_use]
    pub fn in_scope(mut self, scope: ContextScope) -> Self {
        self.scope = Some(scope);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateElementInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ElementState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ContextScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementFilter {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub element_type: Option<ElementType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ElementState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ContextScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ref_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextAction {
    Move,
    AddElement,
    UpdateElement,
    Decay,
    Snapshot,
    Rollback,
}

/// Before/after value recorded on a history entry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryState {
    Position(TextPosition),
    Element(ElementState),
    Snapshot(ContextSnapshotId),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: HistoryId,
    pub position: TextPosition,
    pub action: ContextAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_before: Option<HistoryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_after: Option<HistoryState>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub id: ContextSnapshotId,
    pub position: TextPosition,
    pub elements: Vec<ContextElement>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub hash: String,
}

/// Live tracker state with a digest over the position and the id-sorted
/// elements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextState {
    pub position: TextPosition,
    pub elements: Vec<ContextElement>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetrics {
    pub current_position: TextPosition,
    pub elements_by_state: BTreeMap<ElementState, usize>,
    pub elements_by_type: BTreeMap<ElementType, usize>,
    pub elements_by_scope: BTreeMap<ContextScope, usize>,
    pub history_size: usize,
    pub snapshot_count: usize,
    pub avg_active_weight: f64,
}
