//! Canvas Document Types
//!
//! A canvas element is one editable artifact (a markdown document, a code
//! file or a chart specification) that grows through cumulative versions.
//! Version N's content normally starts with version N-1's content.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One editable artifact owned by a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasElement {
    /// Unique identifier
    pub id: Uuid,

    /// Conversation this element belongs to
    pub conversation_id: String,

    /// What kind of content the element holds
    pub kind: ElementKind,

    /// Display title
    pub title: String,

    /// Latest active version, if any
    pub current_version: Option<u32>,

    /// Every version ever produced, ascending, including soft-deleted ones
    pub versions: Vec<Version>,

    /// Hidden from the conversation but not destroyed
    #[serde(default)]
    pub archived: bool,

    /// When the element was created
    pub created_at: DateTime<Utc>,

    /// When the element was last modified
    pub updated_at: DateTime<Utc>,

    /// Element metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CanvasElement {
    /// Create a new element with no versions
    #[must_use]
    pub fn new(
        conversation_id: impl Into<String>,
        kind: ElementKind,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            kind,
            title: title.into(),
            current_version: None,
            versions: Vec::new(),
            archived: false,
            created_at: now,
            updated_at: now,
            metadata: serde_json::json!({}),
        }
    }

    /// Create with a specific ID
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Look up a version by number, deleted or not
    #[must_use]
    pub fn version(&self, version: u32) -> Option<&Version> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub(crate) fn version_mut(&mut self, version: u32) -> Option<&mut Version> {
        self.versions.iter_mut().find(|v| v.version == version)
    }

    /// Non-deleted versions in ascending order
    pub fn active_versions(&self) -> impl Iterator<Item = &Version> {
        self.versions.iter().filter(|v| v.state.is_active())
    }

    /// Number of non-deleted versions
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_versions().count()
    }

    /// Latest non-deleted version
    #[must_use]
    pub fn latest_active(&self) -> Option<&Version> {
        self.active_versions().last()
    }

    /// The version currently being revealed, if any
    #[must_use]
    pub fn typing_version(&self) -> Option<u32> {
        self.versions
            .iter()
            .find(|v| v.state == VersionState::Typing)
            .map(|v| v.version)
    }

    /// Next version number to assign; numbers are never reused
    #[must_use]
    pub fn next_version_number(&self) -> u32 {
        self.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1
    }

    /// True once every active version has been fully displayed
    #[must_use]
    pub fn is_fully_displayed(&self) -> bool {
        let mut active = self.active_versions().peekable();
        active.peek().is_some() && active.all(|v| v.state == VersionState::Displayed)
    }

    pub(crate) fn refresh_current_version(&mut self) {
        self.current_version = self.latest_active().map(|v| v.version);
        self.updated_at = Utc::now();
    }
}

/// Kind-specific element schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    /// Markdown document
    Document,

    /// Source code file
    Code {
        /// Programming language
        language: String,
    },

    /// Chart whose content is a JSON specification
    Chart {
        /// Chart type
        chart_type: ChartType,
    },
}

impl ElementKind {
    /// Get the kind as a string
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Code { .. } => "code",
            Self::Chart { .. } => "chart",
        }
    }
}

/// Supported chart types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    /// Line chart
    Line,
    /// Bar chart
    Bar,
    /// Pie chart
    Pie,
    /// Scatter plot
    Scatter,
    /// Area chart
    Area,
}

impl AsRef<str> for ChartType {
    fn as_ref(&self) -> &str {
        match self {
            Self::Line => "line",
            Self::Bar => "bar",
            Self::Pie => "pie",
            Self::Scatter => "scatter",
            Self::Area => "area",
        }
    }
}

/// One cumulative revision of an element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    /// Version number, starting at 1
    pub version: u32,

    /// Full document text as of this version
    pub content: String,

    /// Human-readable label of what produced it
    pub request: String,

    /// Lifecycle state
    pub state: VersionState,

    /// When the version was produced
    pub created_at: DateTime<Utc>,

    /// Characters of the delta that were visible when the reveal was interrupted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_at: Option<usize>,
}

impl Version {
    pub(crate) fn new(version: u32, content: String, request: String) -> Self {
        Self {
            version,
            content,
            request,
            state: VersionState::Typing,
            created_at: Utc::now(),
            frozen_at: None,
        }
    }
}

/// Version lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    /// Being revealed right now
    Typing,
    /// Reveal was interrupted before the end
    Frozen,
    /// Fully revealed
    Displayed,
    /// Soft-deleted
    Deleted,
}

impl VersionState {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Typing => "typing",
            Self::Frozen => "frozen",
            Self::Displayed => "displayed",
            Self::Deleted => "deleted",
        }
    }

    /// Anything but `Deleted`
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Deleted)
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_transition_to(&self, next: VersionState) -> bool {
        use VersionState::{Deleted, Displayed, Frozen, Typing};
        matches!(
            (*self, next),
            (Typing, Displayed)
                | (Typing, Frozen)
                | (Frozen, Typing)
                | (Frozen, Displayed)
                | (Typing | Frozen | Displayed, Deleted)
        )
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted shape of one conversation's canvas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    /// Conversation ID
    pub conversation_id: String,

    /// Elements by ID
    pub elements: BTreeMap<Uuid, CanvasElement>,

    /// When the snapshot was taken
    pub saved_at: DateTime<Utc>,
}

impl ConversationSnapshot {
    /// Create an empty snapshot
    #[must_use]
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            elements: BTreeMap::new(),
            saved_at: Utc::now(),
        }
    }
}
