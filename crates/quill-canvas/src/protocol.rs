//! Command and WebSocket Protocol Messages
//!
//! Commands go in as [`CanvasCommand`], results come back as
//! [`CommandOutcome`]. The WebSocket surface wraps both in
//! [`ClientMessage`] / [`ServerMessage`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::DeltaKind;
use crate::document::{CanvasElement, ElementKind};
use crate::error::Error;
use crate::events::CanvasNotification;
use crate::export::{ExportFormat, ExportScope, ExportedDocument};
use crate::reveal::RevealStart;
use crate::versions::ConfirmationToken;

/// Everything a producer or UI can ask the engine to do
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasCommand {
    /// Create an element; defaults to the active conversation
    CreateElement {
        /// Owning conversation
        #[serde(default)]
        conversation_id: Option<String>,
        /// Element kind
        kind: ElementKind,
        /// Display title
        title: String,
    },

    /// Add a cumulative version and reveal its delta
    AppendContent {
        /// Element ID
        element_id: Uuid,
        /// Full content as of the new version
        content: String,
        /// What produced it
        #[serde(default)]
        request: String,
    },

    /// Finish the element's reveal at once
    Skip {
        /// Element ID
        element_id: Uuid,
    },

    /// Halt the element's reveal where it is
    Cancel {
        /// Element ID
        element_id: Uuid,
    },

    /// Halt every running reveal
    CancelAll,

    /// Continue a frozen version from where it stopped
    Resume {
        /// Element ID
        element_id: Uuid,
        /// Frozen version
        version: u32,
    },

    /// Soft-delete a version
    DeleteVersion {
        /// Element ID
        element_id: Uuid,
        /// Version number
        version: u32,
    },

    /// Hide an element
    Archive {
        /// Element ID
        element_id: Uuid,
    },

    /// Unhide an element
    Restore {
        /// Element ID
        element_id: Uuid,
    },

    /// Ask for a permanent-delete confirmation token
    RequestPermanentDelete {
        /// Element ID
        element_id: Uuid,
    },

    /// Destroy an element
    PermanentlyDelete {
        /// Element ID
        element_id: Uuid,
        /// Token from `request_permanent_delete`
        #[serde(default)]
        token: Option<ConfirmationToken>,
    },

    /// Export one version
    ExportVersion {
        /// Element ID
        element_id: Uuid,
        /// Version number
        version: u32,
        /// Delta or cumulative text
        #[serde(default)]
        scope: ExportScope,
        /// Output format
        #[serde(default)]
        format: ExportFormat,
    },

    /// Export the latest full document
    ExportAll {
        /// Element ID
        element_id: Uuid,
        /// Output format
        #[serde(default)]
        format: ExportFormat,
    },

    /// Rebind the live view
    SwitchConversation {
        /// Target conversation
        conversation_id: String,
    },

    /// Elements of a conversation, the active one when omitted
    ListElements {
        /// Conversation to list
        #[serde(default)]
        conversation_id: Option<String>,
        /// Include archived elements
        #[serde(default)]
        include_archived: bool,
    },
}

impl CanvasCommand {
    /// Get the command type as a string
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateElement { .. } => "create_element",
            Self::AppendContent { .. } => "append_content",
            Self::Skip { .. } => "skip",
            Self::Cancel { .. } => "cancel",
            Self::CancelAll => "cancel_all",
            Self::Resume { .. } => "resume",
            Self::DeleteVersion { .. } => "delete_version",
            Self::Archive { .. } => "archive",
            Self::Restore { .. } => "restore",
            Self::RequestPermanentDelete { .. } => "request_permanent_delete",
            Self::PermanentlyDelete { .. } => "permanently_delete",
            Self::ExportVersion { .. } => "export_version",
            Self::ExportAll { .. } => "export_all",
            Self::SwitchConversation { .. } => "switch_conversation",
            Self::ListElements { .. } => "list_elements",
        }
    }
}

/// Result of a successfully executed command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Element created
    ElementCreated {
        /// New element ID
        element_id: Uuid,
    },

    /// Version stored and reveal scheduled
    VersionAdded {
        /// Element ID
        element_id: Uuid,
        /// Assigned version
        version: u32,
        /// How the delta relates to the previous version
        delta_kind: DeltaKind,
        /// What the reveal engine did
        reveal: RevealStart,
    },

    /// Skip handled
    Skipped {
        /// Element ID
        element_id: Uuid,
        /// False when nothing was running or frozen
        changed: bool,
    },

    /// Cancel handled
    Cancelled {
        /// Element ID
        element_id: Uuid,
        /// Characters visible when halted; `None` when nothing was running
        revealed_chars: Option<usize>,
    },

    /// Cancel-all handled
    CancelledAll {
        /// Sessions cancelled
        count: usize,
    },

    /// Frozen version playing again
    Resumed {
        /// Element ID
        element_id: Uuid,
        /// Version
        version: u32,
        /// Offset the reveal continued from
        from_chars: usize,
        /// What the reveal engine did
        reveal: RevealStart,
    },

    /// Version soft-deleted
    VersionDeleted {
        /// Element ID
        element_id: Uuid,
        /// Version number
        version: u32,
    },

    /// Element archived
    Archived {
        /// Element ID
        element_id: Uuid,
    },

    /// Element restored
    Restored {
        /// Element ID
        element_id: Uuid,
    },

    /// Confirmation token issued
    DeleteRequested {
        /// Element ID
        element_id: Uuid,
        /// Token to echo back
        token: ConfirmationToken,
    },

    /// Element destroyed
    Deleted {
        /// Element ID
        element_id: Uuid,
    },

    /// Export ready
    Exported {
        /// The rendered document
        document: ExportedDocument,
    },

    /// Live view rebound
    Switched {
        /// Previously active conversation
        previous: Option<String>,
        /// Newly active conversation
        conversation_id: String,
        /// False when it was already active
        changed: bool,
        /// Elements loaded from persistence
        loaded: usize,
    },

    /// Element listing
    Elements {
        /// Elements, oldest first
        elements: Vec<CanvasElement>,
    },
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run a command
    Command {
        /// Echoed back on the reply
        #[serde(default)]
        request_id: Option<String>,
        /// The command
        command: CanvasCommand,
    },

    /// Ping to keep connection alive
    Ping,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after connecting
    Welcome {
        /// Conversation the connection is bound to
        conversation_id: String,
        /// Its visible elements
        elements: Vec<CanvasElement>,
    },

    /// Command succeeded
    Result {
        /// Request ID from the command
        request_id: Option<String>,
        /// Outcome
        outcome: CommandOutcome,
    },

    /// Forwarded engine notification
    Notification {
        /// The notification
        notification: CanvasNotification,
    },

    /// Command failed or the message was malformed
    Error {
        /// Request ID from the command, when known
        request_id: Option<String>,
        /// Error code
        code: String,
        /// Error message
        message: String,
        /// Whether the UI should prompt the user
        user_visible: bool,
    },

    /// Pong response to ping
    Pong,
}

impl ServerMessage {
    /// Create an error message
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            request_id: None,
            code: code.into(),
            message: message.into(),
            user_visible: false,
        }
    }

    /// Create an error reply for a failed command
    #[must_use]
    pub fn from_error(request_id: Option<String>, err: &Error) -> Self {
        Self::Error {
            request_id,
            code: err.code().to_string(),
            message: err.to_string(),
            user_visible: err.is_user_visible(),
        }
    }
}
