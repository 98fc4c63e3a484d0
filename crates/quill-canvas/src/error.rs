//! Error types for quill-canvas
//!
//! Every failure the engine can report is a local, recoverable condition.
//! Only a failed permanent-delete confirmation is meant to reach the user.

use thiserror::Error;
use uuid::Uuid;

use crate::document::VersionState;

/// Canvas error type
#[derive(Debug, Error)]
pub enum Error {
    /// Element not found
    #[error("element not found: {0}")]
    ElementNotFound(Uuid),

    /// Version not found on an element
    #[error("version {version} not found on element {element_id}")]
    VersionNotFound {
        /// Element ID
        element_id: Uuid,
        /// Requested version number
        version: u32,
    },

    /// Version exists but was soft-deleted
    #[error("version {version} of element {element_id} is deleted")]
    VersionDeleted {
        /// Element ID
        element_id: Uuid,
        /// Deleted version number
        version: u32,
    },

    /// Element has no active versions to work with
    #[error("element has no active versions: {0}")]
    EmptyElement(Uuid),

    /// Element is archived and cannot be changed
    #[error("element is archived: {0}")]
    ElementArchived(Uuid),

    /// Another version of the element is still being revealed
    #[error("version {version} of element {element_id} is still typing")]
    VersionStillTyping {
        /// Element ID
        element_id: Uuid,
        /// The version in `typing` state
        version: u32,
    },

    /// Refused to delete the only remaining active version
    #[error("cannot delete version {version}: it is the last active version of {element_id}")]
    LastActiveVersion {
        /// Element ID
        element_id: Uuid,
        /// Version the caller tried to delete
        version: u32,
    },

    /// Permanent delete attempted without a valid confirmation token
    #[error("permanent delete of {0} requires confirmation")]
    ConfirmationRequired(Uuid),

    /// State transition not allowed
    #[error("invalid transition for version {version}: {from} -> {to}")]
    InvalidTransition {
        /// Version number
        version: u32,
        /// Current state
        from: VersionState,
        /// Requested state
        to: VersionState,
    },

    /// No conversation is bound
    #[error("no active conversation")]
    NoActiveConversation,

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Rendering error
    #[error("rendering error: {0}")]
    Rendering(String),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a database error
    #[must_use]
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invalid config error
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a WebSocket error
    #[must_use]
    pub fn websocket(msg: impl Into<String>) -> Self {
        Self::WebSocket(msg.into())
    }

    /// Whether the error means "the thing you asked for is not there"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ElementNotFound(_)
                | Self::VersionNotFound { .. }
                | Self::VersionDeleted { .. }
                | Self::EmptyElement(_)
        )
    }

    /// Whether the error should be surfaced to the user (re-prompt)
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::ConfirmationRequired(_))
    }

    /// Check if retrying the same call later can succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::VersionStillTyping { .. } | Self::Database(_) | Self::WebSocket(_)
        )
    }

    /// Get error code for protocol messages
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ElementNotFound(_) => "element_not_found",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::VersionDeleted { .. } => "version_deleted",
            Self::EmptyElement(_) => "empty_element",
            Self::ElementArchived(_) => "element_archived",
            Self::VersionStillTyping { .. } => "version_still_typing",
            Self::LastActiveVersion { .. } => "last_active_version",
            Self::ConfirmationRequired(_) => "confirmation_required",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NoActiveConversation => "no_active_conversation",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Database(_) => "database_error",
            Self::Serialization(_) => "serialization_error",
            Self::Rendering(_) => "rendering_error",
            Self::WebSocket(_) => "websocket_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type alias for canvas operations
pub type Result<T> = std::result::Result<T, Error>;
