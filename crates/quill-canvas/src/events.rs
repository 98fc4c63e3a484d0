//! Canvas notifications
//!
//! Everything observable about the engine is published as a
//! [`CanvasNotification`] on a [`NotificationBus`]. UI layers, the WebSocket
//! handler and the indexing worker are all just subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::document::VersionState;
use crate::reveal::RevealOutcome;

/// Notifications emitted by the canvas engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasNotification {
    /// A producer appended a new cumulative version
    VersionAdded {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
        /// Assigned version number
        version: u32,
    },

    /// A version moved between lifecycle states
    VersionStateChanged {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
        /// Version number
        version: u32,
        /// Previous state
        from: VersionState,
        /// New state
        to: VersionState,
    },

    /// A reveal session began playing a delta
    RevealStarted {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
        /// Version being revealed
        version: u32,
        /// Delta length in characters
        total_chars: usize,
    },

    /// Partial text of a running reveal
    RevealProgress {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
        /// Version being revealed
        version: u32,
        /// Delta text revealed so far
        revealed: String,
        /// Characters revealed so far
        revealed_chars: usize,
        /// Delta length in characters
        total_chars: usize,
    },

    /// A reveal session reached a terminal state
    RevealComplete {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
        /// Version that was revealed
        version: u32,
        /// How the session ended
        outcome: RevealOutcome,
    },

    /// No reveal is running for the conversation anymore
    AllRevealsComplete {
        /// Conversation whose loading state can be cleared
        conversation_id: String,
    },

    /// Every active version of an element is displayed
    ElementReady {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
        /// Latest active version
        version: u32,
        /// Element title
        title: String,
        /// Full cumulative content of the latest version
        content: String,
    },

    /// A version did not extend its predecessor
    DeltaInconsistency {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
        /// Version that rewrote the document
        version: u32,
        /// How many times this element has hit the fallback
        occurrences: u32,
    },

    /// Element hidden
    ElementArchived {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
    },

    /// Archived element made visible again
    ElementRestored {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
    },

    /// Element permanently removed
    ElementDeleted {
        /// Owning conversation
        conversation_id: String,
        /// Element ID
        element_id: Uuid,
    },

    /// The live view was rebound to another conversation
    ConversationSwitched {
        /// Previously active conversation
        previous: Option<String>,
        /// Newly active conversation
        conversation_id: String,
    },
}

impl CanvasNotification {
    /// Get the notification type as a string
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VersionAdded { .. } => "version_added",
            Self::VersionStateChanged { .. } => "version_state_changed",
            Self::RevealStarted { .. } => "reveal_started",
            Self::RevealProgress { .. } => "reveal_progress",
            Self::RevealComplete { .. } => "reveal_complete",
            Self::AllRevealsComplete { .. } => "all_reveals_complete",
            Self::ElementReady { .. } => "element_ready",
            Self::DeltaInconsistency { .. } => "delta_inconsistency",
            Self::ElementArchived { .. } => "element_archived",
            Self::ElementRestored { .. } => "element_restored",
            Self::ElementDeleted { .. } => "element_deleted",
            Self::ConversationSwitched { .. } => "conversation_switched",
        }
    }

    /// Conversation the notification belongs to
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::VersionAdded {
                conversation_id, ..
            }
            | Self::VersionStateChanged {
                conversation_id, ..
            }
            | Self::RevealStarted {
                conversation_id, ..
            }
            | Self::RevealProgress {
                conversation_id, ..
            }
            | Self::RevealComplete {
                conversation_id, ..
            }
            | Self::AllRevealsComplete { conversation_id }
            | Self::ElementReady {
                conversation_id, ..
            }
            | Self::DeltaInconsistency {
                conversation_id, ..
            }
            | Self::ElementArchived {
                conversation_id, ..
            }
            | Self::ElementRestored {
                conversation_id, ..
            }
            | Self::ElementDeleted {
                conversation_id, ..
            }
            | Self::ConversationSwitched {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// Element the notification is about, if any
    #[must_use]
    pub fn element_id(&self) -> Option<Uuid> {
        match self {
            Self::VersionAdded { element_id, .. }
            | Self::VersionStateChanged { element_id, .. }
            | Self::RevealStarted { element_id, .. }
            | Self::RevealProgress { element_id, .. }
            | Self::RevealComplete { element_id, .. }
            | Self::ElementReady { element_id, .. }
            | Self::DeltaInconsistency { element_id, .. }
            | Self::ElementArchived { element_id, .. }
            | Self::ElementRestored { element_id, .. }
            | Self::ElementDeleted { element_id, .. } => Some(*element_id),
            Self::AllRevealsComplete { .. } | Self::ConversationSwitched { .. } => None,
        }
    }

    /// Check if this is emitted by a reveal session
    #[must_use]
    pub fn is_reveal_event(&self) -> bool {
        matches!(
            self,
            Self::RevealStarted { .. }
                | Self::RevealProgress { .. }
                | Self::RevealComplete { .. }
                | Self::AllRevealsComplete { .. }
        )
    }
}

/// Broadcast-based bus for canvas notifications.
///
/// Slow subscribers miss notifications (lagged) rather than blocking the
/// engine.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<CanvasNotification>,
}

impl NotificationBus {
    /// Create a bus with the given channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all future notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CanvasNotification> {
        self.sender.subscribe()
    }

    /// Publish to all active subscribers.
    ///
    /// Returns the number of subscribers that received it; with no
    /// subscribers the notification is dropped.
    pub fn publish(&self, notification: CanvasNotification) -> usize {
        self.sender.send(notification).unwrap_or(0)
    }

    /// Number of active subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = NotificationBus::new(16);
        let mut rx = bus.subscribe();

        let element_id = Uuid::new_v4();
        bus.publish(CanvasNotification::VersionAdded {
            conversation_id: "conv-1".to_string(),
            element_id,
            version: 1,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.element_id(), Some(element_id));
        assert_eq!(event.conversation_id(), "conv-1");
        assert_eq!(event.kind(), "version_added");
    }

    #[test]
    fn test_publish_no_subscribers() {
        let bus = NotificationBus::new(16);
        let count = bus.publish(CanvasNotification::AllRevealsComplete {
            conversation_id: "c".to_string(),
        });
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = NotificationBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let count = bus.publish(CanvasNotification::ConversationSwitched {
            previous: None,
            conversation_id: "b".to_string(),
        });
        assert_eq!(count, 2);
        assert_eq!(rx1.recv().await.unwrap().kind(), "conversation_switched");
        assert_eq!(rx2.recv().await.unwrap().kind(), "conversation_switched");
    }

    #[test]
    fn test_notification_serialization() {
        let event = CanvasNotification::RevealComplete {
            conversation_id: "c".to_string(),
            element_id: Uuid::nil(),
            version: 2,
            outcome: RevealOutcome::Skipped,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"reveal_complete\""));
        assert!(json.contains("\"outcome\":\"skipped\""));
        assert!(event.is_reveal_event());
    }

    #[test]
    fn test_state_change_serialization() {
        let event = CanvasNotification::VersionStateChanged {
            conversation_id: "c".to_string(),
            element_id: Uuid::nil(),
            version: 1,
            from: VersionState::Typing,
            to: VersionState::Frozen,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"from\":\"typing\""));
        assert!(json.contains("\"to\":\"frozen\""));
        assert!(!event.is_reveal_event());
    }
}
