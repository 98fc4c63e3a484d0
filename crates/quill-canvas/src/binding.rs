//! Active conversation binding

use std::sync::RwLock;

use tracing::info;

use crate::error::{Error, Result};

/// Result of [`ConversationBinding::switch_to`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingChange {
    /// Already bound to that conversation
    Unchanged,
    /// Rebound
    Switched {
        /// Conversation that was bound before
        previous: Option<String>,
    },
}

/// Which conversation the live view shows
#[derive(Debug, Default)]
pub struct ConversationBinding {
    active: RwLock<Option<String>>,
}

impl ConversationBinding {
    /// Create an unbound binding
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebind the live view. Switching to the active conversation is a no-op.
    pub fn switch_to(&self, conversation_id: impl Into<String>) -> BindingChange {
        let conversation_id = conversation_id.into();
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        if active.as_deref() == Some(conversation_id.as_str()) {
            return BindingChange::Unchanged;
        }
        info!(from = ?active.as_deref(), to = %conversation_id, "conversation switched");
        let previous = active.replace(conversation_id);
        BindingChange::Switched { previous }
    }

    /// Currently bound conversation
    #[must_use]
    pub fn active(&self) -> Option<String> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Currently bound conversation, or `NoActiveConversation`
    pub fn require_active(&self) -> Result<String> {
        self.active().ok_or(Error::NoActiveConversation)
    }

    /// Whether `conversation_id` is the bound one
    #[must_use]
    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            == Some(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_and_noop() {
        let binding = ConversationBinding::new();
        assert!(binding.require_active().is_err());

        assert_eq!(
            binding.switch_to("a"),
            BindingChange::Switched { previous: None }
        );
        assert_eq!(binding.switch_to("a"), BindingChange::Unchanged);
        assert_eq!(
            binding.switch_to("b"),
            BindingChange::Switched {
                previous: Some("a".to_string())
            }
        );
        assert!(binding.is_active("b"));
        assert!(!binding.is_active("a"));
        assert_eq!(binding.active().as_deref(), Some("b"));
    }
}
