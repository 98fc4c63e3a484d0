//! Version store
//!
//! Owns every canvas element of the process and the lifecycle of their
//! versions. All mutations go through one write lock; readers get clones.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::document::{CanvasElement, ConversationSnapshot, ElementKind, Version, VersionState};
use crate::error::{Error, Result};
use crate::events::{CanvasNotification, NotificationBus};

/// Proof that the caller asked for a permanent delete first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfirmationToken(Uuid);

impl ConfirmationToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw token value
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for ConfirmationToken {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Ordered versions per element, with validated state transitions
pub struct VersionStore {
    elements: RwLock<HashMap<Uuid, CanvasElement>>,
    confirmations: Mutex<HashMap<Uuid, ConfirmationToken>>,
    bus: NotificationBus,
}

impl VersionStore {
    /// Create an empty store publishing on `bus`
    #[must_use]
    pub fn new(bus: NotificationBus) -> Self {
        Self {
            elements: RwLock::new(HashMap::new()),
            confirmations: Mutex::new(HashMap::new()),
            bus,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, CanvasElement>> {
        self.elements.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, CanvasElement>> {
        self.elements.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an element with no versions
    pub fn create_element(
        &self,
        conversation_id: impl Into<String>,
        kind: ElementKind,
        title: impl Into<String>,
    ) -> Uuid {
        let element = CanvasElement::new(conversation_id, kind, title);
        let id = element.id;
        debug!(element_id = %id, conversation_id = %element.conversation_id, kind = element.kind.as_str(), "created element");
        self.write().insert(id, element);
        id
    }

    /// Insert or replace an element as-is
    pub fn insert_element(&self, element: CanvasElement) {
        self.write().insert(element.id, element);
    }

    /// Clone of the element
    pub fn get_element(&self, element_id: Uuid) -> Result<CanvasElement> {
        self.read()
            .get(&element_id)
            .cloned()
            .ok_or(Error::ElementNotFound(element_id))
    }

    /// Run `f` against the element under the read lock
    pub fn with_element<R>(&self, element_id: Uuid, f: impl FnOnce(&CanvasElement) -> R) -> Result<R> {
        self.read()
            .get(&element_id)
            .map(f)
            .ok_or(Error::ElementNotFound(element_id))
    }

    /// Whether the element exists
    #[must_use]
    pub fn contains(&self, element_id: Uuid) -> bool {
        self.read().contains_key(&element_id)
    }

    /// Elements of a conversation, oldest first
    #[must_use]
    pub fn elements_for(&self, conversation_id: &str, include_archived: bool) -> Vec<CanvasElement> {
        let mut elements: Vec<CanvasElement> = self
            .read()
            .values()
            .filter(|e| e.conversation_id == conversation_id)
            .filter(|e| include_archived || !e.archived)
            .cloned()
            .collect();
        elements.sort_by_key(|e| e.created_at);
        elements
    }

    /// Whether any element of the conversation is loaded
    #[must_use]
    pub fn has_conversation(&self, conversation_id: &str) -> bool {
        self.read()
            .values()
            .any(|e| e.conversation_id == conversation_id)
    }

    /// Append a cumulative version in `typing` state. Returns its number.
    pub fn add_version(
        &self,
        element_id: Uuid,
        content: impl Into<String>,
        request: impl Into<String>,
    ) -> Result<u32> {
        let (conversation_id, version) = {
            let mut elements = self.write();
            let element = elements
                .get_mut(&element_id)
                .ok_or(Error::ElementNotFound(element_id))?;
            if element.archived {
                return Err(Error::ElementArchived(element_id));
            }
            if let Some(version) = element.typing_version() {
                return Err(Error::VersionStillTyping {
                    element_id,
                    version,
                });
            }

            let version = element.next_version_number();
            element
                .versions
                .push(Version::new(version, content.into(), request.into()));
            element.refresh_current_version();
            (element.conversation_id.clone(), version)
        };

        info!(element_id = %element_id, version, "version added");
        self.bus.publish(CanvasNotification::VersionAdded {
            conversation_id,
            element_id,
            version,
        });
        Ok(version)
    }

    /// `typing|frozen -> displayed`
    pub fn mark_displayed(&self, element_id: Uuid, version: u32) -> Result<()> {
        self.transition(element_id, version, VersionState::Displayed, None)
            .map(drop)
    }

    /// `typing -> frozen`, remembering how much of the delta was visible
    pub fn freeze(&self, element_id: Uuid, version: u32, revealed_chars: usize) -> Result<()> {
        self.transition(
            element_id,
            version,
            VersionState::Frozen,
            Some(revealed_chars),
        )
        .map(drop)
    }

    /// `frozen -> typing`. Returns the offset the reveal should continue from.
    pub fn resume(&self, element_id: Uuid, version: u32) -> Result<usize> {
        {
            let elements = self.read();
            let element = elements
                .get(&element_id)
                .ok_or(Error::ElementNotFound(element_id))?;
            if let Some(typing) = element.typing_version().filter(|v| *v != version) {
                return Err(Error::VersionStillTyping {
                    element_id,
                    version: typing,
                });
            }
        }
        let offset = self.transition(element_id, version, VersionState::Typing, None)?;
        Ok(offset.unwrap_or(0))
    }

    /// Soft-delete a version. The last active version cannot be deleted.
    pub fn delete_version(&self, element_id: Uuid, version: u32) -> Result<()> {
        {
            let elements = self.read();
            let element = elements
                .get(&element_id)
                .ok_or(Error::ElementNotFound(element_id))?;
            let target = element.version(version).ok_or(Error::VersionNotFound {
                element_id,
                version,
            })?;
            if target.state == VersionState::Deleted {
                return Err(Error::VersionDeleted {
                    element_id,
                    version,
                });
            }
            if element.active_count() <= 1 {
                return Err(Error::LastActiveVersion {
                    element_id,
                    version,
                });
            }
        }
        self.transition(element_id, version, VersionState::Deleted, None)
            .map(drop)
    }

    /// Validate and apply a state change; returns the `frozen_at` the
    /// version carried before the change
    fn transition(
        &self,
        element_id: Uuid,
        version: u32,
        to: VersionState,
        frozen_at: Option<usize>,
    ) -> Result<Option<usize>> {
        let (conversation_id, from, previous_offset) = {
            let mut elements = self.write();
            let element = elements
                .get_mut(&element_id)
                .ok_or(Error::ElementNotFound(element_id))?;
            if to == VersionState::Deleted && element.active_count() <= 1 {
                return Err(Error::LastActiveVersion {
                    element_id,
                    version,
                });
            }
            let target = element.version_mut(version).ok_or(Error::VersionNotFound {
                element_id,
                version,
            })?;

            let from = target.state;
            if from == VersionState::Deleted {
                return Err(Error::VersionDeleted {
                    element_id,
                    version,
                });
            }
            if !from.can_transition_to(to) {
                return Err(Error::InvalidTransition { version, from, to });
            }

            let previous_offset = target.frozen_at;
            target.state = to;
            target.frozen_at = match to {
                VersionState::Frozen => frozen_at,
                VersionState::Deleted => target.frozen_at,
                VersionState::Typing | VersionState::Displayed => None,
            };
            element.refresh_current_version();
            (element.conversation_id.clone(), from, previous_offset)
        };

        debug!(element_id = %element_id, version, %from, %to, "version state changed");
        self.bus.publish(CanvasNotification::VersionStateChanged {
            conversation_id,
            element_id,
            version,
            from,
            to,
        });
        Ok(previous_offset)
    }

    /// Hide an element without destroying it
    pub fn archive_element(&self, element_id: Uuid) -> Result<()> {
        let Some(conversation_id) = self.set_archived(element_id, true)? else {
            return Ok(());
        };
        info!(element_id = %element_id, "element archived");
        self.bus.publish(CanvasNotification::ElementArchived {
            conversation_id,
            element_id,
        });
        Ok(())
    }

    /// Undo [`archive_element`](Self::archive_element)
    pub fn restore_element(&self, element_id: Uuid) -> Result<()> {
        let Some(conversation_id) = self.set_archived(element_id, false)? else {
            return Ok(());
        };
        info!(element_id = %element_id, "element restored");
        self.bus.publish(CanvasNotification::ElementRestored {
            conversation_id,
            element_id,
        });
        Ok(())
    }

    /// Returns the conversation when the flag actually changed
    fn set_archived(&self, element_id: Uuid, archived: bool) -> Result<Option<String>> {
        let mut elements = self.write();
        let element = elements
            .get_mut(&element_id)
            .ok_or(Error::ElementNotFound(element_id))?;
        if element.archived == archived {
            return Ok(None);
        }
        element.archived = archived;
        element.updated_at = chrono::Utc::now();
        Ok(Some(element.conversation_id.clone()))
    }

    /// First step of a permanent delete; hand the token back to
    /// [`permanently_delete`](Self::permanently_delete)
    pub fn request_permanent_delete(&self, element_id: Uuid) -> Result<ConfirmationToken> {
        if !self.contains(element_id) {
            return Err(Error::ElementNotFound(element_id));
        }
        let token = ConfirmationToken::generate();
        self.confirmations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(element_id, token);
        Ok(token)
    }

    /// Remove the element for good. Requires the token from
    /// [`request_permanent_delete`](Self::request_permanent_delete).
    pub fn permanently_delete(
        &self,
        element_id: Uuid,
        token: Option<ConfirmationToken>,
    ) -> Result<CanvasElement> {
        {
            let mut confirmations = self
                .confirmations
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match (confirmations.get(&element_id), token) {
                (Some(expected), Some(given)) if *expected == given => {
                    confirmations.remove(&element_id);
                }
                _ => return Err(Error::ConfirmationRequired(element_id)),
            }
        }

        let element = self
            .write()
            .remove(&element_id)
            .ok_or(Error::ElementNotFound(element_id))?;
        info!(element_id = %element_id, "element permanently deleted");
        self.bus.publish(CanvasNotification::ElementDeleted {
            conversation_id: element.conversation_id.clone(),
            element_id,
        });
        Ok(element)
    }

    /// Non-deleted versions, ascending
    pub fn list_active_versions(&self, element_id: Uuid) -> Result<Vec<Version>> {
        self.with_element(element_id, |e| e.active_versions().cloned().collect())
    }

    /// Active version by number; deleted or missing versions are errors
    pub fn active_version(&self, element_id: Uuid, version: u32) -> Result<Version> {
        self.with_element(element_id, |e| match e.version(version) {
            None => Err(Error::VersionNotFound {
                element_id,
                version,
            }),
            Some(v) if v.state == VersionState::Deleted => Err(Error::VersionDeleted {
                element_id,
                version,
            }),
            Some(v) => Ok(v.clone()),
        })?
    }

    /// The version currently in `typing`, if any
    pub fn typing_version(&self, element_id: Uuid) -> Result<Option<u32>> {
        self.with_element(element_id, CanvasElement::typing_version)
    }

    /// Snapshot every element of a conversation, archived ones included
    #[must_use]
    pub fn snapshot(&self, conversation_id: &str) -> ConversationSnapshot {
        let mut snapshot = ConversationSnapshot::new(conversation_id);
        snapshot.elements = self
            .read()
            .values()
            .filter(|e| e.conversation_id == conversation_id)
            .map(|e| (e.id, e.clone()))
            .collect();
        snapshot
    }

    /// Load a persisted snapshot, replacing elements with the same IDs.
    ///
    /// Versions saved mid-reveal come back `frozen`. Returns how many
    /// elements were loaded.
    pub fn load_snapshot(&self, snapshot: ConversationSnapshot) -> usize {
        let mut elements = self.write();
        let count = snapshot.elements.len();
        for (id, mut element) in snapshot.elements {
            for version in &mut element.versions {
                if version.state == VersionState::Typing {
                    version.state = VersionState::Frozen;
                    version.frozen_at = Some(version.frozen_at.unwrap_or(0));
                }
            }
            element.current_version = element.latest_active().map(|v| v.version);
            element.conversation_id.clone_from(&snapshot.conversation_id);
            elements.insert(id, element);
        }
        debug!(conversation_id = %snapshot.conversation_id, count, "snapshot loaded");
        count
    }
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStore")
            .field("elements", &self.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn store() -> VersionStore {
        VersionStore::new(NotificationBus::new(64))
    }

    fn displayed(store: &VersionStore, element: Uuid, content: &str) -> u32 {
        let version = store.add_version(element, content, "test").unwrap();
        store.mark_displayed(element, version).unwrap();
        version
    }

    #[test]
    fn test_numbering_is_contiguous() {
        let store = store();
        let id = store.create_element("conv", ElementKind::Document, "Doc");

        assert_eq!(displayed(&store, id, "A"), 1);
        assert_eq!(displayed(&store, id, "A B"), 2);
        assert_eq!(displayed(&store, id, "A B C"), 3);

        store.delete_version(id, 2).unwrap();
        let numbers: Vec<u32> = store
            .list_active_versions(id)
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, vec![1, 3]);

        // numbers are never reused
        assert_eq!(displayed(&store, id, "A B C D"), 4);
    }

    #[test]
    fn test_deleting_latest_repoints_current() {
        let store = store();
        let id = store.create_element("conv", ElementKind::Document, "Doc");
        displayed(&store, id, "A");
        displayed(&store, id, "AB");

        store.delete_version(id, 2).unwrap();
        assert_eq!(store.get_element(id).unwrap().current_version, Some(1));
    }

    #[test]
    fn test_last_active_version_is_protected() {
        let store = store();
        let id = store.create_element("conv", ElementKind::Document, "Doc");
        displayed(&store, id, "A");
        displayed(&store, id, "AB");
        assert_ok!(store.delete_version(id, 1));

        let err = store.delete_version(id, 2).unwrap_err();
        assert_eq!(err.code(), "last_active_version");

        let err = store.delete_version(id, 1).unwrap_err();
        assert_eq!(err.code(), "version_deleted");
        assert!(store.delete_version(id, 9).unwrap_err().is_not_found());
    }

    #[test]
    fn test_add_rejected_while_typing() {
        let store = store();
        let id = store.create_element("conv", ElementKind::Document, "Doc");
        store.add_version(id, "A", "first").unwrap();

        let err = assert_err!(store.add_version(id, "AB", "second"));
        assert!(matches!(err, Error::VersionStillTyping { version: 1, .. }));

        store.freeze(id, 1, 0).unwrap();
        assert_eq!(store.add_version(id, "AB", "second").unwrap(), 2);
    }

    #[test]
    fn test_freeze_and_resume() {
        let store = store();
        let id = store.create_element("conv", ElementKind::Document, "Doc");
        store.add_version(id, "hello world", "v1").unwrap();

        store.freeze(id, 1, 5).unwrap();
        let version = store.active_version(id, 1).unwrap();
        assert_eq!(version.state, VersionState::Frozen);
        assert_eq!(version.frozen_at, Some(5));

        assert_eq!(store.resume(id, 1).unwrap(), 5);
        assert_eq!(store.typing_version(id).unwrap(), Some(1));

        store.mark_displayed(id, 1).unwrap();
        let err = store.resume(id, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: VersionState::Displayed,
                to: VersionState::Typing,
                ..
            }
        ));
    }

    #[test]
    fn test_resume_refused_while_another_version_types() {
        let store = store();
        let id = store.create_element("conv", ElementKind::Document, "Doc");
        store.add_version(id, "A", "v1").unwrap();
        store.freeze(id, 1, 0).unwrap();
        store.add_version(id, "AB", "v2").unwrap();

        assert!(matches!(
            store.resume(id, 1),
            Err(Error::VersionStillTyping { version: 2, .. })
        ));
    }

    #[test]
    fn test_permanent_delete_requires_token() {
        let store = store();
        let id = store.create_element("conv", ElementKind::Document, "Doc");

        let err = store.permanently_delete(id, None).unwrap_err();
        assert!(err.is_user_visible());

        let token = store.request_permanent_delete(id).unwrap();
        let wrong = ConfirmationToken::from(Uuid::new_v4());
        assert!(store.permanently_delete(id, Some(wrong)).is_err());

        let removed = store.permanently_delete(id, Some(token)).unwrap();
        assert_eq!(removed.id, id);
        assert!(!store.contains(id));
    }

    #[test]
    fn test_archive_hides_from_listing() {
        let store = store();
        let id = store.create_element("conv", ElementKind::Document, "Doc");
        store.archive_element(id).unwrap();

        assert!(store.elements_for("conv", false).is_empty());
        assert_eq!(store.elements_for("conv", true).len(), 1);
        assert!(matches!(
            store.add_version(id, "A", "x"),
            Err(Error::ElementArchived(_))
        ));

        store.restore_element(id).unwrap();
        assert_eq!(store.elements_for("conv", false).len(), 1);
    }

    #[test]
    fn test_snapshot_load_freezes_typing_versions() {
        let source = store();
        let id = source.create_element("conv", ElementKind::Document, "Doc");
        displayed(&source, id, "A");
        source.add_version(id, "A B", "v2").unwrap();
        let snapshot = source.snapshot("conv");
        assert_eq!(snapshot.elements.len(), 1);

        let target = store();
        assert_eq!(target.load_snapshot(snapshot), 1);
        let element = target.get_element(id).unwrap();
        assert_eq!(element.versions[1].state, VersionState::Frozen);
        assert_eq!(element.versions[1].frozen_at, Some(0));
        assert_eq!(element.typing_version(), None);
        assert!(target.has_conversation("conv"));
    }

    #[test]
    fn test_concurrent_appends_leave_one_typing() {
        let store = Arc::new(store());
        let id = store.create_element("conv", ElementKind::Document, "Doc");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.add_version(id, format!("content {i}"), "race"))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let element = store.get_element(id).unwrap();
        assert_eq!(
            element
                .versions
                .iter()
                .filter(|v| v.state == VersionState::Typing)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_transitions_publish_notifications() {
        let bus = NotificationBus::new(16);
        let mut rx = bus.subscribe();
        let store = VersionStore::new(bus);
        let id = store.create_element("conv", ElementKind::Document, "Doc");

        store.add_version(id, "A", "v1").unwrap();
        store.mark_displayed(id, 1).unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), "version_added");
        match rx.recv().await.unwrap() {
            CanvasNotification::VersionStateChanged { from, to, .. } => {
                assert_eq!(from, VersionState::Typing);
                assert_eq!(to, VersionState::Displayed);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }
}
