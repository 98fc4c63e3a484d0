//! Scroll-follow
//!
//! Keeps a host viewport pinned to the bottom of content that grows during a
//! reveal, until the user scrolls away.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;
use uuid::Uuid;

/// Scrollable area owned by the host UI
#[cfg_attr(test, mockall::automock)]
pub trait ScrollViewport: Send {
    /// Current scroll offset from the top
    fn scroll_top(&self) -> f64;
    /// Total content height
    fn scroll_height(&self) -> f64;
    /// Visible height
    fn client_height(&self) -> f64;
    /// Scroll to `offset`
    fn set_scroll_top(&mut self, offset: f64);
}

fn bottom_of(viewport: &dyn ScrollViewport) -> f64 {
    (viewport.scroll_height() - viewport.client_height()).max(0.0)
}

struct FollowEntry {
    viewport: Option<Box<dyn ScrollViewport>>,
    following: bool,
    revealing: bool,
    saved_offset: Option<f64>,
    last_programmatic: Option<f64>,
}

impl Default for FollowEntry {
    fn default() -> Self {
        Self {
            viewport: None,
            following: true,
            revealing: false,
            saved_offset: None,
            last_programmatic: None,
        }
    }
}

impl FollowEntry {
    fn pin_to_bottom(&mut self) {
        if !(self.revealing && self.following) {
            return;
        }
        if let Some(viewport) = self.viewport.as_mut() {
            let bottom = bottom_of(viewport.as_ref());
            viewport.set_scroll_top(bottom);
            self.last_programmatic = Some(bottom);
        }
    }
}

/// Per-element scroll-follow state
pub struct ScrollFollowController {
    threshold: f64,
    entries: Mutex<HashMap<Uuid, FollowEntry>>,
}

impl ScrollFollowController {
    /// Create a controller; within `threshold` pixels of the bottom counts
    /// as "at the bottom"
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.max(0.0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, FollowEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Show the element in `viewport`, restoring its last offset
    pub fn attach(&self, element_id: Uuid, mut viewport: Box<dyn ScrollViewport>) {
        let mut entries = self.entries();
        let entry = entries.entry(element_id).or_default();
        if let Some(offset) = entry.saved_offset {
            viewport.set_scroll_top(offset);
            entry.last_programmatic = Some(offset);
        }
        entry.viewport = Some(viewport);
        entry.pin_to_bottom();
    }

    /// Hide the element, remembering its offset. Returns the viewport.
    pub fn detach(&self, element_id: Uuid) -> Option<Box<dyn ScrollViewport>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(&element_id)?;
        let viewport = entry.viewport.take()?;
        entry.saved_offset = Some(viewport.scroll_top());
        entry.last_programmatic = None;
        Some(viewport)
    }

    /// A reveal for the element started. Follows from the bottom unless the
    /// user scrolled away; that stays in effect until they return.
    pub fn begin_follow(&self, element_id: Uuid) {
        let mut entries = self.entries();
        let entry = entries.entry(element_id).or_default();
        entry.revealing = true;
        entry.pin_to_bottom();
    }

    /// The reveal ended; stop reacting to growth
    pub fn end_follow(&self, element_id: Uuid) {
        if let Some(entry) = self.entries().get_mut(&element_id) {
            entry.revealing = false;
        }
    }

    /// Visible text grew
    pub fn content_grew(&self, element_id: Uuid) {
        if let Some(entry) = self.entries().get_mut(&element_id) {
            entry.pin_to_bottom();
        }
    }

    /// Host reports a layout change (images loaded, resize)
    pub fn layout_changed(&self, element_id: Uuid) {
        self.content_grew(element_id);
    }

    /// Host reports a scroll event on the element's viewport
    pub fn user_scrolled(&self, element_id: Uuid) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&element_id) else {
            return;
        };
        let Some(viewport) = entry.viewport.as_ref() else {
            return;
        };

        let top = viewport.scroll_top();
        if entry
            .last_programmatic
            .take()
            .is_some_and(|offset| (offset - top).abs() < f64::EPSILON)
        {
            return;
        }

        let distance = bottom_of(viewport.as_ref()) - top;
        let following = distance <= self.threshold;
        if following != entry.following {
            debug!(element_id = %element_id, following, distance, "scroll-follow toggled");
        }
        entry.following = following;
    }

    /// Whether the element's viewport is following growth
    #[must_use]
    pub fn is_following(&self, element_id: Uuid) -> bool {
        self.entries()
            .get(&element_id)
            .is_some_and(|e| e.revealing && e.following)
    }

    /// Offset remembered on the last detach
    #[must_use]
    pub fn saved_offset(&self, element_id: Uuid) -> Option<f64> {
        self.entries().get(&element_id).and_then(|e| e.saved_offset)
    }

    /// Drop all state for the element
    pub fn forget(&self, element_id: Uuid) {
        self.entries().remove(&element_id);
    }
}

impl Default for ScrollFollowController {
    fn default() -> Self {
        Self::new(24.0)
    }
}

impl std::fmt::Debug for ScrollFollowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrollFollowController")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}
