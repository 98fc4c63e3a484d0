//! Delta calculation
//!
//! Versions store cumulative content. What gets animated is only the part a
//! version adds on top of the previous active version.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::document::Version;

/// How a delta relates to the previous version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// First active version; the delta is the whole content
    Initial,
    /// Previous content is a literal prefix; the delta is the remainder
    Appended,
    /// Previous content is not a prefix; the delta falls back to the whole content
    Rewritten,
}

/// New content introduced by a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Version the delta belongs to
    pub version: u32,
    /// Text to reveal
    pub text: String,
    /// Whitespace trimmed between the previous content and `text`
    pub separator: String,
    /// Relation to the previous version
    pub kind: DeltaKind,
}

impl Delta {
    /// True when the producer did not append to the previous version
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.kind == DeltaKind::Rewritten
    }

    /// Content visible before the reveal starts, given the previous version
    #[must_use]
    pub fn base(&self, previous: Option<&str>) -> String {
        match (self.kind, previous) {
            (DeltaKind::Appended, Some(prev)) => format!("{prev}{}", self.separator),
            _ => String::new(),
        }
    }

    /// Rebuild the cumulative content from the previous version's content
    #[must_use]
    pub fn reconstruct(&self, previous: Option<&str>) -> String {
        let mut out = self.base(previous);
        out.push_str(&self.text);
        out
    }
}

/// Delta of the active version at `index`
///
/// `versions` must be the active (non-deleted) versions in ascending order.
#[must_use]
pub fn compute_delta(versions: &[Version], index: usize) -> Option<Delta> {
    let current = versions.get(index)?;
    let Some(previous) = index.checked_sub(1).and_then(|i| versions.get(i)) else {
        return Some(Delta {
            version: current.version,
            text: current.content.clone(),
            separator: String::new(),
            kind: DeltaKind::Initial,
        });
    };

    match current.content.strip_prefix(previous.content.as_str()) {
        Some(rest) => {
            let text = rest.trim_start();
            let separator = &rest[..rest.len() - text.len()];
            Some(Delta {
                version: current.version,
                text: text.to_string(),
                separator: separator.to_string(),
                kind: DeltaKind::Appended,
            })
        }
        None => Some(Delta {
            version: current.version,
            text: current.content.clone(),
            separator: String::new(),
            kind: DeltaKind::Rewritten,
        }),
    }
}

/// Delta of a specific version number within the active list
#[must_use]
pub fn delta_for_version(versions: &[Version], version: u32) -> Option<Delta> {
    let index = versions.iter().position(|v| v.version == version)?;
    compute_delta(versions, index)
}

/// Computes deltas and keeps count of rewrite fallbacks per element
#[derive(Debug, Default)]
pub struct DeltaCalculator {
    inconsistencies: Mutex<HashMap<Uuid, u32>>,
}

impl DeltaCalculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta of `version`, recording a fallback when the prefix relation breaks
    pub fn delta(&self, element_id: Uuid, versions: &[Version], version: u32) -> Option<Delta> {
        let delta = delta_for_version(versions, version)?;
        if delta.is_fallback() {
            let occurrences = self.record_inconsistency(element_id);
            warn!(
                element_id = %element_id,
                version,
                occurrences,
                "version does not extend its predecessor; revealing full content"
            );
        }
        Some(delta)
    }

    /// How many fallbacks the element has produced so far
    #[must_use]
    pub fn inconsistency_count(&self, element_id: Uuid) -> u32 {
        let counts = self
            .inconsistencies
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        counts.get(&element_id).copied().unwrap_or(0)
    }

    /// Drop the counter for a removed element
    pub fn forget(&self, element_id: Uuid) {
        let mut counts = self
            .inconsistencies
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        counts.remove(&element_id);
    }

    fn record_inconsistency(&self, element_id: Uuid) -> u32 {
        let mut counts = self
            .inconsistencies
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(element_id).or_insert(0);
        *count += 1;
        *count
    }
}
