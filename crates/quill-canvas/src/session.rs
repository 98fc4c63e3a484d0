//! Canvas Session Management
//!
//! [`CanvasSessionManager`] is the per-process facade over the engine. It
//! turns producer appends into versions, plays their deltas through the
//! reveal engine, keeps the visible buffers and scroll-follow in sync, and
//! settles versions when a reveal ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};
use uuid::Uuid;

use crate::binding::{BindingChange, ConversationBinding};
use crate::config::CanvasConfig;
use crate::delta::{delta_for_version, Delta, DeltaCalculator};
use crate::document::{CanvasElement, ElementKind, VersionState};
use crate::error::{Error, Result};
use crate::events::{CanvasNotification, NotificationBus};
use crate::export::{ExportAdapter, ExportFormat, ExportScope, ExportedDocument};
use crate::protocol::{CanvasCommand, CommandOutcome};
use crate::reveal::{
    CancelReason, RevealCallbacks, RevealEngine, RevealOutcome, RevealPhase, RevealRequest,
    RevealStart, RevealSummary,
};
use crate::scheduler::{TickHandle, TickScheduler};
use crate::scroll::ScrollFollowController;
use crate::store::CanvasPersistence;
use crate::versions::{ConfirmationToken, VersionStore};

/// What [`CanvasSessionManager::append_content`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Assigned version
    pub version: u32,
    /// Delta being revealed
    pub delta: Delta,
    /// What the reveal engine did
    pub reveal: RevealStart,
}

/// What [`CanvasSessionManager::switch_conversation`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    /// Previously active conversation
    pub previous: Option<String>,
    /// False when the target was already active
    pub changed: bool,
    /// Elements loaded from persistence
    pub loaded: usize,
}

/// Text visible for the element being revealed
#[derive(Debug, Clone)]
struct VisibleBuffer {
    version: u32,
    base: String,
    revealed: String,
}

/// Pending reveals per conversation, with their watchdogs
#[derive(Default)]
struct TurnTracker {
    pending: Mutex<HashMap<String, HashMap<Uuid, TickHandle>>>,
}

impl TurnTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<Uuid, TickHandle>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, conversation_id: &str, element_id: Uuid, watchdog: TickHandle) {
        let previous = self
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .insert(element_id, watchdog);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Returns true when this was the conversation's last pending reveal
    fn finish(&self, conversation_id: &str, element_id: Uuid) -> bool {
        let mut pending = self.lock();
        let Some(elements) = pending.get_mut(conversation_id) else {
            return false;
        };
        let Some(watchdog) = elements.remove(&element_id) else {
            return false;
        };
        watchdog.cancel();
        if elements.is_empty() {
            pending.remove(conversation_id);
            return true;
        }
        false
    }

    /// Returns true when anything was pending
    fn clear(&self, conversation_id: &str) -> bool {
        let Some(elements) = self.lock().remove(conversation_id) else {
            return false;
        };
        for watchdog in elements.values() {
            watchdog.cancel();
        }
        true
    }

    fn is_loading(&self, conversation_id: &str) -> bool {
        self.lock().contains_key(conversation_id)
    }
}

/// State shared with reveal callbacks and watchdogs
#[derive(Clone)]
struct RevealSink {
    store: Arc<VersionStore>,
    bus: NotificationBus,
    scroll: Arc<ScrollFollowController>,
    buffers: Arc<Mutex<HashMap<Uuid, VisibleBuffer>>>,
    turns: Arc<TurnTracker>,
}

impl RevealSink {
    fn buffers(&self) -> MutexGuard<'_, HashMap<Uuid, VisibleBuffer>> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn progress(
        &self,
        conversation_id: &str,
        element_id: Uuid,
        version: u32,
        total_chars: usize,
        revealed: &str,
    ) {
        if let Some(buffer) = self.buffers().get_mut(&element_id) {
            if buffer.version == version {
                buffer.revealed = revealed.to_string();
            }
        }
        self.scroll.content_grew(element_id);
        self.bus.publish(CanvasNotification::RevealProgress {
            conversation_id: conversation_id.to_string(),
            element_id,
            version,
            revealed: revealed.to_string(),
            revealed_chars: revealed.chars().count(),
            total_chars,
        });
    }

    fn complete(&self, conversation_id: &str, summary: &RevealSummary) {
        let RevealSummary {
            element_id,
            version,
            outcome,
            revealed_chars,
            ..
        } = *summary;

        let settled = if outcome.is_finalized() {
            self.store
                .mark_displayed(element_id, version)
                .and_then(|()| self.settle_earlier_frozen(element_id, version))
        } else {
            self.store.freeze(element_id, version, revealed_chars)
        };
        if let Err(e) = settled {
            warn!(element_id = %element_id, version, error = %e, "could not settle version after reveal");
        }

        self.scroll.end_follow(element_id);
        info!(element_id = %element_id, version, ?outcome, revealed_chars, "reveal complete");
        self.bus.publish(CanvasNotification::RevealComplete {
            conversation_id: conversation_id.to_string(),
            element_id,
            version,
            outcome,
        });

        if outcome.is_finalized() {
            self.publish_ready_if_displayed(element_id);
        }

        // a superseding reveal takes over the turn entry
        if outcome != RevealOutcome::Cancelled(CancelReason::Superseded)
            && self.turns.finish(conversation_id, element_id)
        {
            self.bus.publish(CanvasNotification::AllRevealsComplete {
                conversation_id: conversation_id.to_string(),
            });
        }
    }

    /// Frozen versions older than a displayed one are covered by its
    /// cumulative content
    fn settle_earlier_frozen(&self, element_id: Uuid, version: u32) -> Result<()> {
        let frozen: Vec<u32> = self
            .store
            .list_active_versions(element_id)?
            .into_iter()
            .filter(|v| v.version < version && v.state == VersionState::Frozen)
            .map(|v| v.version)
            .collect();
        for earlier in frozen {
            self.store.mark_displayed(element_id, earlier)?;
        }
        Ok(())
    }

    fn publish_ready_if_displayed(&self, element_id: Uuid) {
        let ready = self.store.with_element(element_id, |element| {
            if !element.is_fully_displayed() {
                return None;
            }
            element.latest_active().map(|latest| CanvasNotification::ElementReady {
                conversation_id: element.conversation_id.clone(),
                element_id,
                version: latest.version,
                title: element.title.clone(),
                content: latest.content.clone(),
            })
        });
        if let Ok(Some(notification)) = ready {
            self.bus.publish(notification);
        }
    }

    fn timed_out(&self, reveal: &RevealEngine, conversation_id: &str, element_id: Uuid) {
        warn!(element_id = %element_id, conversation_id = %conversation_id, "reveal stuck; cancelling");
        reveal.cancel_with(element_id, CancelReason::TimedOut);
        // completion usually finished the turn already; other reveals keep theirs
        if self.turns.finish(conversation_id, element_id) {
            self.bus.publish(CanvasNotification::AllRevealsComplete {
                conversation_id: conversation_id.to_string(),
            });
        }
    }
}

/// Per-process canvas engine facade
pub struct CanvasSessionManager {
    config: CanvasConfig,
    store: Arc<VersionStore>,
    deltas: DeltaCalculator,
    reveal: RevealEngine,
    scheduler: Arc<dyn TickScheduler>,
    binding: ConversationBinding,
    exporter: ExportAdapter,
    sink: RevealSink,
    persistence: Option<Arc<dyn CanvasPersistence>>,
}

impl CanvasSessionManager {
    /// Create a manager driving reveals on `scheduler`
    #[must_use]
    pub fn new(config: CanvasConfig, scheduler: Arc<dyn TickScheduler>) -> Self {
        let bus = NotificationBus::new(config.notification_capacity);
        let store = Arc::new(VersionStore::new(bus.clone()));
        let scroll = Arc::new(ScrollFollowController::new(
            config.scroll.follow_threshold_px,
        ));
        Self {
            reveal: RevealEngine::new(Arc::clone(&scheduler)),
            deltas: DeltaCalculator::new(),
            binding: ConversationBinding::new(),
            exporter: ExportAdapter::new(),
            sink: RevealSink {
                store: Arc::clone(&store),
                bus,
                scroll,
                buffers: Arc::new(Mutex::new(HashMap::new())),
                turns: Arc::new(TurnTracker::default()),
            },
            store,
            scheduler,
            config,
            persistence: None,
        }
    }

    /// Persist snapshots through `persistence`
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn CanvasPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Use a custom export adapter
    #[must_use]
    pub fn with_exporter(mut self, exporter: ExportAdapter) -> Self {
        self.exporter = exporter;
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &CanvasConfig {
        &self.config
    }

    /// The version store
    #[must_use]
    pub fn store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    /// The reveal engine
    #[must_use]
    pub fn reveal(&self) -> &RevealEngine {
        &self.reveal
    }

    /// The scroll-follow controller; hosts attach viewports here
    #[must_use]
    pub fn scroll(&self) -> &Arc<ScrollFollowController> {
        &self.sink.scroll
    }

    /// The notification bus
    #[must_use]
    pub fn bus(&self) -> &NotificationBus {
        &self.sink.bus
    }

    /// Subscribe to notifications
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CanvasNotification> {
        self.sink.bus.subscribe()
    }

    /// Currently bound conversation
    #[must_use]
    pub fn active_conversation(&self) -> Option<String> {
        self.binding.active()
    }

    /// Whether any reveal of the conversation is still pending
    #[must_use]
    pub fn is_loading(&self, conversation_id: &str) -> bool {
        self.sink.turns.is_loading(conversation_id)
    }

    /// How many times the element's versions failed to extend their predecessor
    #[must_use]
    pub fn inconsistency_count(&self, element_id: Uuid) -> u32 {
        self.deltas.inconsistency_count(element_id)
    }

    /// Create an element in `conversation_id`
    pub fn create_element(
        &self,
        conversation_id: impl Into<String>,
        kind: ElementKind,
        title: impl Into<String>,
    ) -> Uuid {
        self.store.create_element(conversation_id, kind, title)
    }

    /// Store `content` as a new version and reveal what it adds.
    ///
    /// A version still typing is cut short first and stays `frozen`.
    pub fn append_content(
        &self,
        element_id: Uuid,
        content: impl Into<String>,
        request: impl Into<String>,
    ) -> Result<AppendOutcome> {
        let conversation_id = self
            .store
            .with_element(element_id, |e| e.conversation_id.clone())?;

        if let Some(stale) = self.store.typing_version(element_id)? {
            if self
                .reveal
                .cancel_with(element_id, CancelReason::Superseded)
                .is_none()
            {
                self.store.freeze(element_id, stale, 0)?;
            }
        }

        let version = self.store.add_version(element_id, content, request)?;
        let (delta, base) = self.delta_and_base(element_id, version, true)?;

        if delta.is_fallback() {
            self.sink.bus.publish(CanvasNotification::DeltaInconsistency {
                conversation_id: conversation_id.clone(),
                element_id,
                version,
                occurrences: self.deltas.inconsistency_count(element_id),
            });
        }

        let reveal = self.start_reveal(&conversation_id, element_id, version, &delta.text, base, 0);
        Ok(AppendOutcome {
            version,
            delta,
            reveal,
        })
    }

    /// Delta of `version` and the text visible before it. `record` counts a
    /// rewrite fallback; only a freshly appended version should.
    fn delta_and_base(
        &self,
        element_id: Uuid,
        version: u32,
        record: bool,
    ) -> Result<(Delta, String)> {
        let active = self.store.list_active_versions(element_id)?;
        let delta = if record {
            self.deltas.delta(element_id, &active, version)
        } else {
            delta_for_version(&active, version)
        };
        let delta = delta.ok_or(Error::VersionNotFound {
                element_id,
                version,
            })?;
        let previous = active
            .iter()
            .take_while(|v| v.version != version)
            .last()
            .map(|v| v.content.as_str());
        let base = delta.base(previous);
        Ok((delta, base))
    }

    fn start_reveal(
        &self,
        conversation_id: &str,
        element_id: Uuid,
        version: u32,
        text: &str,
        base: String,
        start_at: usize,
    ) -> RevealStart {
        match self.reveal.phase(element_id, version) {
            RevealPhase::Running => return RevealStart::AlreadyRunning,
            RevealPhase::Completed | RevealPhase::Skipped => return RevealStart::AlreadyRevealed,
            RevealPhase::Idle | RevealPhase::Cancelled => {}
        }

        let total_chars = text.chars().count();
        let already_visible: String = text.chars().take(start_at).collect();
        self.sink.buffers().insert(
            element_id,
            VisibleBuffer {
                version,
                base,
                revealed: already_visible,
            },
        );

        self.sink.bus.publish(CanvasNotification::RevealStarted {
            conversation_id: conversation_id.to_string(),
            element_id,
            version,
            total_chars,
        });
        self.sink.scroll.begin_follow(element_id);

        let watchdog = {
            let sink = self.sink.clone();
            let reveal = self.reveal.clone();
            let conversation_id = conversation_id.to_string();
            self.scheduler.schedule(
                self.config.reveal.stuck_timeout(),
                Box::new(move || sink.timed_out(&reveal, &conversation_id, element_id)),
            )
        };
        self.sink.turns.begin(conversation_id, element_id, watchdog);

        let callbacks = {
            let progress_sink = self.sink.clone();
            let complete_sink = self.sink.clone();
            let progress_conversation = conversation_id.to_string();
            let complete_conversation = conversation_id.to_string();
            RevealCallbacks::new(
                move |revealed| {
                    progress_sink.progress(
                        &progress_conversation,
                        element_id,
                        version,
                        total_chars,
                        revealed,
                    );
                },
                move |summary| complete_sink.complete(&complete_conversation, summary),
            )
        };

        let request = RevealRequest::new(element_id, version, text)
            .with_speed(self.config.reveal.speed())
            .starting_at(start_at);
        self.reveal.start(request, callbacks)
    }

    /// Finish the element's reveal at once. A frozen version is shown in
    /// full. Returns false when there was nothing to finish.
    pub fn skip_reveal(&self, element_id: Uuid) -> Result<bool> {
        let element = self.store.get_element(element_id)?;
        if self.reveal.skip(element_id).is_some() {
            return Ok(true);
        }

        let frozen: Vec<u32> = element
            .active_versions()
            .filter(|v| v.state == VersionState::Frozen)
            .map(|v| v.version)
            .collect();
        if frozen.is_empty() {
            return Ok(false);
        }
        for version in &frozen {
            self.store.mark_displayed(element_id, *version)?;
        }
        self.sink.buffers().remove(&element_id);
        self.sink.publish_ready_if_displayed(element_id);
        Ok(true)
    }

    /// Halt the element's reveal; the version stays `frozen`
    pub fn cancel_reveal(&self, element_id: Uuid) -> Result<Option<RevealSummary>> {
        if !self.store.contains(element_id) {
            return Err(Error::ElementNotFound(element_id));
        }
        Ok(self.reveal.cancel(element_id))
    }

    /// Halt every running reveal. Returns how many were running.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.reveal.cancel_all();
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "cancelled all reveals");
        }
        cancelled.len()
    }

    /// Continue a frozen version from where it stopped
    pub fn resume_reveal(&self, element_id: Uuid, version: u32) -> Result<(usize, RevealStart)> {
        let conversation_id = self
            .store
            .with_element(element_id, |e| e.conversation_id.clone())?;
        let from = self.store.resume(element_id, version)?;
        let (delta, base) = self.delta_and_base(element_id, version, false)?;
        let start = self.start_reveal(&conversation_id, element_id, version, &delta.text, base, from);
        Ok((from, start))
    }

    /// Soft-delete a version, cutting its reveal short first
    pub fn delete_version(&self, element_id: Uuid, version: u32) -> Result<()> {
        if self.store.typing_version(element_id)? == Some(version) {
            self.reveal.cancel(element_id);
        }
        self.store.delete_version(element_id, version)?;
        let mut buffers = self.sink.buffers();
        if buffers.get(&element_id).is_some_and(|b| b.version == version) {
            buffers.remove(&element_id);
        }
        Ok(())
    }

    /// Hide an element; a running reveal is cancelled
    pub fn archive_element(&self, element_id: Uuid) -> Result<()> {
        if !self.store.contains(element_id) {
            return Err(Error::ElementNotFound(element_id));
        }
        self.reveal.cancel(element_id);
        self.store.archive_element(element_id)
    }

    /// Unhide an element
    pub fn restore_element(&self, element_id: Uuid) -> Result<()> {
        self.store.restore_element(element_id)
    }

    /// First step of a permanent delete
    pub fn request_permanent_delete(&self, element_id: Uuid) -> Result<ConfirmationToken> {
        self.store.request_permanent_delete(element_id)
    }

    /// Destroy an element and every piece of state about it.
    ///
    /// With persistence configured, the owning conversation's snapshot is
    /// rewritten so a later load cannot bring the element back.
    pub async fn permanently_delete(
        &self,
        element_id: Uuid,
        token: Option<ConfirmationToken>,
    ) -> Result<CanvasElement> {
        let element = self.store.permanently_delete(element_id, token)?;
        self.reveal.cancel(element_id);
        self.reveal.forget(element_id);
        self.deltas.forget(element_id);
        self.sink.scroll.forget(element_id);
        self.sink.buffers().remove(&element_id);

        if let Some(persistence) = &self.persistence {
            let snapshot = self.store.snapshot(&element.conversation_id);
            if let Err(e) = persistence.save(&snapshot).await {
                warn!(element_id = %element_id, conversation_id = %element.conversation_id, error = %e, "deleted element is still in the saved snapshot");
                return Err(e);
            }
        }
        Ok(element)
    }

    /// Export one version
    pub fn export_version(
        &self,
        element_id: Uuid,
        version: u32,
        scope: ExportScope,
        format: ExportFormat,
    ) -> Result<ExportedDocument> {
        self.exporter
            .export_version(&self.store, element_id, version, scope, format)
    }

    /// Export the latest full document
    pub fn export_all(&self, element_id: Uuid, format: ExportFormat) -> Result<ExportedDocument> {
        self.exporter.export_all(&self.store, element_id, format)
    }

    /// Text the user currently sees for the element
    pub fn visible_text(&self, element_id: Uuid) -> Result<String> {
        let element = self.store.get_element(element_id)?;
        let Some(latest) = element.latest_active() else {
            return Ok(String::new());
        };

        match latest.state {
            VersionState::Typing => {
                if let Some(buffer) = self
                    .sink
                    .buffers()
                    .get(&element_id)
                    .filter(|b| b.version == latest.version)
                {
                    return Ok(format!("{}{}", buffer.base, buffer.revealed));
                }
                self.partial_text(element_id, latest.version, 0)
            }
            VersionState::Frozen => {
                self.partial_text(element_id, latest.version, latest.frozen_at.unwrap_or(0))
            }
            VersionState::Displayed | VersionState::Deleted => Ok(latest.content.clone()),
        }
    }

    fn partial_text(&self, element_id: Uuid, version: u32, chars: usize) -> Result<String> {
        let (delta, mut text) = self.delta_and_base(element_id, version, false)?;
        text.extend(delta.text.chars().take(chars));
        Ok(text)
    }

    /// Visible elements of the active conversation
    pub fn live_view(&self) -> Result<Vec<CanvasElement>> {
        let conversation_id = self.binding.require_active()?;
        Ok(self.store.elements_for(&conversation_id, false))
    }

    /// Rebind the live view to `conversation_id`.
    ///
    /// With persistence configured, the previous conversation is saved and
    /// the target is loaded if it is not in memory yet. Reveals of other
    /// conversations keep running. A failed load leaves the binding as it was.
    pub async fn switch_conversation(&self, conversation_id: &str) -> Result<SwitchOutcome> {
        let unchanged = |loaded| SwitchOutcome {
            previous: Some(conversation_id.to_string()),
            changed: false,
            loaded,
        };
        if self.binding.is_active(conversation_id) {
            return Ok(unchanged(0));
        }

        let mut loaded = 0;
        if let Some(persistence) = &self.persistence {
            if let Some(previous) = self.binding.active() {
                if let Err(e) = persistence.save(&self.store.snapshot(&previous)).await {
                    warn!(conversation_id = %previous, error = %e, "failed to save snapshot on switch");
                }
            }
            if !self.store.has_conversation(conversation_id) {
                if let Some(snapshot) = persistence.load(conversation_id).await? {
                    loaded = self.store.load_snapshot(snapshot);
                }
            }
        }

        let previous = match self.binding.switch_to(conversation_id) {
            BindingChange::Unchanged => return Ok(unchanged(loaded)),
            BindingChange::Switched { previous } => previous,
        };
        self.sink.bus.publish(CanvasNotification::ConversationSwitched {
            previous: previous.clone(),
            conversation_id: conversation_id.to_string(),
        });
        Ok(SwitchOutcome {
            previous,
            changed: true,
            loaded,
        })
    }

    /// Save the conversation's snapshot. Returns false without persistence.
    pub async fn save_conversation(&self, conversation_id: &str) -> Result<bool> {
        let Some(persistence) = &self.persistence else {
            return Ok(false);
        };
        persistence
            .save(&self.store.snapshot(conversation_id))
            .await?;
        Ok(true)
    }

    /// Run a command
    pub async fn execute(&self, command: CanvasCommand) -> Result<CommandOutcome> {
        match command {
            CanvasCommand::CreateElement {
                conversation_id,
                kind,
                title,
            } => {
                let conversation_id = match conversation_id {
                    Some(id) => id,
                    None => self.binding.require_active()?,
                };
                let element_id = self.create_element(conversation_id, kind, title);
                Ok(CommandOutcome::ElementCreated { element_id })
            }
            CanvasCommand::AppendContent {
                element_id,
                content,
                request,
            } => {
                let appended = self.append_content(element_id, content, request)?;
                Ok(CommandOutcome::VersionAdded {
                    element_id,
                    version: appended.version,
                    delta_kind: appended.delta.kind,
                    reveal: appended.reveal,
                })
            }
            CanvasCommand::Skip { element_id } => Ok(CommandOutcome::Skipped {
                element_id,
                changed: self.skip_reveal(element_id)?,
            }),
            CanvasCommand::Cancel { element_id } => Ok(CommandOutcome::Cancelled {
                element_id,
                revealed_chars: self.cancel_reveal(element_id)?.map(|s| s.revealed_chars),
            }),
            CanvasCommand::CancelAll => Ok(CommandOutcome::CancelledAll {
                count: self.cancel_all(),
            }),
            CanvasCommand::Resume {
                element_id,
                version,
            } => {
                let (from_chars, reveal) = self.resume_reveal(element_id, version)?;
                Ok(CommandOutcome::Resumed {
                    element_id,
                    version,
                    from_chars,
                    reveal,
                })
            }
            CanvasCommand::DeleteVersion {
                element_id,
                version,
            } => {
                self.delete_version(element_id, version)?;
                Ok(CommandOutcome::VersionDeleted {
                    element_id,
                    version,
                })
            }
            CanvasCommand::Archive { element_id } => {
                self.archive_element(element_id)?;
                Ok(CommandOutcome::Archived { element_id })
            }
            CanvasCommand::Restore { element_id } => {
                self.restore_element(element_id)?;
                Ok(CommandOutcome::Restored { element_id })
            }
            CanvasCommand::RequestPermanentDelete { element_id } => {
                Ok(CommandOutcome::DeleteRequested {
                    element_id,
                    token: self.request_permanent_delete(element_id)?,
                })
            }
            CanvasCommand::PermanentlyDelete { element_id, token } => {
                self.permanently_delete(element_id, token).await?;
                Ok(CommandOutcome::Deleted { element_id })
            }
            CanvasCommand::ExportVersion {
                element_id,
                version,
                scope,
                format,
            } => Ok(CommandOutcome::Exported {
                document: self.export_version(element_id, version, scope, format)?,
            }),
            CanvasCommand::ExportAll { element_id, format } => Ok(CommandOutcome::Exported {
                document: self.export_all(element_id, format)?,
            }),
            CanvasCommand::SwitchConversation { conversation_id } => {
                let switched = self.switch_conversation(&conversation_id).await?;
                Ok(CommandOutcome::Switched {
                    previous: switched.previous,
                    conversation_id,
                    changed: switched.changed,
                    loaded: switched.loaded,
                })
            }
            CanvasCommand::ListElements {
                conversation_id,
                include_archived,
            } => {
                let conversation_id = match conversation_id {
                    Some(id) => id,
                    None => self.binding.require_active()?,
                };
                Ok(CommandOutcome::Elements {
                    elements: self.store.elements_for(&conversation_id, include_archived),
                })
            }
        }
    }
}

impl std::fmt::Debug for CanvasSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasSessionManager")
            .field("active", &self.binding.active())
            .field("reveal", &self.reveal)
            .field("persistence", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::scroll::ScrollViewport;
    use crate::store::{MockCanvasPersistence, SqliteCanvasStore};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn setup() -> (ManualScheduler, CanvasSessionManager) {
        let scheduler = ManualScheduler::new();
        let mut config = CanvasConfig::default();
        config.reveal.chars_per_tick = 4;
        config.reveal.tick_interval_ms = 10;
        config.reveal.stuck_timeout_secs = 1;
        let manager = CanvasSessionManager::new(config, Arc::new(scheduler.clone()));
        (scheduler, manager)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<CanvasNotification>) -> Vec<CanvasNotification> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(n) => out.push(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
        out
    }

    async fn memory_store() -> Arc<SqliteCanvasStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteCanvasStore::new(pool);
        store.init().await.unwrap();
        Arc::new(store)
    }

    /// 400px-high viewport over content whose height the test grows
    #[derive(Clone)]
    struct Viewport(Arc<Mutex<(f64, f64)>>);

    impl Viewport {
        fn new() -> Self {
            Self(Arc::new(Mutex::new((0.0, 400.0))))
        }
        fn grow(&self, by: f64) {
            self.0.lock().unwrap().1 += by;
        }
        fn scroll_to(&self, top: f64) {
            self.0.lock().unwrap().0 = top;
        }
        fn top(&self) -> f64 {
            self.0.lock().unwrap().0
        }
        fn bottom(&self) -> f64 {
            self.0.lock().unwrap().1 - 400.0
        }
    }

    impl ScrollViewport for Viewport {
        fn scroll_top(&self) -> f64 {
            self.top()
        }
        fn scroll_height(&self) -> f64 {
            self.0.lock().unwrap().1
        }
        fn client_height(&self) -> f64 {
            400.0
        }
        fn set_scroll_top(&mut self, offset: f64) {
            self.scroll_to(offset);
        }
    }

    fn state_of(manager: &CanvasSessionManager, element: Uuid, version: u32) -> VersionState {
        manager
            .store()
            .get_element(element)
            .unwrap()
            .version(version)
            .unwrap()
            .state
    }

    #[test]
    fn test_append_reveals_only_the_delta() {
        let (scheduler, manager) = setup();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");

        manager.append_content(element, "Intro paragraph.", "v1").unwrap();
        scheduler.run_until_idle();
        assert_eq!(state_of(&manager, element, 1), VersionState::Displayed);

        let appended = manager
            .append_content(
                element,
                "Intro paragraph.\n\n## New Section\nDetails.",
                "v2",
            )
            .unwrap();
        assert_eq!(appended.delta.text, "## New Section\nDetails.");
        assert_eq!(appended.reveal, RevealStart::Started);

        scheduler.advance(Duration::from_millis(10));
        assert_eq!(
            manager.visible_text(element).unwrap(),
            "Intro paragraph.\n\n## N"
        );

        scheduler.run_until_idle();
        assert_eq!(state_of(&manager, element, 2), VersionState::Displayed);
        assert_eq!(
            manager.visible_text(element).unwrap(),
            "Intro paragraph.\n\n## New Section\nDetails."
        );
        assert!(!manager.is_loading("conv"));
    }

    #[test]
    fn test_cancel_freezes_and_resume_continues() {
        let (scheduler, manager) = setup();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");
        manager.append_content(element, "abcdefghijkl", "v1").unwrap();

        scheduler.advance(Duration::from_millis(20));
        let summary = manager.cancel_reveal(element).unwrap().unwrap();
        assert_eq!(summary.revealed_chars, 8);
        assert_eq!(state_of(&manager, element, 1), VersionState::Frozen);
        assert_eq!(manager.visible_text(element).unwrap(), "abcdefgh");

        scheduler.run_until_idle();
        assert_eq!(manager.visible_text(element).unwrap(), "abcdefgh");

        let (from, start) = manager.resume_reveal(element, 1).unwrap();
        assert_eq!(from, 8);
        assert_eq!(start, RevealStart::Started);
        scheduler.run_until_idle();
        assert_eq!(state_of(&manager, element, 1), VersionState::Displayed);
        assert_eq!(manager.visible_text(element).unwrap(), "abcdefghijkl");
    }

    #[test]
    fn test_append_while_typing_freezes_stale_version() {
        let (scheduler, manager) = setup();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");
        manager.append_content(element, "first part", "v1").unwrap();
        scheduler.advance(Duration::from_millis(10));

        let appended = manager
            .append_content(element, "first part second part", "v2")
            .unwrap();
        assert_eq!(appended.version, 2);
        assert_eq!(state_of(&manager, element, 1), VersionState::Frozen);

        let typing: Vec<_> = manager
            .store()
            .get_element(element)
            .unwrap()
            .versions
            .into_iter()
            .filter(|v| v.state == VersionState::Typing)
            .collect();
        assert_eq!(typing.len(), 1);

        scheduler.run_until_idle();
        // the later cumulative version covers the frozen one
        assert_eq!(state_of(&manager, element, 1), VersionState::Displayed);
        assert_eq!(state_of(&manager, element, 2), VersionState::Displayed);
    }

    #[test]
    fn test_skip_publishes_ready_and_all_complete() {
        let (_scheduler, manager) = setup();
        let mut rx = manager.subscribe();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");
        manager.append_content(element, "some long text", "v1").unwrap();

        assert!(manager.is_loading("conv"));
        assert!(manager.skip_reveal(element).unwrap());
        assert!(!manager.skip_reveal(element).unwrap());
        assert!(!manager.is_loading("conv"));

        let kinds: Vec<&str> = drain(&mut rx).iter().map(CanvasNotification::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "version_added",
                "reveal_started",
                "reveal_progress",
                "version_state_changed",
                "reveal_complete",
                "element_ready",
                "all_reveals_complete",
            ]
        );
    }

    #[test]
    fn test_skip_while_frozen_displays_version() {
        let (scheduler, manager) = setup();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");
        manager.append_content(element, "abcdefgh", "v1").unwrap();
        scheduler.advance(Duration::from_millis(10));
        manager.cancel_reveal(element).unwrap();

        assert!(manager.skip_reveal(element).unwrap());
        assert_eq!(state_of(&manager, element, 1), VersionState::Displayed);
        assert_eq!(manager.visible_text(element).unwrap(), "abcdefgh");
    }

    #[test]
    fn test_rewrite_reports_inconsistency() {
        let (scheduler, manager) = setup();
        let mut rx = manager.subscribe();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");
        manager.append_content(element, "A", "v1").unwrap();
        scheduler.run_until_idle();

        let appended = manager.append_content(element, "B", "v2").unwrap();
        assert_eq!(appended.delta.kind, crate::delta::DeltaKind::Rewritten);
        assert_eq!(manager.inconsistency_count(element), 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|n| matches!(n, CanvasNotification::DeltaInconsistency { occurrences: 1, .. })));
    }

    #[test]
    fn test_watchdog_cancels_stuck_reveal() {
        let (scheduler, manager) = setup();
        let mut rx = manager.subscribe();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");
        let long = "x".repeat(10_000);
        manager.append_content(element, long, "v1").unwrap();

        scheduler.advance(Duration::from_secs(1));
        assert!(!manager.reveal().is_running(element));
        assert!(!manager.is_loading("conv"));
        assert_eq!(state_of(&manager, element, 1), VersionState::Frozen);

        let notifications = drain(&mut rx);
        assert!(notifications.iter().any(|n| matches!(
            n,
            CanvasNotification::RevealComplete {
                outcome: RevealOutcome::Cancelled(CancelReason::TimedOut),
                ..
            }
        )));
        assert_eq!(
            notifications.last().map(CanvasNotification::kind),
            Some("all_reveals_complete")
        );
    }

    #[test]
    fn test_watchdog_leaves_other_reveals_pending() {
        let (scheduler, manager) = setup();
        let mut rx = manager.subscribe();
        let stuck = manager.create_element("conv", ElementKind::Document, "Stuck");
        let later = manager.create_element("conv", ElementKind::Document, "Later");
        manager.append_content(stuck, "x".repeat(10_000), "v1").unwrap();
        scheduler.advance(Duration::from_millis(500));
        manager.append_content(later, "y".repeat(10_000), "v1").unwrap();

        scheduler.advance(Duration::from_millis(500));
        assert!(!manager.reveal().is_running(stuck));
        assert!(manager.reveal().is_running(later));
        assert!(manager.is_loading("conv"));
        assert!(!drain(&mut rx)
            .iter()
            .any(|n| matches!(n, CanvasNotification::AllRevealsComplete { .. })));

        scheduler.advance(Duration::from_millis(500));
        assert!(!manager.reveal().is_running(later));
        assert!(!manager.is_loading("conv"));
        let completions = drain(&mut rx)
            .iter()
            .filter(|n| matches!(n, CanvasNotification::AllRevealsComplete { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn test_reveal_progress_keeps_viewport_at_bottom() {
        let (scheduler, manager) = setup();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");
        let viewport = Viewport::new();
        manager.scroll().attach(element, Box::new(viewport.clone()));
        manager.append_content(element, "x".repeat(40), "v1").unwrap();

        for _ in 0..3 {
            viewport.grow(20.0);
            assert_eq!(viewport.top(), viewport.bottom() - 20.0);
            scheduler.advance(Duration::from_millis(10));
            assert_eq!(viewport.top(), viewport.bottom());
        }

        viewport.scroll_to(0.0);
        manager.scroll().user_scrolled(element);
        viewport.grow(20.0);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(viewport.top(), 0.0);
        scheduler.run_until_idle();

        // the next version starts where the user left the viewport
        manager.append_content(element, "x".repeat(80), "v2").unwrap();
        viewport.grow(20.0);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(viewport.top(), 0.0);

        viewport.scroll_to(viewport.bottom());
        manager.scroll().user_scrolled(element);
        viewport.grow(20.0);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(viewport.top(), viewport.bottom());
    }

    #[test]
    fn test_cancel_all_settles_every_element() {
        let (scheduler, manager) = setup();
        let a = manager.create_element("conv", ElementKind::Document, "A");
        let b = manager.create_element("other", ElementKind::Document, "B");
        manager.append_content(a, "aaaaaaaaaaaa", "v1").unwrap();
        manager.append_content(b, "bbbbbbbbbbbb", "v1").unwrap();
        scheduler.advance(Duration::from_millis(10));

        assert_eq!(manager.cancel_all(), 2);
        assert_eq!(state_of(&manager, a, 1), VersionState::Frozen);
        assert_eq!(state_of(&manager, b, 1), VersionState::Frozen);
        assert!(!manager.is_loading("conv"));
        assert!(!manager.is_loading("other"));
    }

    #[test]
    fn test_delete_typing_version() {
        let (scheduler, manager) = setup();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");
        manager.append_content(element, "one", "v1").unwrap();
        scheduler.run_until_idle();
        manager.append_content(element, "one two", "v2").unwrap();

        manager.delete_version(element, 2).unwrap();
        assert!(!manager.reveal().is_running(element));
        assert_eq!(state_of(&manager, element, 2), VersionState::Deleted);
        assert_eq!(manager.visible_text(element).unwrap(), "one");

        let err = manager.delete_version(element, 1).unwrap_err();
        assert_eq!(err.code(), "last_active_version");
    }

    #[tokio::test]
    async fn test_permanent_delete_clears_state() {
        let (scheduler, manager) = setup();
        let element = manager.create_element("conv", ElementKind::Document, "Doc");
        manager.append_content(element, "text", "v1").unwrap();
        scheduler.run_until_idle();

        assert!(manager
            .permanently_delete(element, None)
            .await
            .unwrap_err()
            .is_user_visible());
        let token = manager.request_permanent_delete(element).unwrap();
        manager.permanently_delete(element, Some(token)).await.unwrap();
        assert!(manager.visible_text(element).unwrap_err().is_not_found());
        assert_eq!(manager.reveal().phase(element, 1), RevealPhase::Idle);
    }

    #[tokio::test]
    async fn test_permanent_delete_is_not_undone_by_reload() {
        let (scheduler, manager) = setup();
        let snapshots = memory_store().await;
        let manager = manager.with_persistence(snapshots.clone());

        manager.switch_conversation("a").await.unwrap();
        let element = manager.create_element("a", ElementKind::Document, "Doc");
        manager.append_content(element, "text", "v1").unwrap();
        scheduler.run_until_idle();
        manager.switch_conversation("b").await.unwrap();

        let token = manager.request_permanent_delete(element).unwrap();
        manager.permanently_delete(element, Some(token)).await.unwrap();
        assert!(!manager.store().has_conversation("a"));

        let switched = manager.switch_conversation("a").await.unwrap();
        assert_eq!(switched.loaded, 0);
        assert!(!manager.store().contains(element));
        let saved = snapshots.load("a").await.unwrap().unwrap();
        assert!(saved.elements.is_empty());
    }

    #[tokio::test]
    async fn test_switch_saves_previous_and_loads_target() {
        let scheduler = ManualScheduler::new();
        let mut persistence = MockCanvasPersistence::new();
        persistence
            .expect_save()
            .withf(|s| s.conversation_id == "a")
            .times(1)
            .returning(|_| Ok(()));
        persistence
            .expect_load()
            .withf(|id| id == "a")
            .times(1)
            .returning(|_| Ok(None));
        persistence
            .expect_load()
            .withf(|id| id == "b")
            .times(1)
            .returning(|id| {
                let mut snapshot = crate::document::ConversationSnapshot::new(id);
                let element = CanvasElement::new(id, ElementKind::Document, "Loaded");
                snapshot.elements.insert(element.id, element);
                Ok(Some(snapshot))
            });

        let manager = CanvasSessionManager::new(CanvasConfig::default(), Arc::new(scheduler))
            .with_persistence(Arc::new(persistence));

        let first = manager.switch_conversation("a").await.unwrap();
        assert!(first.changed);
        assert_eq!(first.previous, None);

        let second = manager.switch_conversation("b").await.unwrap();
        assert_eq!(second.previous.as_deref(), Some("a"));
        assert_eq!(second.loaded, 1);
        assert_eq!(manager.live_view().unwrap()[0].title, "Loaded");

        let again = manager.switch_conversation("b").await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_binding() {
        let mut persistence = MockCanvasPersistence::new();
        persistence.expect_save().returning(|_| Ok(()));
        persistence
            .expect_load()
            .withf(|id| id == "a")
            .returning(|_| Ok(None));
        persistence
            .expect_load()
            .withf(|id| id == "b")
            .times(1)
            .returning(|_| Err(Error::database("disk I/O error")));

        let manager =
            CanvasSessionManager::new(CanvasConfig::default(), Arc::new(ManualScheduler::new()))
                .with_persistence(Arc::new(persistence));
        manager.switch_conversation("a").await.unwrap();
        let mut rx = manager.subscribe();

        let err = manager.switch_conversation("b").await.unwrap_err();
        assert_eq!(err.code(), "database_error");
        assert_eq!(manager.active_conversation().as_deref(), Some("a"));
        assert!(!drain(&mut rx)
            .iter()
            .any(|n| matches!(n, CanvasNotification::ConversationSwitched { .. })));
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let (scheduler, manager) = setup();
        let outcome = manager
            .execute(CanvasCommand::SwitchConversation {
                conversation_id: "conv".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Switched { changed: true, .. }));

        let CommandOutcome::ElementCreated { element_id } = manager
            .execute(CanvasCommand::CreateElement {
                conversation_id: None,
                kind: ElementKind::Document,
                title: "Doc".to_string(),
            })
            .await
            .unwrap()
        else {
            panic!("expected ElementCreated");
        };

        manager
            .execute(CanvasCommand::AppendContent {
                element_id,
                content: "# Hi".to_string(),
                request: "v1".to_string(),
            })
            .await
            .unwrap();
        scheduler.run_until_idle();

        let outcome = manager
            .execute(CanvasCommand::ExportAll {
                element_id,
                format: ExportFormat::Html,
            })
            .await
            .unwrap();
        match outcome {
            CommandOutcome::Exported { document } => assert!(document.body.contains("<h1>Hi</h1>")),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let err = manager
            .execute(CanvasCommand::Skip {
                element_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
