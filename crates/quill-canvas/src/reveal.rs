//! Typewriter reveal engine
//!
//! Plays a delta back a few characters at a time on a [`TickScheduler`].
//! One session drives an element at a time:
//!
//! ```text
//!   idle ──start──▶ running ──last tick──▶ completed
//!                     │ ──skip─────────▶ skipped
//!                     │ ──cancel───────▶ cancelled
//! ```
//!
//! Every session ends with exactly one `on_complete` call, whichever way it
//! ends. Callbacks run outside the engine's session lock but must not call
//! back into the engine for the same element synchronously from
//! `on_progress`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::scheduler::{TickHandle, TickScheduler};

/// Playback speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealSpeed {
    /// Characters revealed per tick
    pub chars_per_tick: usize,
    /// Delay between ticks
    pub tick_interval: Duration,
}

impl RevealSpeed {
    /// Create a speed; `chars_per_tick` is at least one
    #[must_use]
    pub fn new(chars_per_tick: usize, tick_interval: Duration) -> Self {
        Self {
            chars_per_tick: chars_per_tick.max(1),
            tick_interval,
        }
    }
}

impl Default for RevealSpeed {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(16))
    }
}

/// Why a session was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Caller asked for this element
    Requested,
    /// A newer version of the element started revealing
    Superseded,
    /// Global cancel of every session
    CancelAll,
    /// Watchdog timeout
    TimedOut,
}

/// Terminal state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealOutcome {
    /// Every character was played
    Completed,
    /// Remaining text was emitted in one step
    Skipped,
    /// Halted before the end
    Cancelled(CancelReason),
}

impl RevealOutcome {
    /// Whether the full text ended up visible
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Lifecycle phase of a (element, version) reveal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealPhase {
    /// Never started
    Idle,
    /// Currently playing
    Running,
    /// Played to the end
    Completed,
    /// Finished via skip
    Skipped,
    /// Halted early
    Cancelled,
}

/// What happened when a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealSummary {
    /// Element ID
    pub element_id: Uuid,
    /// Version revealed
    pub version: u32,
    /// How it ended
    pub outcome: RevealOutcome,
    /// Characters of the text visible at the end
    pub revealed_chars: usize,
    /// Text length in characters
    pub total_chars: usize,
}

/// Progress of a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealStatus {
    /// Version being revealed
    pub version: u32,
    /// Characters revealed so far
    pub revealed_chars: usize,
    /// Text length in characters
    pub total_chars: usize,
}

/// Result of [`RevealEngine::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealStart {
    /// A session is now running
    Started,
    /// Nothing left to play; `on_complete` already fired
    CompletedImmediately,
    /// This version was already fully revealed; nothing happened
    AlreadyRevealed,
    /// This version is already playing; nothing happened
    AlreadyRunning,
}

/// What to reveal
#[derive(Debug, Clone)]
pub struct RevealRequest {
    /// Element ID
    pub element_id: Uuid,
    /// Version the text belongs to
    pub version: u32,
    /// Delta text to play
    pub text: String,
    /// Playback speed
    pub speed: RevealSpeed,
    /// Characters already visible (resuming a frozen reveal)
    pub start_at: usize,
}

impl RevealRequest {
    /// Reveal `text` from the beginning at the default speed
    #[must_use]
    pub fn new(element_id: Uuid, version: u32, text: impl Into<String>) -> Self {
        Self {
            element_id,
            version,
            text: text.into(),
            speed: RevealSpeed::default(),
            start_at: 0,
        }
    }

    /// Set the playback speed
    #[must_use]
    pub fn with_speed(mut self, speed: RevealSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// Start with the first `chars` characters already visible
    #[must_use]
    pub fn starting_at(mut self, chars: usize) -> Self {
        self.start_at = chars;
        self
    }
}

/// Progress callback, receives the text revealed so far
pub type ProgressCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Terminal callback, fired exactly once per session
pub type CompleteCallback = Arc<dyn Fn(&RevealSummary) + Send + Sync>;

/// Callbacks for one session
#[derive(Clone)]
pub struct RevealCallbacks {
    on_progress: ProgressCallback,
    on_complete: CompleteCallback,
}

impl RevealCallbacks {
    /// Create callbacks from closures
    pub fn new(
        on_progress: impl Fn(&str) + Send + Sync + 'static,
        on_complete: impl Fn(&RevealSummary) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_progress: Arc::new(on_progress),
            on_complete: Arc::new(on_complete),
        }
    }
}

impl std::fmt::Debug for RevealCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevealCallbacks").finish_non_exhaustive()
    }
}

/// Serializes progress emission against cancellation. Once closed, no
/// further progress gets through.
#[derive(Clone, Default)]
struct EmissionGate(Arc<Mutex<bool>>);

impl EmissionGate {
    fn emit(&self, f: impl FnOnce()) {
        let closed = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !*closed {
            f();
        }
    }

    fn close(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }
}

struct RevealSession {
    generation: u64,
    version: u32,
    text: String,
    cursor: usize,
    revealed_chars: usize,
    total_chars: usize,
    speed: RevealSpeed,
    callbacks: RevealCallbacks,
    gate: EmissionGate,
    tick: Option<TickHandle>,
}

enum TickStep {
    Progress {
        revealed: String,
        gate: EmissionGate,
        on_progress: ProgressCallback,
    },
    Finished {
        revealed: String,
        session: RevealSession,
    },
}

struct EngineInner {
    scheduler: Arc<dyn TickScheduler>,
    sessions: Mutex<HashMap<Uuid, RevealSession>>,
    outcomes: Mutex<HashMap<(Uuid, u32), RevealOutcome>>,
    generation: AtomicU64,
}

impl EngineInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, RevealSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn outcomes(&self) -> MutexGuard<'_, HashMap<(Uuid, u32), RevealOutcome>> {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule_tick(self: &Arc<Self>, element_id: Uuid, generation: u64, delay: Duration) -> TickHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_tick(element_id, generation);
                }
            }),
        )
    }

    fn on_tick(self: &Arc<Self>, element_id: Uuid, generation: u64) {
        let step = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(&element_id) else {
                return;
            };
            if session.generation != generation {
                return;
            }

            let (cursor, advanced) =
                advance_cursor(&session.text, session.cursor, session.speed.chars_per_tick);
            session.cursor = cursor;
            session.revealed_chars += advanced;
            let revealed = session.text[..cursor].to_string();

            if cursor >= session.text.len() {
                match sessions.remove(&element_id) {
                    Some(session) => TickStep::Finished { revealed, session },
                    None => return,
                }
            } else {
                let interval = session.speed.tick_interval;
                session.tick = Some(self.schedule_tick(element_id, generation, interval));
                TickStep::Progress {
                    revealed,
                    gate: session.gate.clone(),
                    on_progress: Arc::clone(&session.callbacks.on_progress),
                }
            }
        };

        match step {
            TickStep::Progress {
                revealed,
                gate,
                on_progress,
            } => gate.emit(|| on_progress(&revealed)),
            TickStep::Finished { revealed, session } => {
                session
                    .gate
                    .emit(|| (session.callbacks.on_progress)(&revealed));
                self.finish(element_id, session, RevealOutcome::Completed);
            }
        }
    }

    fn finish(&self, element_id: Uuid, mut session: RevealSession, outcome: RevealOutcome) -> RevealSummary {
        if let Some(tick) = session.tick.take() {
            tick.cancel();
        }
        session.gate.close();

        let summary = RevealSummary {
            element_id,
            version: session.version,
            outcome,
            revealed_chars: session.revealed_chars,
            total_chars: session.total_chars,
        };
        self.outcomes()
            .insert((element_id, session.version), outcome);
        debug!(
            element_id = %element_id,
            version = session.version,
            outcome = ?outcome,
            revealed_chars = summary.revealed_chars,
            total_chars = summary.total_chars,
            "reveal finished"
        );
        (session.callbacks.on_complete)(&summary);
        summary
    }
}

/// Move `cursor` forward by up to `chars` characters.
/// Returns the new byte offset and how many characters were passed.
fn advance_cursor(text: &str, cursor: usize, chars: usize) -> (usize, usize) {
    let rest = &text[cursor..];
    match rest.char_indices().nth(chars) {
        Some((offset, _)) => (cursor + offset, chars),
        None => (text.len(), rest.chars().count()),
    }
}

/// Plays deltas back incrementally, one session per element
#[derive(Clone)]
pub struct RevealEngine {
    inner: Arc<EngineInner>,
}

impl RevealEngine {
    /// Create an engine driven by `scheduler`
    #[must_use]
    pub fn new(scheduler: Arc<dyn TickScheduler>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                scheduler,
                sessions: Mutex::new(HashMap::new()),
                outcomes: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Begin revealing `request.text`.
    ///
    /// A running session for a different version of the same element is
    /// superseded first (its `on_complete` fires with
    /// `Cancelled(Superseded)`).
    pub fn start(&self, request: RevealRequest, callbacks: RevealCallbacks) -> RevealStart {
        let RevealRequest {
            element_id,
            version,
            text,
            speed,
            start_at,
        } = request;

        if self
            .outcome(element_id, version)
            .is_some_and(|o| o.is_finalized())
        {
            debug!(element_id = %element_id, version, "reveal already played; ignoring replay");
            return RevealStart::AlreadyRevealed;
        }

        let total_chars = text.chars().count();
        let start_at = start_at.min(total_chars);
        let nothing_left = start_at >= total_chars;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let superseded = {
            let mut sessions = self.inner.sessions();
            if sessions
                .get(&element_id)
                .is_some_and(|s| s.version == version)
            {
                return RevealStart::AlreadyRunning;
            }
            let superseded = sessions.remove(&element_id);

            if !nothing_left {
                let (cursor, _) = advance_cursor(&text, 0, start_at);
                let tick = self
                    .inner
                    .schedule_tick(element_id, generation, speed.tick_interval);
                sessions.insert(
                    element_id,
                    RevealSession {
                        generation,
                        version,
                        text: text.clone(),
                        cursor,
                        revealed_chars: start_at,
                        total_chars,
                        speed,
                        callbacks: callbacks.clone(),
                        gate: EmissionGate::default(),
                        tick: Some(tick),
                    },
                );
            }
            superseded
        };

        if let Some(old) = superseded {
            debug!(
                element_id = %element_id,
                old_version = old.version,
                new_version = version,
                "superseding running reveal"
            );
            self.inner.finish(
                element_id,
                old,
                RevealOutcome::Cancelled(CancelReason::Superseded),
            );
        }

        if nothing_left {
            if !text.is_empty() {
                (callbacks.on_progress)(&text);
            }
            let summary = RevealSummary {
                element_id,
                version,
                outcome: RevealOutcome::Completed,
                revealed_chars: total_chars,
                total_chars,
            };
            self.inner
                .outcomes()
                .insert((element_id, version), RevealOutcome::Completed);
            (callbacks.on_complete)(&summary);
            return RevealStart::CompletedImmediately;
        }

        debug!(element_id = %element_id, version, total_chars, start_at, "reveal started");
        RevealStart::Started
    }

    /// Emit the remaining text at once and complete as `Skipped`.
    ///
    /// Returns `None` when nothing is running for the element, so a second
    /// skip has no effect.
    pub fn skip(&self, element_id: Uuid) -> Option<RevealSummary> {
        let mut session = self.inner.sessions().remove(&element_id)?;
        if let Some(tick) = session.tick.take() {
            tick.cancel();
        }
        session
            .gate
            .emit(|| (session.callbacks.on_progress)(&session.text));
        session.cursor = session.text.len();
        session.revealed_chars = session.total_chars;
        Some(self.inner.finish(element_id, session, RevealOutcome::Skipped))
    }

    /// Halt at the current offset. `on_complete` has fired and no further
    /// progress will be delivered by the time this returns.
    pub fn cancel(&self, element_id: Uuid) -> Option<RevealSummary> {
        self.cancel_with(element_id, CancelReason::Requested)
    }

    /// Cancel with an explicit reason
    pub fn cancel_with(&self, element_id: Uuid, reason: CancelReason) -> Option<RevealSummary> {
        let session = self.inner.sessions().remove(&element_id)?;
        Some(
            self.inner
                .finish(element_id, session, RevealOutcome::Cancelled(reason)),
        )
    }

    /// Cancel every running session across all elements
    pub fn cancel_all(&self) -> Vec<RevealSummary> {
        let drained: Vec<(Uuid, RevealSession)> = self.inner.sessions().drain().collect();
        drained
            .into_iter()
            .map(|(element_id, session)| {
                self.inner.finish(
                    element_id,
                    session,
                    RevealOutcome::Cancelled(CancelReason::CancelAll),
                )
            })
            .collect()
    }

    /// Progress of the element's running session
    #[must_use]
    pub fn status(&self, element_id: Uuid) -> Option<RevealStatus> {
        self.inner.sessions().get(&element_id).map(|s| RevealStatus {
            version: s.version,
            revealed_chars: s.revealed_chars,
            total_chars: s.total_chars,
        })
    }

    /// Whether a session is running for the element
    #[must_use]
    pub fn is_running(&self, element_id: Uuid) -> bool {
        self.inner.sessions().contains_key(&element_id)
    }

    /// Elements with a running session
    #[must_use]
    pub fn running_elements(&self) -> Vec<Uuid> {
        self.inner.sessions().keys().copied().collect()
    }

    /// How the last session for (element, version) ended
    #[must_use]
    pub fn outcome(&self, element_id: Uuid, version: u32) -> Option<RevealOutcome> {
        self.inner.outcomes().get(&(element_id, version)).copied()
    }

    /// Lifecycle phase of (element, version)
    #[must_use]
    pub fn phase(&self, element_id: Uuid, version: u32) -> RevealPhase {
        if self.status(element_id).is_some_and(|s| s.version == version) {
            return RevealPhase::Running;
        }
        match self.outcome(element_id, version) {
            None => RevealPhase::Idle,
            Some(RevealOutcome::Completed) => RevealPhase::Completed,
            Some(RevealOutcome::Skipped) => RevealPhase::Skipped,
            Some(RevealOutcome::Cancelled(_)) => RevealPhase::Cancelled,
        }
    }

    /// Drop recorded outcomes for an element that no longer exists
    pub fn forget(&self, element_id: Uuid) {
        self.inner
            .outcomes()
            .retain(|(element, _), _| *element != element_id);
    }
}

impl std::fmt::Debug for RevealEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevealEngine")
            .field("running", &self.inner.sessions().len())
            .finish_non_exhaustive()
    }
}
