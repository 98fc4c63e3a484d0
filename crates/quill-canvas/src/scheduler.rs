//! Cooperative tick scheduling
//!
//! The reveal engine never loops or sleeps itself. It asks a
//! [`TickScheduler`] to run a callback later and keeps the returned
//! [`TickHandle`] so it can cancel it. Hosts pick the implementation:
//! [`TokioScheduler`] for real timers, [`ManualScheduler`] for a fake clock
//! (tests, or frame-driven hosts that pump time themselves).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Callback run by a scheduler
pub type Tick = Box<dyn FnOnce() + Send + 'static>;

/// Runs callbacks after a delay.
///
/// Implementations must never run `tick` inline from `schedule`; the engine
/// calls `schedule` while holding its session lock.
pub trait TickScheduler: Send + Sync {
    /// Run `tick` once after `delay` unless the returned handle is cancelled first
    fn schedule(&self, delay: Duration, tick: Tick) -> TickHandle;
}

/// Cancels a scheduled tick
#[derive(Debug, Clone, Default)]
pub struct TickHandle {
    token: CancellationToken,
}

impl TickHandle {
    /// Create a fresh, uncancelled handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the tick from running. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether `cancel` was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Scheduler backed by tokio timers
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Use the given runtime
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Internal(format!("no tokio runtime: {e}")))
    }
}

impl TickScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, tick: Tick) -> TickHandle {
        let handle = TickHandle::new();
        let token = handle.token();
        self.handle.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        tick();
                    }
                }
            }
        });
        handle
    }
}

struct PendingTick {
    due: Duration,
    seq: u64,
    handle: TickHandle,
    tick: Tick,
}

#[derive(Default)]
struct ManualClock {
    now: Duration,
    seq: u64,
    queue: Vec<PendingTick>,
}

impl ManualClock {
    /// Remove and return the earliest live tick due at or before `limit`
    fn pop_due(&mut self, limit: Option<Duration>) -> Option<PendingTick> {
        self.queue.retain(|p| !p.handle.is_cancelled());
        let index = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, p)| limit.is_none_or(|l| p.due <= l))
            .min_by_key(|(_, p)| (p.due, p.seq))
            .map(|(i, _)| i)?;
        Some(self.queue.swap_remove(index))
    }
}

/// Fake-clock scheduler; time only moves when [`advance`](Self::advance) is called
#[derive(Clone, Default)]
pub struct ManualScheduler {
    clock: Arc<Mutex<ManualClock>>,
}

impl ManualScheduler {
    /// Upper bound on ticks run by a single `run_until_idle`
    const MAX_TICKS_PER_RUN: usize = 1_000_000;

    /// Create a scheduler at time zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current fake time
    #[must_use]
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of live ticks waiting to run
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock()
            .queue
            .iter()
            .filter(|p| !p.handle.is_cancelled())
            .count()
    }

    /// Move time forward by `by`, running every tick that falls due in order.
    ///
    /// Ticks scheduled while advancing run too if they fall inside the window.
    /// Returns how many ticks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now() + by;
        let mut ran = 0;
        loop {
            let next = {
                let mut clock = self.lock();
                let next = clock.pop_due(Some(target));
                if let Some(ref p) = next {
                    clock.now = clock.now.max(p.due);
                }
                next
            };
            let Some(pending) = next else { break };
            (pending.tick)();
            ran += 1;
        }
        let mut clock = self.lock();
        clock.now = clock.now.max(target);
        ran
    }

    /// Run ticks in due order until nothing is scheduled. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while ran < Self::MAX_TICKS_PER_RUN {
            let next = {
                let mut clock = self.lock();
                let next = clock.pop_due(None);
                if let Some(ref p) = next {
                    clock.now = clock.now.max(p.due);
                }
                next
            };
            let Some(pending) = next else { break };
            (pending.tick)();
            ran += 1;
        }
        ran
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualClock> {
        self.clock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TickScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, tick: Tick) -> TickHandle {
        let handle = TickHandle::new();
        let mut clock = self.lock();
        clock.seq += 1;
        let pending = PendingTick {
            due: clock.now + delay,
            seq: clock.seq,
            handle: handle.clone(),
            tick,
        };
        clock.queue.push(pending);
        handle
    }
}
