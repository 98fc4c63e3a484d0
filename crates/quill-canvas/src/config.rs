//! Canvas engine configuration
//!
//! Embedded in the host application's config file under `[canvas]`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reveal::RevealSpeed;

/// Canvas engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConfig {
    /// Typewriter playback settings
    #[serde(default)]
    pub reveal: RevealConfig,
    /// Scroll-follow settings
    #[serde(default)]
    pub scroll: ScrollConfig,
    /// Notification bus capacity before slow subscribers lag
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            reveal: RevealConfig::default(),
            scroll: ScrollConfig::default(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl CanvasConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.reveal.chars_per_tick == 0 {
            return Err(Error::invalid_config("reveal.chars_per_tick must be > 0"));
        }
        if self.reveal.tick_interval_ms == 0 {
            return Err(Error::invalid_config("reveal.tick_interval_ms must be > 0"));
        }
        if self.reveal.stuck_timeout_secs == 0 {
            return Err(Error::invalid_config(
                "reveal.stuck_timeout_secs must be > 0",
            ));
        }
        if !self.scroll.follow_threshold_px.is_finite() || self.scroll.follow_threshold_px < 0.0 {
            return Err(Error::invalid_config(
                "scroll.follow_threshold_px must be a non-negative number",
            ));
        }
        if self.notification_capacity == 0 {
            return Err(Error::invalid_config("notification_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Typewriter playback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevealConfig {
    /// Characters revealed per tick
    #[serde(default = "default_chars_per_tick")]
    pub chars_per_tick: usize,
    /// Delay between ticks in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound on a single reveal before the watchdog cancels it
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,
}

impl Default for RevealConfig {
    fn default() -> Self {
        Self {
            chars_per_tick: default_chars_per_tick(),
            tick_interval_ms: default_tick_interval_ms(),
            stuck_timeout_secs: default_stuck_timeout_secs(),
        }
    }
}

impl RevealConfig {
    /// Playback speed derived from this config
    #[must_use]
    pub fn speed(&self) -> RevealSpeed {
        RevealSpeed::new(
            self.chars_per_tick,
            Duration::from_millis(self.tick_interval_ms),
        )
    }

    /// Watchdog timeout
    #[must_use]
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }
}

/// Scroll-follow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollConfig {
    /// Distance from the bottom (pixels) still treated as "at the bottom"
    #[serde(default = "default_follow_threshold_px")]
    pub follow_threshold_px: f64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            follow_threshold_px: default_follow_threshold_px(),
        }
    }
}

fn default_notification_capacity() -> usize {
    1024
}
fn default_chars_per_tick() -> usize {
    3
}
fn default_tick_interval_ms() -> u64 {
    16
}
fn default_stuck_timeout_secs() -> u64 {
    300
}
fn default_follow_threshold_px() -> f64 {
    24.0
}
