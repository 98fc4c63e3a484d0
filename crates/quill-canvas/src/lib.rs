//! Quill Canvas - Versioned Canvas Document Engine
//!
//! Producers append cumulative versions of a document; the engine works out
//! what each version adds and plays only that part back with a typewriter
//! effect, while the viewport follows the growing text:
//! - Document: elements, versions and their lifecycle states
//! - Versions: version store with soft delete, archive and permanent delete
//! - Delta: what a version adds on top of the previous one
//! - Reveal: incremental playback with skip, cancel and cancel-all
//! - Scheduler: timer seam driving reveals (tokio or a manual clock)
//! - Scroll: follow-the-bottom viewport controller
//! - Binding: which conversation the live view shows
//! - Export: Markdown and HTML export of deltas and full documents
//! - Session: the facade wiring all of the above together
//! - Protocol / WebSocket: command surface for UIs
//! - Store: SQLite snapshot persistence
//! - Indexing: hands finished documents to an external indexer
//!
//! ## Usage
//!
//! ```ignore
//! use quill_canvas::{
//!     canvas_router, CanvasConfig, CanvasSessionManager, CanvasState, ElementKind,
//!     TokioScheduler,
//! };
//! use std::sync::Arc;
//!
//! let scheduler = Arc::new(TokioScheduler::current()?);
//! let manager = Arc::new(CanvasSessionManager::new(CanvasConfig::default(), scheduler));
//!
//! let element = manager.create_element("conv-1", ElementKind::Document, "Notes");
//! manager.append_content(element, "Intro paragraph.", "draft")?;
//!
//! let app = canvas_router(Arc::new(CanvasState::new(manager)));
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [canvas]
//! notification_capacity = 1024
//!
//! [canvas.reveal]
//! chars_per_tick = 3
//! tick_interval_ms = 16
//! stuck_timeout_secs = 300
//!
//! [canvas.scroll]
//! follow_threshold_px = 24.0
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod binding;
pub mod config;
pub mod delta;
pub mod document;
pub mod error;
pub mod events;
pub mod export;
pub mod indexing;
pub mod protocol;
pub mod renderer;
pub mod reveal;
pub mod scheduler;
pub mod scroll;
pub mod session;
pub mod store;
pub mod versions;
pub mod websocket;

// Re-export main types
pub use binding::{BindingChange, ConversationBinding};
pub use config::{CanvasConfig, RevealConfig, ScrollConfig};
pub use delta::{compute_delta, Delta, DeltaCalculator, DeltaKind};
pub use document::{
    CanvasElement, ChartType, ConversationSnapshot, ElementKind, Version, VersionState,
};
pub use error::{Error, Result};
pub use events::{CanvasNotification, NotificationBus};
pub use export::{ExportAdapter, ExportFormat, ExportScope, ExportedDocument};
pub use indexing::{spawn_indexing_worker, IndexRequest, IndexingHook};
pub use protocol::{CanvasCommand, ClientMessage, CommandOutcome, ServerMessage};
pub use renderer::ContentRenderer;
pub use reveal::{
    CancelReason, RevealCallbacks, RevealEngine, RevealOutcome, RevealPhase, RevealRequest,
    RevealSpeed, RevealStart, RevealSummary,
};
pub use scheduler::{ManualScheduler, TickHandle, TickScheduler, TokioScheduler};
pub use scroll::{ScrollFollowController, ScrollViewport};
pub use session::{AppendOutcome, CanvasSessionManager, SwitchOutcome};
pub use store::{CanvasPersistence, SnapshotSummary, SqliteCanvasStore};
pub use versions::{ConfirmationToken, VersionStore};
pub use websocket::{canvas_router, canvas_ws_handler, handle_client_message, CanvasState};
