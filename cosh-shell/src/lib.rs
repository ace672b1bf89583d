//! PTY-backed bash sessions with reliable command completion detection.
//!
//! This crate runs shell commands inside persistent interactive bash
//! processes attached to pseudo-terminals. Each session gets a shell
//! integration script injected at startup so bash brackets every command
//! with OSC 133 lifecycle markers; a streaming scanner turns the raw PTY
//! byte stream into typed events, and a hybrid detector waits on those
//! markers with an echo-probe fallback for shells that ignore the hooks.
//! Captured output is cleaned of all integration artifacts before it is
//! returned.

mod config;
mod executor;
mod integration;
mod manager;
mod osc;
pub mod output;
mod pty;
mod registry;
mod session;
mod tracker;

// Session management API
pub use manager::{CommandOutput, ExecuteOptions, SessionSummary, ShellError, ShellManager};

// Sessions
pub use session::{BashSession, SpawnOptions};

// Shell integration
pub use integration::IntegrationStatus;

// Completion detection errors
pub use executor::ExecError;

// PTY management
pub use pty::{Pty, PtyError, terminal_size};

// Marker scanning and command tracking
pub use osc::{FALLBACK_EXIT_CODE, OscKind, OscScanner, OscSequence, ScanChunk};
pub use tracker::{CommandState, CommandTracker, ParseResult};

// Configuration
pub use config::ShellConfig;

// Re-export for convenience
pub use portable_pty::PtySize;
