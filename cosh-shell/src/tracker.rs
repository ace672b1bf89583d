//! Per-session command lifecycle tracking.
//!
//! The tracker folds scanner events into a small per-session state machine:
//! `Idle` → `Running` (command dispatched or command-start marker seen) →
//! `Complete` (command-end marker seen) → back to `Idle` when the result has
//! been consumed. A command-end marker observed outside `Running` is residue
//! of an earlier timed-out command and must not complete the current one.

use crate::osc::{OscKind, OscScanner, OscSequence};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandState {
    #[default]
    Idle,
    Running,
    Complete,
}

/// What one chunk of PTY output contributed.
#[derive(Debug, Default)]
pub struct ParseResult {
    /// Complete marker sequences found in this chunk.
    pub sequences: Vec<OscSequence>,
    /// Output bytes with marker sequences removed.
    pub new_output: Vec<u8>,
    pub has_new_output: bool,
    /// True exactly when this chunk moved the session `Running` → `Complete`.
    pub is_complete: bool,
    /// Exit code from the completing marker, if this chunk completed.
    pub exit_code: Option<i32>,
    /// Diagnostic: whether the session state changed while processing.
    pub state_changed: bool,
}

struct Entry {
    state: CommandState,
    last_exit: Option<i32>,
    scanner: OscScanner,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: CommandState::Idle,
            last_exit: None,
            scanner: OscScanner::new(),
        }
    }
}

/// Tracks command state for every session by name.
///
/// Entries are created on first touch and discarded with their session. The
/// scanner inside each entry is the single cross-chunk parsing state for that
/// session, so all PTY output for a session must flow through
/// [`CommandTracker::process_output`].
pub struct CommandTracker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Mark the start of a tracked command. Forces `Running` from any state;
    /// a stale `Complete` left by a crashed consumer cannot wedge the entry.
    pub fn begin_command(&self, session: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(session.to_string()).or_insert_with(Entry::new);
        entry.state = CommandState::Running;
    }

    /// Feed raw PTY output through the session's scanner and fold the
    /// resulting marker events into its state.
    pub fn process_output(&self, session: &str, data: &[u8]) -> ParseResult {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(session.to_string()).or_insert_with(Entry::new);

        let chunk = entry.scanner.scan(data);
        let state_before = entry.state;

        let mut result = ParseResult {
            // Whitespace-only passthrough (bare newlines between markers) does
            // not count as displayable output.
            has_new_output: chunk
                .passthrough
                .iter()
                .any(|b| !b.is_ascii_whitespace()),
            new_output: chunk.passthrough,
            ..ParseResult::default()
        };

        for seq in &chunk.sequences {
            match seq.kind {
                OscKind::CommandStart => {
                    // `Complete` is sticky: once a command has finished, only
                    // the consumer moves the entry on. A start marker here is
                    // the completion probe's own lifecycle, not a new command.
                    if entry.state == CommandState::Idle {
                        entry.state = CommandState::Running;
                    } else if entry.state == CommandState::Complete {
                        debug!(session, "ignoring command-start marker after completion");
                    }
                }
                OscKind::CommandEnd { exit_code } => {
                    if entry.state == CommandState::Running {
                        entry.state = CommandState::Complete;
                        entry.last_exit = Some(exit_code);
                        result.is_complete = true;
                        result.exit_code = Some(exit_code);
                    } else {
                        debug!(session, exit_code, "ignoring stray command-end marker");
                    }
                }
                OscKind::PromptStart | OscKind::Unknown => {}
            }
        }

        result.sequences = chunk.sequences;
        result.state_changed = entry.state != state_before;
        if result.state_changed {
            debug!(session, from = ?state_before, to = ?entry.state, "command state changed");
        }
        result
    }

    /// Consume a finished command: `Running`/`Complete` → `Idle`.
    pub fn finish(&self, session: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(session) {
            entry.state = CommandState::Idle;
        }
    }

    /// Current state; unknown names read as `Idle`.
    pub fn state(&self, session: &str) -> CommandState {
        let entries = self.entries.lock().unwrap();
        entries.get(session).map(|e| e.state).unwrap_or_default()
    }

    /// Exit code of the most recently completed command, if any.
    pub fn last_exit(&self, session: &str) -> Option<i32> {
        let entries = self.entries.lock().unwrap();
        entries.get(session).and_then(|e| e.last_exit)
    }

    /// Drop all tracking state for a session.
    pub fn remove(&self, session: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(session);
    }
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const END_0: &[u8] = b"\x1b]133;D;0\x07";

    #[test]
    fn sessions_start_idle() {
        let tracker = CommandTracker::new();
        assert_eq!(tracker.state("nope"), CommandState::Idle);
        assert_eq!(tracker.last_exit("nope"), None);
    }

    #[test]
    fn begin_command_marks_running() {
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        assert_eq!(tracker.state("s"), CommandState::Running);
    }

    #[test]
    fn command_start_marker_marks_running() {
        let tracker = CommandTracker::new();
        let result = tracker.process_output("s", b"\x1b]133;C\x07");
        assert!(result.state_changed);
        assert!(!result.is_complete);
        assert_eq!(tracker.state("s"), CommandState::Running);
    }

    #[test]
    fn command_end_completes_running_command() {
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        let result = tracker.process_output("s", b"out\x1b]133;D;42\x07");
        assert!(result.is_complete);
        assert_eq!(result.exit_code, Some(42));
        assert_eq!(result.new_output, b"out");
        assert_eq!(tracker.state("s"), CommandState::Complete);
        assert_eq!(tracker.last_exit("s"), Some(42));
    }

    #[test]
    fn stray_command_end_while_idle_is_ignored() {
        let tracker = CommandTracker::new();
        let result = tracker.process_output("s", END_0);
        assert!(!result.is_complete);
        assert_eq!(result.exit_code, None);
        assert_eq!(tracker.state("s"), CommandState::Idle);
    }

    #[test]
    fn completion_fires_exactly_once() {
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        assert!(tracker.process_output("s", END_0).is_complete);
        assert!(!tracker.process_output("s", END_0).is_complete);
        assert_eq!(tracker.state("s"), CommandState::Complete);
    }

    #[test]
    fn first_completion_wins_over_probe_lifecycle() {
        // A slow command's end marker can arrive in the same chunk as the
        // start and end markers of the completion probe typed after it. The
        // command's exit code must survive.
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        let chunk = b"\x1b]133;D;3\x07\x1b]133;A\x07$ \x1b]133;C\x07done\n\x1b]133;D;0\x07";
        let result = tracker.process_output("s", chunk);
        assert!(result.is_complete);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(tracker.state("s"), CommandState::Complete);
        assert_eq!(tracker.last_exit("s"), Some(3));
    }

    #[test]
    fn finish_resets_to_idle() {
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        tracker.process_output("s", END_0);
        tracker.finish("s");
        assert_eq!(tracker.state("s"), CommandState::Idle);
        // last exit survives the reset for diagnostics
        assert_eq!(tracker.last_exit("s"), Some(0));
    }

    #[test]
    fn marker_split_across_chunks_completes() {
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        let first = tracker.process_output("s", b"partial\x1b]133;");
        assert!(!first.is_complete);
        assert_eq!(first.new_output, b"partial");
        let second = tracker.process_output("s", b"D;7\x07");
        assert!(second.is_complete);
        assert_eq!(second.exit_code, Some(7));
    }

    #[test]
    fn sessions_are_isolated() {
        let tracker = CommandTracker::new();
        tracker.begin_command("a");
        tracker.process_output("b", END_0);
        assert_eq!(tracker.state("a"), CommandState::Running);
        assert_eq!(tracker.state("b"), CommandState::Idle);
    }

    #[test]
    fn plain_output_reports_no_state_change() {
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        let result = tracker.process_output("s", b"just text\n");
        assert!(!result.state_changed);
        assert!(result.has_new_output);
        assert!(!result.is_complete);
    }

    #[test]
    fn whitespace_only_output_does_not_count_as_new() {
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        let result = tracker.process_output("s", b"\r\n \t\n");
        assert!(!result.has_new_output);
        assert_eq!(result.new_output, b"\r\n \t\n");
    }

    #[test]
    fn remove_discards_entry() {
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        tracker.process_output("s", END_0);
        tracker.remove("s");
        assert_eq!(tracker.state("s"), CommandState::Idle);
        assert_eq!(tracker.last_exit("s"), None);
    }

    #[test]
    fn repeated_lookups_share_one_entry() {
        let tracker = CommandTracker::new();
        tracker.begin_command("s");
        tracker.begin_command("s");
        let entries = tracker.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
    }
}
