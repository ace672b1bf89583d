//! Command execution with hybrid completion detection.
//!
//! A command is written to the session's PTY, then completion is detected in
//! stages: first by waiting for the shell's command-end marker (when
//! integration is active), then by typing a uniquely named `echo` probe and
//! scanning for its output line, and finally by a short best-effort read so a
//! timeout still returns everything the command managed to print.

use crate::config::ShellConfig;
use crate::integration::DONE_MARKER_PREFIX;
use crate::osc::FALLBACK_EXIT_CODE;
use crate::output::{self, RealtimeFilter};
use crate::session::{BashSession, ReaderEvent};
use crate::tracker::{CommandTracker, ParseResult};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The command never reached the shell; it is presumed not executed.
    #[error("failed to write command to session '{session}'")]
    CommandWrite {
        session: String,
        command: String,
        partial: String,
        #[source]
        source: io::Error,
    },
    /// Both detection phases ran out of budget. The session itself is fine
    /// and the same command may still be running in it.
    #[error("command still running in session '{session}' after {elapsed:.1?}, completion probe unanswered")]
    DetectionTimeout {
        session: String,
        command: String,
        elapsed: Duration,
        partial: String,
    },
    /// The PTY closed mid-command, usually because the shell exited. The
    /// session is dead; the next use of its name recreates it.
    #[error("session '{session}' closed its output stream mid-command")]
    OutputStream {
        session: String,
        command: String,
        partial: String,
    },
}

impl ExecError {
    /// Output captured before the failure, already cleaned.
    pub fn partial_output(&self) -> &str {
        match self {
            ExecError::CommandWrite { partial, .. }
            | ExecError::DetectionTimeout { partial, .. }
            | ExecError::OutputStream { partial, .. } => partial,
        }
    }
}

/// Result of one executed command.
#[derive(Debug)]
pub(crate) struct ExecOutcome {
    /// Cleaned transcript of the command's output.
    pub text: String,
    /// Exit code when the end marker reported one; `None` when completion
    /// was detected by the probe, which cannot observe the code.
    pub exit_code: Option<i32>,
}

enum WaitOutcome {
    Completed { exit_code: Option<i32> },
    StreamClosed,
    TimedOut,
}

/// Run `command` on the session and wait for completion.
///
/// Locking the session's event receiver for the whole call serializes
/// executions per session, so two concurrent callers cannot interleave
/// their transcripts.
pub(crate) async fn execute(
    session: &BashSession,
    tracker: &CommandTracker,
    config: &ShellConfig,
    command: &str,
    timeout: Option<Duration>,
    live: Option<&mpsc::UnboundedSender<String>>,
) -> Result<ExecOutcome, ExecError> {
    let total = config.effective_timeout(timeout);
    let started = Instant::now();
    let deadline = started + total;

    let mut rx = session.events().lock().await;
    let mut capture = Capture {
        session,
        tracker,
        raw: Vec::new(),
        filter: RealtimeFilter::new(),
        live,
    };

    // Leftover bytes from an earlier timed-out command would otherwise leak
    // into this transcript. The tracker entry is not yet running, so any
    // stale end markers in here are ignored as stray.
    let mut stale = 0usize;
    loop {
        match rx.try_recv() {
            Ok(ReaderEvent::Data(chunk)) => {
                stale += chunk.len();
                tracker.process_output(session.name(), &chunk);
            }
            Ok(ReaderEvent::Closed(_)) => {
                session.mark_dead();
                return Err(ExecError::OutputStream {
                    session: session.name().to_string(),
                    command: command.to_string(),
                    partial: String::new(),
                });
            }
            Err(_) => break,
        }
    }
    if stale > 0 {
        trace!(session = session.name(), bytes = stale, "discarded stale output");
    }
    tracker.begin_command(session.name());
    session.touch();

    if let Err(e) = session.pty().write_line(command) {
        tracker.finish(session.name());
        return Err(ExecError::CommandWrite {
            session: session.name().to_string(),
            command: command.to_string(),
            partial: String::new(),
            source: e,
        });
    }
    debug!(session = session.name(), budget = ?total, "command dispatched");

    // Phase 1: wait for the command-end marker. Capped so a shell whose
    // integration silently broke does not eat the whole budget.
    let outcome = if session.integration().markers_expected() {
        let window = config.osc_wait_cap.min(total / 3);
        capture.wait(&mut rx, started + window, None).await
    } else {
        WaitOutcome::TimedOut
    };
    match outcome {
        WaitOutcome::Completed { exit_code } => {
            return Ok(capture.into_outcome(exit_code));
        }
        WaitOutcome::StreamClosed => {
            tracker.finish(session.name());
            return Err(ExecError::OutputStream {
                session: session.name().to_string(),
                command: command.to_string(),
                partial: capture.into_text(),
            });
        }
        WaitOutcome::TimedOut => {}
    }

    // Phase 2: type a uniquely named probe. The shell only reaches it after
    // the command finishes, so its output line doubles as a completion
    // signal that works without any integration.
    let marker = format!("{DONE_MARKER_PREFIX}{}__", Uuid::new_v4().simple());
    let mut scan = MarkerScan::new(&marker);
    // Single quotes keep the echoed input line from ever matching exactly.
    if let Err(e) = session.pty().write_line(&format!("echo '{marker}'")) {
        // The command line was already delivered, so a dead writer here is a
        // dead PTY, not a lost command.
        debug!(session = session.name(), error = %e, "probe write failed, stream closed");
        session.mark_dead();
        tracker.finish(session.name());
        return Err(ExecError::OutputStream {
            session: session.name().to_string(),
            command: command.to_string(),
            partial: capture.into_text(),
        });
    }
    let remaining = deadline.saturating_duration_since(Instant::now());
    let probe_window = remaining.max(config.fallback_floor);
    debug!(session = session.name(), window = ?probe_window, "waiting on completion probe");

    let outcome = capture
        .wait(&mut rx, Instant::now() + probe_window, Some(&mut scan))
        .await;
    match outcome {
        WaitOutcome::Completed { exit_code } => Ok(capture.into_outcome(exit_code)),
        WaitOutcome::StreamClosed => {
            tracker.finish(session.name());
            Err(ExecError::OutputStream {
                session: session.name().to_string(),
                command: command.to_string(),
                partial: capture.into_text(),
            })
        }
        WaitOutcome::TimedOut => {
            // Phase 3: grab whatever is already in flight so the error can
            // carry it. A completion landing in this window still counts.
            let grabbed = capture
                .wait(&mut rx, Instant::now() + config.final_grab, Some(&mut scan))
                .await;
            if let WaitOutcome::Completed { exit_code } = grabbed {
                return Ok(capture.into_outcome(exit_code));
            }
            tracker.finish(session.name());
            let elapsed = started.elapsed();
            warn!(
                session = session.name(),
                phase = "fallback-probe",
                ?elapsed,
                "completion not detected within budget"
            );
            Err(ExecError::DetectionTimeout {
                session: session.name().to_string(),
                command: command.to_string(),
                elapsed,
                partial: capture.into_text(),
            })
        }
    }
}

/// Transcript accumulation shared by all wait phases.
struct Capture<'a> {
    session: &'a BashSession,
    tracker: &'a CommandTracker,
    raw: Vec<u8>,
    filter: RealtimeFilter,
    live: Option<&'a mpsc::UnboundedSender<String>>,
}

impl Capture<'_> {
    /// Fold one PTY chunk into the tracker, the transcript, and the live
    /// stream.
    fn ingest(&mut self, chunk: &[u8]) -> ParseResult {
        let result = self.tracker.process_output(self.session.name(), chunk);
        self.raw.extend_from_slice(&result.new_output);
        if let Some(tx) = self.live {
            let filtered = self.filter.push(chunk);
            if !filtered.is_empty() {
                let _ = tx.send(filtered);
            }
        }
        result
    }

    /// Consume session events until completion, stream closure, or `until`.
    async fn wait(
        &mut self,
        rx: &mut mpsc::Receiver<ReaderEvent>,
        until: Instant,
        mut scan: Option<&mut MarkerScan>,
    ) -> WaitOutcome {
        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(ReaderEvent::Data(chunk))) => {
                    let result = self.ingest(&chunk);
                    if result.is_complete {
                        let code = result.exit_code.unwrap_or(FALLBACK_EXIT_CODE);
                        return WaitOutcome::Completed {
                            exit_code: Some(code),
                        };
                    }
                    if let Some(scan) = scan.as_deref_mut() {
                        if scan.push(&result.new_output) {
                            return WaitOutcome::Completed { exit_code: None };
                        }
                    }
                }
                Ok(Some(ReaderEvent::Closed(code))) => {
                    debug!(session = self.session.name(), ?code, "session stream closed");
                    self.session.mark_dead();
                    return WaitOutcome::StreamClosed;
                }
                Ok(None) => {
                    self.session.mark_dead();
                    return WaitOutcome::StreamClosed;
                }
                Err(_) => return WaitOutcome::TimedOut,
            }
        }
    }

    fn into_outcome(self, exit_code: Option<i32>) -> ExecOutcome {
        self.tracker.finish(self.session.name());
        ExecOutcome {
            text: self.into_text(),
            exit_code,
        }
    }

    /// Flush the live stream and clean the accumulated transcript.
    fn into_text(mut self) -> String {
        if let Some(tx) = self.live {
            let tail = self.filter.flush();
            if !tail.is_empty() {
                let _ = tx.send(tail);
            }
        }
        output::clean(&String::from_utf8_lossy(&self.raw))
    }
}

/// Incremental exact-line scanner for the completion probe's output.
struct MarkerScan {
    marker: String,
    tail: String,
    matched: bool,
}

impl MarkerScan {
    fn new(marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
            tail: String::new(),
            matched: false,
        }
    }

    /// Feed output bytes; returns true once a complete line equals the
    /// marker after ANSI stripping. The echoed probe input contains the
    /// marker in quotes and never matches.
    fn push(&mut self, chunk: &[u8]) -> bool {
        if self.matched {
            return true;
        }
        self.tail.push_str(&String::from_utf8_lossy(chunk));
        while let Some(pos) = self.tail.find('\n') {
            let line: String = self.tail.drain(..=pos).collect();
            if strip_ansi_escapes::strip_str(&line).trim() == self.marker {
                self.matched = true;
            }
        }
        self.matched
    }
}
