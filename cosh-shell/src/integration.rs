//! Shell-integration injection.
//!
//! After a session's shell starts, a short script is typed into the PTY that
//! makes bash emit OSC 133 markers around every prompt and command, plus a
//! ready sentinel that doubles as a self-test. Validation is fail-open: a
//! shell that ignores the hooks still works, it just loses marker-based
//! completion detection and relies on the fallback probe.

use crate::config::ShellConfig;
use crate::osc::OscKind;
use crate::session::{BashSession, ReaderEvent};
use crate::tracker::CommandTracker;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Printed by the injected script once the hooks are in place.
pub(crate) const READY_SENTINEL: &str = "__COSH_SHELL_READY__";

/// Prefix of per-command completion markers (a unique suffix is appended for
/// every execution).
pub(crate) const DONE_MARKER_PREFIX: &str = "__COSH_DONE_";

/// How long to keep reading after the sentinel arrives. Long enough for the
/// hook markers that trail it, short enough not to burn the whole validation
/// window on a shell that will never send them. The window is always waited
/// out in full so the script's own marker trail is consumed here and cannot
/// leak into the first command's detection.
const SENTINEL_GRACE: Duration = Duration::from_millis(250);

/// Health of a session's marker integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationStatus {
    /// Not injected yet.
    Pending,
    /// Hooks verified; completion detection uses markers first.
    Active,
    /// Shell answered but emits no markers; detection starts at the fallback.
    Degraded,
    /// Shell never answered the self-test (or died); fallback only.
    Failed,
}

impl IntegrationStatus {
    /// Whether the marker-wait phase is worth attempting.
    pub fn markers_expected(self) -> bool {
        matches!(self, IntegrationStatus::Active)
    }
}

impl fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntegrationStatus::Pending => "pending",
            IntegrationStatus::Active => "active",
            IntegrationStatus::Degraded => "degraded",
            IntegrationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The script typed into a fresh shell. Single-purpose lines, no comments:
/// every byte here is echoed back by the terminal.
pub(crate) fn integration_script() -> String {
    format!(
        r#"set +o history 2>/dev/null || true
__cosh_report() {{ local code=$?; printf '\033]133;D;%s\007' "$code"; printf '\033]133;A\007'; }}
PS0='\e]133;C\a'
PROMPT_COMMAND='__cosh_report'
echo '{READY_SENTINEL}'
"#
    )
}

/// Inject the integration script and classify the outcome. Never fails the
/// session; every path returns a status and stores it on the session.
pub(crate) async fn inject(
    session: &BashSession,
    tracker: &CommandTracker,
    config: &ShellConfig,
) -> IntegrationStatus {
    tokio::time::sleep(config.settle_delay).await;

    let status = match session.pty().write_all(integration_script().as_bytes()) {
        Ok(()) => {
            let _ = session.pty().flush();
            validate(session, tracker, config).await
        }
        Err(e) => {
            warn!(session = session.name(), error = %e, "could not write integration script");
            IntegrationStatus::Failed
        }
    };
    // The script's own prompt/command markers walked the tracker entry; reset
    // it so they cannot read as a completion of the first real command.
    tracker.finish(session.name());

    match status {
        IntegrationStatus::Active => {
            info!(session = session.name(), "shell integration active")
        }
        IntegrationStatus::Degraded => {
            warn!(
                session = session.name(),
                "shell integration degraded, detection falls back to echo probes"
            )
        }
        IntegrationStatus::Failed => {
            warn!(
                session = session.name(),
                "shell integration failed self-test, detection falls back to echo probes"
            )
        }
        IntegrationStatus::Pending => unreachable!("validation always classifies"),
    }

    session.set_integration(status);
    status
}

/// Read session output until the validation window closes (shortened to
/// [`SENTINEL_GRACE`] once the sentinel arrives) or the PTY dies, then
/// classify from what was seen.
async fn validate(
    session: &BashSession,
    tracker: &CommandTracker,
    config: &ShellConfig,
) -> IntegrationStatus {
    let deadline = tokio::time::Instant::now() + config.integration_window;
    let mut sentinel_grace: Option<tokio::time::Instant> = None;
    let mut saw_sentinel = false;
    let mut saw_marker = false;
    let mut transcript = String::new();

    let mut rx = session.events().lock().await;
    loop {
        let now = tokio::time::Instant::now();
        let until = sentinel_grace.map_or(deadline, |g| g.min(deadline));
        let remaining = until.saturating_duration_since(now);
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(ReaderEvent::Data(chunk))) => {
                let result = tracker.process_output(session.name(), &chunk);
                if result
                    .sequences
                    .iter()
                    .any(|seq| !matches!(seq.kind, OscKind::Unknown))
                {
                    saw_marker = true;
                }
                transcript.push_str(&String::from_utf8_lossy(&result.new_output));
                if !saw_sentinel && contains_exact_line(&transcript, READY_SENTINEL) {
                    saw_sentinel = true;
                    sentinel_grace = Some(tokio::time::Instant::now() + SENTINEL_GRACE);
                }
            }
            Ok(Some(ReaderEvent::Closed(_))) | Ok(None) => {
                session.mark_dead();
                return IntegrationStatus::Failed;
            }
            Err(_) => break,
        }
    }

    debug!(
        session = session.name(),
        saw_sentinel, saw_marker, "integration self-test window closed"
    );
    if saw_sentinel && saw_marker {
        IntegrationStatus::Active
    } else if saw_sentinel {
        IntegrationStatus::Degraded
    } else {
        IntegrationStatus::Failed
    }
}

/// Whether any line of `text` is exactly `needle` after ANSI stripping.
/// The terminal echo of `echo '<needle>'` contains the needle but never
/// equals it, so echoed input cannot satisfy the check.
pub(crate) fn contains_exact_line(text: &str, needle: &str) -> bool {
    text.lines()
        .any(|line| strip_ansi_escapes::strip_str(line).trim() == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SpawnOptions;

    #[test]
    fn script_installs_both_hooks_and_sentinel() {
        let script = integration_script();
        assert!(script.contains("PROMPT_COMMAND="));
        assert!(script.contains("PS0="));
        assert!(script.contains("133;D"));
        assert!(script.contains("set +o history"));
        assert!(script.contains(READY_SENTINEL));
    }

    #[test]
    fn script_quotes_the_sentinel_echo() {
        // Quoting keeps the echoed input line from matching exactly.
        assert!(integration_script().contains(&format!("echo '{READY_SENTINEL}'")));
    }

    #[test]
    fn exact_line_match_rejects_echoed_input() {
        let echoed = format!("$ echo '{READY_SENTINEL}'\n");
        assert!(!contains_exact_line(&echoed, READY_SENTINEL));
        let with_output = format!("{echoed}{READY_SENTINEL}\n");
        assert!(contains_exact_line(&with_output, READY_SENTINEL));
    }

    #[test]
    fn exact_line_match_sees_through_ansi() {
        let colored = format!("\u{1b}[32m{READY_SENTINEL}\u{1b}[0m\r\n");
        assert!(contains_exact_line(&colored, READY_SENTINEL));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inject_into_bash_reports_active() {
        let config = ShellConfig::default();
        let session = BashSession::spawn("inject-bash", SpawnOptions::default(), &config)
            .expect("spawn bash");
        let tracker = CommandTracker::new();

        let status = inject(&session, &tracker, &config).await;
        assert_eq!(status, IntegrationStatus::Active);
        assert_eq!(session.integration(), IntegrationStatus::Active);
        session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inject_into_non_shell_reports_failed() {
        let config = ShellConfig {
            settle_delay: Duration::from_millis(50),
            integration_window: Duration::from_millis(800),
            ..ShellConfig::default()
        };
        let opts = SpawnOptions {
            // `cat -i` exits immediately with a usage error; the PTY closes
            // before any self-test answer can arrive.
            shell: Some("cat".to_string()),
            ..SpawnOptions::default()
        };
        let session = BashSession::spawn("inject-cat", opts, &config).expect("spawn cat");
        let tracker = CommandTracker::new();

        let status = inject(&session, &tracker, &config).await;
        assert_eq!(status, IntegrationStatus::Failed);
        session.shutdown().await;
    }
}
