//! Tunables for session and detection behavior.

use std::time::Duration;

/// Ceiling on one command's total budget. Requests above it, such as
/// `Duration::MAX` standing in for "no timeout", are clamped so deadline
/// arithmetic stays within `Instant` range.
const TIMEOUT_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Knobs for session spawning and completion detection. The defaults are
/// what the CLI ships with; embedders can override per instance.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Total per-command budget when the caller does not pass one.
    pub default_timeout: Duration,
    /// Upper bound on the marker-wait phase (the effective wait is
    /// `min(osc_wait_cap, total / 3)`).
    pub osc_wait_cap: Duration,
    /// Minimum budget granted to the fallback phase even when the total
    /// budget is nearly exhausted.
    pub fallback_floor: Duration,
    /// Final best-effort read window after both detection phases time out.
    pub final_grab: Duration,
    /// How long integration injection may wait for its self-test.
    pub integration_window: Duration,
    /// Pause between spawning the shell and writing the integration script.
    pub settle_delay: Duration,
    /// Shell binary to spawn.
    pub shell_program: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            osc_wait_cap: Duration::from_millis(500),
            fallback_floor: Duration::from_millis(500),
            final_grab: Duration::from_millis(100),
            integration_window: Duration::from_secs(2),
            settle_delay: Duration::from_millis(200),
            shell_program: "bash".to_string(),
        }
    }
}

impl ShellConfig {
    /// Clamp a requested total budget at both ends. Zero means "no
    /// patience", not "wait forever"; it still gets a small bounded window.
    /// Effectively-infinite requests get [`TIMEOUT_CEILING`].
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let total = requested.unwrap_or(self.default_timeout);
        if total.is_zero() {
            Duration::from_secs(1)
        } else {
            total.min(TIMEOUT_CEILING)
        }
    }
}
