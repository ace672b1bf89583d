//! PTY-backed shell sessions.
//!
//! A [`BashSession`] owns one interactive shell under a PTY plus a dedicated
//! reader thread. The thread blocking-reads the PTY for the session's whole
//! life and forwards everything over a bounded channel; it is never cancelled
//! (a blocked PTY read cannot be interrupted without closing the descriptor)
//! and exits on its own when the PTY closes or the receiver is dropped. At
//! most one consumer drains the channel at a time, which is what serializes
//! command execution per session.

use crate::config::ShellConfig;
use crate::integration::IntegrationStatus;
use crate::pty::{Pty, PtyError, terminal_size};
use portable_pty::{CommandBuilder, PtySize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

const READER_CHANNEL_CAPACITY: usize = 100;
const REAP_WINDOW: Duration = Duration::from_millis(500);

/// One message from a session's PTY reader thread.
#[derive(Debug)]
pub(crate) enum ReaderEvent {
    Data(Vec<u8>),
    /// PTY reached EOF or failed; carries the child's exit code when known.
    Closed(Option<u32>),
}

/// Spawn-time settings. These only apply when a session is actually created;
/// reusing a live session ignores them.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Extra environment merged over the inherited one.
    pub environment: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Shell binary override; the config default otherwise.
    pub shell: Option<String>,
    /// PTY dimensions; the controlling terminal's (or 80x24) otherwise.
    pub size: Option<PtySize>,
}

/// A named, persistent interactive shell.
pub struct BashSession {
    name: String,
    pty: Arc<Pty>,
    environment: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    created_at: Instant,
    last_used: StdMutex<Instant>,
    active: AtomicBool,
    integration: StdMutex<IntegrationStatus>,
    events: Mutex<mpsc::Receiver<ReaderEvent>>,
}

impl BashSession {
    /// Spawn the shell and start its reader thread.
    pub fn spawn(name: &str, opts: SpawnOptions, config: &ShellConfig) -> Result<Self, PtyError> {
        let program = opts
            .shell
            .clone()
            .unwrap_or_else(|| config.shell_program.clone());

        let mut cmd = CommandBuilder::new(&program);
        for arg in interactive_args(&program) {
            cmd.arg(arg);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &opts.environment {
            cmd.env(key, value);
        }
        if let Some(dir) = &opts.working_dir {
            cmd.cwd(dir);
        }

        let size = opts.size.unwrap_or_else(terminal_size);
        let pty = Arc::new(Pty::spawn(cmd, size)?);

        let (tx, rx) = mpsc::channel(READER_CHANNEL_CAPACITY);
        spawn_reader(name.to_string(), pty.clone(), tx);

        debug!(session = name, shell = %program, "session spawned");
        let now = Instant::now();
        Ok(Self {
            name: name.to_string(),
            pty,
            environment: opts.environment,
            working_dir: opts.working_dir,
            created_at: now,
            last_used: StdMutex::new(now),
            active: AtomicBool::new(true),
            integration: StdMutex::new(IntegrationStatus::Pending),
            events: Mutex::new(rx),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn pty(&self) -> &Arc<Pty> {
        &self.pty
    }

    /// The channel fed by the reader thread. Locking it is what claims the
    /// session for one command at a time.
    pub(crate) fn events(&self) -> &Mutex<mpsc::Receiver<ReaderEvent>> {
        &self.events
    }

    /// Environment overrides the session was spawned with.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    /// Whether the shell process is still running.
    pub fn is_alive(&self) -> bool {
        self.active.load(Ordering::SeqCst) && matches!(self.pty.try_wait(), Ok(None))
    }

    /// Record that the PTY stream closed under us.
    pub(crate) fn mark_dead(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn integration(&self) -> IntegrationStatus {
        *self.integration.lock().unwrap()
    }

    pub(crate) fn set_integration(&self, status: IntegrationStatus) {
        *self.integration.lock().unwrap() = status;
    }

    pub fn resize(&self, size: PtySize) -> Result<(), PtyError> {
        self.pty.resize(size)
    }

    /// Kill the shell and reap it within a bounded window.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Err(e) = self.pty.kill() {
            debug!(session = %self.name, error = %e, "kill failed (already gone?)");
        }
        let deadline = Instant::now() + REAP_WINDOW;
        while Instant::now() < deadline {
            match self.pty.try_wait() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        warn!(session = %self.name, "shell did not exit within reap window");
    }
}

/// Interactive-mode arguments for the given shell binary. Bash gets a bare
/// environment (no rc files) so injected hooks are the only integration.
fn interactive_args(program: &str) -> &'static [&'static str] {
    match program.rsplit('/').next() {
        Some("bash") => &["--noprofile", "--norc", "-i"],
        _ => &["-i"],
    }
}

fn spawn_reader(name: String, pty: Arc<Pty>, tx: mpsc::Sender<ReaderEvent>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pty.read(&mut buf) {
                Ok(0) => {
                    let exit = pty.try_wait().ok().flatten().map(|s| s.exit_code());
                    let _ = tx.blocking_send(ReaderEvent::Closed(exit));
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(ReaderEvent::Data(buf[..n].to_vec())).is_err() {
                        debug!(session = %name, "reader receiver gone, exiting");
                        break;
                    }
                }
                Err(e) => {
                    // Linux reports a closed PTY as EIO rather than EOF.
                    debug!(session = %name, error = %e, "PTY read ended");
                    let _ = tx.blocking_send(ReaderEvent::Closed(None));
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ShellConfig {
        ShellConfig::default()
    }

    fn sh_session(name: &str) -> BashSession {
        let opts = SpawnOptions {
            shell: Some("sh".to_string()),
            ..SpawnOptions::default()
        };
        BashSession::spawn(name, opts, &test_config()).expect("spawn sh")
    }

    /// Drain reader events until `needle` shows up in the accumulated output.
    async fn read_until(session: &BashSession, needle: &str, budget: Duration) -> String {
        let mut acc = String::new();
        let deadline = tokio::time::Instant::now() + budget;
        let mut rx = session.events().lock().await;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                panic!("timed out waiting for {needle:?}; saw {acc:?}");
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(ReaderEvent::Data(data))) => {
                    acc.push_str(&String::from_utf8_lossy(&data));
                    if acc.contains(needle) {
                        return acc;
                    }
                }
                Ok(Some(ReaderEvent::Closed(_))) => {
                    panic!("session closed while waiting for {needle:?}; saw {acc:?}")
                }
                Ok(None) => panic!("reader channel closed"),
                Err(_) => {}
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_reports_alive_until_shutdown() {
        let session = sh_session("alive");
        assert!(session.is_alive());
        session.shutdown().await;
        assert!(!session.is_alive());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reader_thread_forwards_output() {
        let session = sh_session("reader");
        session.pty().write_line("echo pty-reader-check").expect("write");
        let seen = read_until(&session, "pty-reader-check", Duration::from_secs(5)).await;
        assert!(seen.contains("pty-reader-check"));
        session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_produces_closed_event() {
        let session = sh_session("closing");
        session.pty().write_line("exit").expect("write");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut rx = session.events().lock().await;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            assert!(!remaining.is_zero(), "no Closed event before deadline");
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(ReaderEvent::Closed(_))) | Ok(None) => break,
                Ok(Some(ReaderEvent::Data(_))) => {}
                Err(_) => {}
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_applies_environment_overrides() {
        let opts = SpawnOptions {
            shell: Some("sh".to_string()),
            environment: HashMap::from([(
                "COSH_SESSION_TEST_VAR".to_string(),
                "value-42".to_string(),
            )]),
            ..SpawnOptions::default()
        };
        let session = BashSession::spawn("env", opts, &test_config()).expect("spawn");
        session
            .pty()
            .write_line("echo var=$COSH_SESSION_TEST_VAR")
            .expect("write");
        let seen = read_until(&session, "var=value-42", Duration::from_secs(5)).await;
        assert!(seen.contains("var=value-42"));
        session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_applies_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = "cwd-probe";
        let sub = dir.path().join(marker);
        std::fs::create_dir(&sub).expect("mkdir");

        let opts = SpawnOptions {
            shell: Some("sh".to_string()),
            working_dir: Some(sub.clone()),
            ..SpawnOptions::default()
        };
        let session = BashSession::spawn("cwd", opts, &test_config()).expect("spawn");
        session.pty().write_line("pwd").expect("write");
        let seen = read_until(&session, marker, Duration::from_secs(5)).await;
        assert!(seen.contains(marker));
        session.shutdown().await;
    }

    #[test]
    fn bash_gets_bare_interactive_args() {
        assert_eq!(
            interactive_args("/usr/bin/bash"),
            &["--noprofile", "--norc", "-i"]
        );
        assert_eq!(interactive_args("bash"), &["--noprofile", "--norc", "-i"]);
        assert_eq!(interactive_args("sh"), &["-i"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn touch_advances_last_used() {
        let session = sh_session("touchy");
        let before = session.last_used();
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.touch();
        assert!(session.last_used() > before);
        session.shutdown().await;
    }
}
