//! Public session-management API.
//!
//! `ShellManager` owns the registry, the command tracker, and the config, and
//! is the one type embedders interact with: execute commands, create and kill
//! named sessions, list what is running. Sessions are created lazily on first
//! use and replaced transparently once their shell has died.

use crate::config::ShellConfig;
use crate::executor::{self, ExecError};
use crate::integration::{self, IntegrationStatus};
use crate::pty::PtyError;
use crate::registry::SessionRegistry;
use crate::session::{BashSession, SpawnOptions};
use crate::tracker::CommandTracker;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("no session named '{0}'")]
    SessionNotFound(String),
    #[error("failed to spawn session '{name}'")]
    Spawn {
        name: String,
        #[source]
        source: PtyError,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Per-call knobs for [`ShellManager::execute_command`].
///
/// Environment, working directory, and shell overrides are spawn-time only:
/// they take effect when the call actually creates the session (fresh name,
/// dead session, or `force_new`), and are ignored for an existing live one.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Tear down any existing session under this name and start fresh.
    pub force_new: bool,
    /// Total detection budget; `None` uses the configured default.
    pub timeout: Option<Duration>,
    /// Extra variables merged onto the inherited environment at spawn.
    pub environment: HashMap<String, String>,
    /// Start directory at spawn.
    pub working_dir: Option<PathBuf>,
    /// Shell program override at spawn.
    pub shell: Option<String>,
    /// Carried for front ends driving a visible terminal; detection ignores
    /// it.
    pub interactive: bool,
    /// When false the returned text is empty; live streaming still happens.
    pub capture_output: bool,
    /// Receives cleaned output chunks as they arrive. Dropping the receiver
    /// never fails the execution.
    pub live_output: Option<mpsc::UnboundedSender<String>>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            force_new: false,
            timeout: None,
            environment: HashMap::new(),
            working_dir: None,
            shell: None,
            interactive: false,
            capture_output: true,
            live_output: None,
        }
    }
}

impl ExecuteOptions {
    fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            environment: self.environment.clone(),
            working_dir: self.working_dir.clone(),
            shell: self.shell.clone(),
            size: None,
        }
    }
}

/// Result of one executed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Cleaned transcript (empty when `capture_output` was off).
    pub text: String,
    /// `Some` when the integration marker reported an exit code, `None` when
    /// completion came from the fallback probe.
    pub exit_code: Option<i32>,
}

/// Snapshot of one registered session, for listings.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub name: String,
    pub alive: bool,
    pub integration: IntegrationStatus,
    /// Time since the session was spawned.
    pub age: Duration,
    /// Time since the last command was dispatched into it.
    pub idle: Duration,
}

pub struct ShellManager {
    registry: SessionRegistry,
    tracker: CommandTracker,
    config: ShellConfig,
}

impl ShellManager {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            tracker: CommandTracker::new(),
            config,
        }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Execute `command` in the named session, creating or replacing the
    /// session first when needed. Detection errors are call-fatal only; the
    /// session survives a timeout and is replaced lazily after a stream
    /// failure.
    pub async fn execute_command(
        &self,
        name: &str,
        command: &str,
        opts: ExecuteOptions,
    ) -> Result<CommandOutput, ShellError> {
        let session = self
            .get_or_create_inner(name, opts.spawn_options(), opts.force_new)
            .await?;
        let outcome = executor::execute(
            &session,
            &self.tracker,
            &self.config,
            command,
            opts.timeout,
            opts.live_output.as_ref(),
        )
        .await?;
        Ok(CommandOutput {
            text: if opts.capture_output {
                outcome.text
            } else {
                String::new()
            },
            exit_code: outcome.exit_code,
        })
    }

    /// Create a named session eagerly. A live session under the same name
    /// makes this a no-op.
    pub async fn create_session(&self, name: &str, opts: SpawnOptions) -> Result<(), ShellError> {
        self.get_or_create_inner(name, opts, false).await.map(|_| ())
    }

    /// Look up a registered session. No liveness check, no side effects.
    pub fn get_session(&self, name: &str) -> Option<Arc<BashSession>> {
        self.registry.get(name)
    }

    /// Return a live session for the name, spawning or replacing as needed.
    pub async fn get_or_create(
        &self,
        name: &str,
        opts: SpawnOptions,
    ) -> Result<Arc<BashSession>, ShellError> {
        self.get_or_create_inner(name, opts, false).await
    }

    async fn get_or_create_inner(
        &self,
        name: &str,
        opts: SpawnOptions,
        force_new: bool,
    ) -> Result<Arc<BashSession>, ShellError> {
        if let Some(existing) = self.registry.get(name) {
            if existing.is_alive() && !force_new {
                debug!(session = name, "session reused");
                return Ok(existing);
            }
            debug!(
                session = name,
                alive = existing.is_alive(),
                force_new,
                "replacing session"
            );
            self.registry.remove(name);
            self.tracker.remove(name);
            existing.shutdown().await;
        }

        let session = Arc::new(
            BashSession::spawn(name, opts, &self.config).map_err(|source| ShellError::Spawn {
                name: name.to_string(),
                source,
            })?,
        );
        integration::inject(&session, &self.tracker, &self.config).await;
        // Two concurrent creators settle last-writer-wins; the loser's shell
        // is killed and any call still holding it gets a stream error, which
        // the next use recovers from.
        if let Some(replaced) = self.registry.insert(session.clone()) {
            replaced.shutdown().await;
        }
        info!(
            session = name,
            integration = %session.integration(),
            "session created"
        );
        Ok(session)
    }

    /// Kill a named session and forget it. Unknown names are an error.
    pub async fn kill_session(&self, name: &str) -> Result<(), ShellError> {
        let Some(session) = self.registry.remove(name) else {
            return Err(ShellError::SessionNotFound(name.to_string()));
        };
        self.tracker.remove(name);
        session.shutdown().await;
        info!(session = name, "session killed");
        Ok(())
    }

    /// Registered session names, sorted.
    pub fn list_sessions(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Listing snapshot for front ends.
    pub fn session_summaries(&self) -> Vec<SessionSummary> {
        // One clock read keeps age and idle consistent with each other.
        let now = Instant::now();
        self.registry
            .snapshot()
            .into_iter()
            .map(|session| SessionSummary {
                name: session.name().to_string(),
                alive: session.is_alive(),
                integration: session.integration(),
                age: now.saturating_duration_since(session.created_at()),
                idle: now.saturating_duration_since(session.last_used()),
            })
            .collect()
    }
}

impl Default for ShellManager {
    fn default() -> Self {
        Self::new(ShellConfig::default())
    }
}
