use clap::{Parser, Subcommand};
use cli_table::{Table, WithTitle, print_stdout};
use cosh_shell::{ExecError, ExecuteOptions, SessionSummary, ShellConfig, ShellError, ShellManager};
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use std::time::Duration;

mod log;
mod repl;

#[derive(Parser)]
#[clap(author, version, about = "Run commands in persistent PTY-backed shell sessions")]
struct Args {
    /// More logging; repeat for more detail.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one command and exit.
    Exec {
        /// Session name to run in; created on first use.
        #[clap(short, long, default_value = "default")]
        session: String,
        /// Total completion-detection budget, e.g. "45s" or "2m".
        #[clap(short, long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
        /// Replace any existing session under this name.
        #[clap(long)]
        new: bool,
        /// KEY=VALUE merged into the environment when the session spawns.
        #[clap(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        /// Working directory when the session spawns.
        #[clap(long)]
        cwd: Option<PathBuf>,
        /// Suppress captured output; the exit status still reflects the
        /// command.
        #[clap(long)]
        no_capture: bool,
        /// Shell program when the session spawns.
        #[clap(long)]
        shell: Option<String>,
        /// The command line to run (after `--`).
        #[clap(required = true, last = true)]
        command: Vec<String>,
    },
    /// List sessions.
    Sessions,
    /// Kill a named session.
    Kill { name: String },
}

fn parse_env_pair(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    log::init(args.verbose);

    let manager = ShellManager::new(ShellConfig::default());
    match args.command {
        None => repl::run(&manager).await,
        Some(Command::Exec {
            session,
            timeout,
            new,
            env,
            cwd,
            no_capture,
            shell,
            command,
        }) => {
            let options = ExecuteOptions {
                force_new: new,
                timeout,
                environment: env.into_iter().collect(),
                working_dir: cwd,
                shell,
                capture_output: !no_capture,
                ..ExecuteOptions::default()
            };
            exec_once(&manager, &session, &command.join(" "), options).await
        }
        Some(Command::Sessions) => {
            print_sessions(&manager);
            Ok(())
        }
        Some(Command::Kill { name }) => {
            manager.kill_session(&name).await.into_diagnostic()?;
            println!("killed session '{name}'");
            Ok(())
        }
    }
}

async fn exec_once(
    manager: &ShellManager,
    session: &str,
    command: &str,
    options: ExecuteOptions,
) -> Result<()> {
    match manager.execute_command(session, command, options).await {
        Ok(output) => {
            if !output.text.is_empty() {
                println!("{}", output.text);
            }
            match output.exit_code {
                Some(code) if code != 0 => std::process::exit(code),
                _ => Ok(()),
            }
        }
        Err(err) => {
            // A failed call may still have produced output the user wants.
            if let ShellError::Exec(exec) = &err {
                let partial = exec.partial_output();
                if !partial.is_empty() {
                    println!("{partial}");
                }
                if matches!(exec, ExecError::DetectionTimeout { .. }) {
                    eprintln!("cosh: {exec}");
                    std::process::exit(124);
                }
            }
            Err(err).into_diagnostic()
        }
    }
}

#[derive(Table)]
struct SessionRow {
    #[table(title = "Session")]
    name: String,
    #[table(title = "Alive")]
    alive: String,
    #[table(title = "Integration")]
    integration: String,
    #[table(title = "Age")]
    age: String,
    #[table(title = "Idle")]
    idle: String,
}

impl From<SessionSummary> for SessionRow {
    fn from(summary: SessionSummary) -> Self {
        Self {
            name: summary.name,
            alive: if summary.alive { "yes" } else { "no" }.to_string(),
            integration: summary.integration.to_string(),
            age: human_age(summary.age),
            idle: human_age(summary.idle),
        }
    }
}

/// Whole-second rendering; sub-second noise is useless in a listing.
fn human_age(duration: Duration) -> String {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
}

pub(crate) fn print_sessions(manager: &ShellManager) {
    let rows: Vec<SessionRow> = manager
        .session_summaries()
        .into_iter()
        .map(SessionRow::from)
        .collect();
    if rows.is_empty() {
        println!("no sessions");
        return;
    }
    if let Err(e) = print_stdout(rows.with_title()) {
        eprintln!("cosh: failed to render session table: {e}");
    }
}
