//! Interactive REPL over the session manager.
//!
//! Stdin is consumed on a dedicated thread so the async side only ever sees
//! whole lines. Plain lines run in the current session with realtime
//! streaming; `:`-prefixed built-ins manage sessions. Command failures are
//! printed and the loop continues.

use cosh_shell::{ExecuteOptions, ShellError, ShellManager};
use miette::Result;
use std::io::{self, BufRead, Write};
use tokio::sync::mpsc;

const HELP: &str = "\
:sessions        list sessions
:use NAME        switch the current session
:new NAME        start a fresh session and switch to it
:kill NAME       kill a session
:help            show this help
:quit            exit";

pub async fn run(manager: &ShellManager) -> Result<()> {
    let (tx, mut lines) = mpsc::channel::<String>(1);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("cosh: type a command, :help for built-ins");
    let mut current = "default".to_string();
    loop {
        print!("cosh:{current}> ");
        let _ = io::stdout().flush();
        let Some(line) = lines.recv().await else {
            // stdin closed
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.strip_prefix(':') {
            Some(builtin) => {
                if !run_builtin(manager, builtin, &mut current).await {
                    break;
                }
            }
            None => run_command(manager, &current, line).await,
        }
    }
    Ok(())
}

/// Returns false when the REPL should exit.
async fn run_builtin(manager: &ShellManager, input: &str, current: &mut String) -> bool {
    let mut parts = input.split_whitespace();
    let name = parts.next().unwrap_or("");
    let arg = parts.next();
    match (name, arg) {
        ("quit" | "q", _) => return false,
        ("help", _) => println!("{HELP}"),
        ("sessions", _) => crate::print_sessions(manager),
        ("use", Some(session)) => {
            *current = session.to_string();
            println!("using session '{session}'");
        }
        ("new", Some(session)) => {
            let _ = manager.kill_session(session).await;
            match manager.create_session(session, Default::default()).await {
                Ok(()) => {
                    *current = session.to_string();
                    println!("session '{session}' ready");
                }
                Err(err) => eprintln!("cosh: {err}"),
            }
        }
        ("kill", Some(session)) => match manager.kill_session(session).await {
            Ok(()) => println!("killed session '{session}'"),
            Err(err) => eprintln!("cosh: {err}"),
        },
        ("use" | "new" | "kill", None) => eprintln!("cosh: ':{name}' needs a session name"),
        _ => eprintln!("cosh: unknown built-in ':{name}', try :help"),
    }
    true
}

async fn run_command(manager: &ShellManager, session: &str, line: &str) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            print!("{chunk}");
            let _ = io::stdout().flush();
        }
    });

    let options = ExecuteOptions {
        interactive: true,
        capture_output: false,
        live_output: Some(tx),
        ..ExecuteOptions::default()
    };
    let result = manager.execute_command(session, line, options).await;
    // The sender went down with the options; the printer drains and stops.
    let _ = printer.await;

    match result {
        Ok(output) => {
            if let Some(code) = output.exit_code {
                if code != 0 {
                    eprintln!("exit {code}");
                }
            }
        }
        Err(ShellError::Exec(err)) => {
            // Whatever ran was already streamed; just report the failure.
            eprintln!("cosh: {err}");
        }
        Err(err) => eprintln!("cosh: {err}"),
    }
}
