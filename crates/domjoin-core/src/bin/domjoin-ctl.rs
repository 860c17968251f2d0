// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domjoin Control CLI
//!
//! Runs the join orchestrator in-process against the local join state.
//!
//! Usage:
//!   domjoin-ctl <command> [options]
//!
//! Commands:
//!   status                        Show host join status
//!   scripts                       List applicable join scripts
//!   join --dc-host <host> --user <name> --password-file <path>
//!   run [--force] [--user <name> --password-file <path>] [script...]
//!   log                           Print output of the most recent run
//!   unjoin                        Forget all join records

use std::process::ExitCode;
use std::time::Duration;

use domjoin_core::config::Config;
use domjoin_core::credentials::Credentials;
use domjoin_core::orchestrator::JoinOrchestrator;
use domjoin_core::run::RunState;
use domjoin_core::runtime::JoinRuntime;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn print_usage() {
    eprintln!(
        r#"Usage: domjoin-ctl <command> [options]

Join this host to a domain by running the installed join scripts.

COMMANDS:
    status                          Show host join status
    scripts                         List applicable join scripts and their state
    join                            Run a full domain join
    run [script...]                 Run due scripts (or the named ones)
    log                             Print output of the most recent run
    unjoin                          Forget all join records

JOIN OPTIONS:
    --dc-host <host>                Domain controller (required)
    --user <name>                   Bind account (required)
    --password-file <path>          File holding the bind password (required)

RUN OPTIONS:
    --force                         Re-run scripts that would be skipped
    --user <name>                   Bind account
    --password-file <path>          File holding the bind password

ENVIRONMENT:
    DOMJOIN_SCRIPTS_DIR             Join script directory
    DOMJOIN_STATE_PATH              SQLite join state (default: .data/domjoin.db)
    DOMJOIN_HOST_ROLE               Role of this host (default: memberserver)
    RUST_LOG                        Log filter (default: domjoin_core=warn)

EXAMPLES:
    # Join against dc1
    domjoin-ctl join --dc-host dc1.example.org --user admin --password-file /root/.bindpw

    # Re-run one script even though it is configured
    domjoin-ctl run --force --user admin --password-file /root/.bindpw register-dns
"#
    );
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Status,
    Scripts,
    Join {
        dc_host: String,
        user: String,
        password_file: String,
    },
    Run {
        force: bool,
        user: Option<String>,
        password_file: Option<String>,
        scripts: Vec<String>,
    },
    Log,
    Unjoin,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from_vec(&args)
}

fn parse_args_from_vec(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("No command specified".to_string());
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
            std::process::exit(0);
        }
        "status" => Ok(Command::Status),
        "scripts" => Ok(Command::Scripts),
        "log" => Ok(Command::Log),
        "unjoin" => Ok(Command::Unjoin),
        "join" => {
            let mut dc_host: Option<String> = None;
            let mut user: Option<String> = None;
            let mut password_file: Option<String> = None;

            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--dc-host" => {
                        i += 1;
                        dc_host = Some(args.get(i).ok_or("--dc-host requires a host")?.clone());
                    }
                    "--user" => {
                        i += 1;
                        user = Some(args.get(i).ok_or("--user requires a name")?.clone());
                    }
                    "--password-file" => {
                        i += 1;
                        password_file =
                            Some(args.get(i).ok_or("--password-file requires a path")?.clone());
                    }
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }

            Ok(Command::Join {
                dc_host: dc_host.ok_or("--dc-host is required")?,
                user: user.ok_or("--user is required")?,
                password_file: password_file.ok_or("--password-file is required")?,
            })
        }
        "run" => {
            let mut force = false;
            let mut user: Option<String> = None;
            let mut password_file: Option<String> = None;
            let mut scripts = Vec::new();

            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--force" => force = true,
                    "--user" => {
                        i += 1;
                        user = Some(args.get(i).ok_or("--user requires a name")?.clone());
                    }
                    "--password-file" => {
                        i += 1;
                        password_file =
                            Some(args.get(i).ok_or("--password-file requires a path")?.clone());
                    }
                    arg if arg.starts_with("--") => {
                        return Err(format!("Unknown argument: {}", arg));
                    }
                    name => scripts.push(name.to_string()),
                }
                i += 1;
            }

            if user.is_some() != password_file.is_some() {
                return Err("--user and --password-file must be given together".to_string());
            }

            Ok(Command::Run {
                force,
                user,
                password_file,
                scripts,
            })
        }
        cmd => Err(format!("Unknown command: {}", cmd)),
    }
}

fn read_password(path: &str) -> Result<String, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read password file {}: {}", path, e))?;
    Ok(content.trim_end_matches(['\r', '\n']).to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("domjoin_core=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cmd = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match JoinRuntime::builder().config(config).build() {
        Ok(builder) => match builder.start().await {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("Failed to start join runtime: {:#}", e);
                return ExitCode::FAILURE;
            }
        },
        Err(e) => {
            eprintln!("Invalid configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = execute_command(runtime.orchestrator(), cmd).await;

    if let Err(e) = runtime.shutdown().await {
        eprintln!("Shutdown error: {:#}", e);
    }

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute_command(orchestrator: &JoinOrchestrator, cmd: Command) -> Result<ExitCode, String> {
    match cmd {
        Command::Status => {
            let status = orchestrator.status().await.map_err(|e| e.to_string())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&status).map_err(|e| e.to_string())?
            );
        }

        Command::Scripts => {
            let scripts = orchestrator.overview().await.map_err(|e| e.to_string())?;
            if scripts.is_empty() {
                println!("No join scripts found in {}", orchestrator.config().scripts_dir.display());
            }
            for script in scripts {
                println!(
                    "{:>4}  {:<28} {:<15} v{:<3} {:<11} {}",
                    script.weight,
                    script.name,
                    script.idempotency_class.as_str(),
                    script.version,
                    script.status,
                    if script.due { "due" } else { "" }
                );
            }
        }

        Command::Join {
            dc_host,
            user,
            password_file,
        } => {
            let password = read_password(&password_file)?;
            let started = orchestrator
                .start(&dc_host, &user, &password)
                .await
                .map_err(|e| e.to_string())?;
            println!("Started join run: {}", started.run_id);
            return follow(orchestrator, &started.run_id).await;
        }

        Command::Run {
            force,
            user,
            password_file,
            scripts,
        } => {
            let credentials = match (user, password_file) {
                (Some(user), Some(path)) => Some(Credentials::new(user, read_password(&path)?)),
                _ => None,
            };
            let started = orchestrator
                .run_scripts(&scripts, force, credentials)
                .await
                .map_err(|e| e.to_string())?;
            println!("Started run: {}", started.run_id);
            return follow(orchestrator, &started.run_id).await;
        }

        Command::Log => {
            let log = orchestrator.logview().await.map_err(|e| e.to_string())?;
            print!("{}", log);
        }

        Command::Unjoin => {
            orchestrator.unjoin().await.map_err(|e| e.to_string())?;
            println!("Host unjoined");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Print progress until the run finishes. Ctrl-C cancels the run.
async fn follow(orchestrator: &JoinOrchestrator, run_id: &str) -> Result<ExitCode, String> {
    let mut last_message = String::new();
    let mut cancel_requested = false;

    loop {
        let snapshot = orchestrator
            .progress(run_id)
            .await
            .map_err(|e| e.to_string())?;

        if snapshot.message != last_message {
            let percentage = serde_json::to_string(&snapshot.percentage).unwrap_or_default();
            println!("[{:>15}] {}", percentage.trim_matches('"'), snapshot.message);
            last_message = snapshot.message.clone();
        }

        if snapshot.done {
            for warning in &snapshot.warnings {
                println!("warning: {}", warning);
            }
            for error in &snapshot.errors {
                let scope = error.script_name.as_deref().unwrap_or("run");
                let critical = if error.critical { " (critical)" } else { "" };
                println!("error: {}: {}{}", scope, error.message, critical);
            }
            return Ok(match snapshot.state {
                RunState::Completed => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                eprintln!("Cancelling after the current script...");
                orchestrator.cancel(run_id).await.map_err(|e| e.to_string())?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_no_command() {
        let result = parse_args_from_vec(&args(&["domjoin-ctl"]));
        assert_eq!(result.unwrap_err(), "No command specified");
    }

    #[test]
    fn test_parse_unknown_command() {
        let result = parse_args_from_vec(&args(&["domjoin-ctl", "rejoin"]));
        assert!(result.unwrap_err().contains("Unknown command"));
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(
            parse_args_from_vec(&args(&["domjoin-ctl", "status"])).unwrap(),
            Command::Status
        );
        assert_eq!(
            parse_args_from_vec(&args(&["domjoin-ctl", "scripts"])).unwrap(),
            Command::Scripts
        );
        assert_eq!(
            parse_args_from_vec(&args(&["domjoin-ctl", "log"])).unwrap(),
            Command::Log
        );
        assert_eq!(
            parse_args_from_vec(&args(&["domjoin-ctl", "unjoin"])).unwrap(),
            Command::Unjoin
        );
    }

    #[test]
    fn test_parse_join() {
        let cmd = parse_args_from_vec(&args(&[
            "domjoin-ctl",
            "join",
            "--dc-host",
            "dc1.example.org",
            "--user",
            "admin",
            "--password-file",
            "/root/.bindpw",
        ]))
        .unwrap();
        assert_eq!(
            cmd,
            Command::Join {
                dc_host: "dc1.example.org".to_string(),
                user: "admin".to_string(),
                password_file: "/root/.bindpw".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_join_missing_dc_host() {
        let result = parse_args_from_vec(&args(&[
            "domjoin-ctl",
            "join",
            "--user",
            "admin",
            "--password-file",
            "/root/.bindpw",
        ]));
        assert!(result.unwrap_err().contains("--dc-host is required"));
    }

    #[test]
    fn test_parse_join_option_without_value() {
        let result = parse_args_from_vec(&args(&["domjoin-ctl", "join", "--user"]));
        assert!(result.unwrap_err().contains("--user requires a name"));
    }

    #[test]
    fn test_parse_run_with_scripts() {
        let cmd = parse_args_from_vec(&args(&[
            "domjoin-ctl",
            "run",
            "--force",
            "register-dns",
            "sync-time",
        ]))
        .unwrap();
        assert_eq!(
            cmd,
            Command::Run {
                force: true,
                user: None,
                password_file: None,
                scripts: vec!["register-dns".to_string(), "sync-time".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_run_requires_user_and_password_together() {
        let result = parse_args_from_vec(&args(&["domjoin-ctl", "run", "--user", "admin"]));
        assert!(result.unwrap_err().contains("must be given together"));
    }

    #[test]
    fn test_parse_run_unknown_flag() {
        let result = parse_args_from_vec(&args(&["domjoin-ctl", "run", "--dry-run"]));
        assert!(result.unwrap_err().contains("Unknown argument: --dry-run"));
    }

    #[test]
    fn test_read_password_strips_trailing_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"s3cret pass\n").unwrap();
        let password = read_password(file.path().to_str().unwrap()).unwrap();
        assert_eq!(password, "s3cret pass");

        assert!(read_password("/nonexistent/bindpw").is_err());
    }
}
