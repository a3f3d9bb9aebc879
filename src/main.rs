//! Devrack: run development commands with persistent logs, then inspect
//! and control them through a CLI or an MCP server.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the optional project configuration, and dispatches to
//! the runner, the registry commands, or the MCP server.

mod config;
mod error;
mod liveness;
mod mcp;
mod project;
mod record;
mod registry;
mod runner;
mod store;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::config::Config;
use crate::liveness::KillSignal;
use crate::mcp::McpServer;
use crate::record::ProcessStatus;
use crate::registry::{CleanArgs, KillArgs, ListArgs, LogsArgs, Registry, ShowArgs, StreamSelect};
use crate::runner::RunOptions;
use crate::store::RecordStore;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Run dev commands with persistent logs and an MCP control server",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a command in the foreground, mirroring its output to logs.
    Run(RunArgs),
    /// Serve the MCP control server over stdin/stdout.
    Mcp,
    /// Inspect and manage recorded processes.
    #[command(subcommand)]
    Ps(PsCommand),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Execute from the project root instead of the current directory.
    #[arg(short, long)]
    workspace: bool,
    /// Do not prepend <project-root>/bin to PATH.
    #[arg(long)]
    no_local_bin: bool,
    /// Path to a devrack.toml (defaults to <project-root>/devrack.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// The command and its arguments; a single argument runs via the shell.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum PsCommand {
    /// List recorded processes, newest first.
    List {
        /// Only show processes with this status.
        #[arg(long, value_enum)]
        status: Option<ProcessStatus>,
        /// Show at most this many records.
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Show one process record with its log sizes.
    Show { process_id: String },
    /// Print the tail of a process's logs.
    Logs {
        process_id: String,
        /// Which stream to read.
        #[arg(long, value_enum, default_value = "both")]
        stream: StreamSelect,
        /// Number of lines from the end (0 or negative for the whole log).
        #[arg(long)]
        lines: Option<i64>,
    },
    /// Send a termination signal to a running process.
    Kill {
        process_id: String,
        /// Signal to send.
        #[arg(long, value_enum)]
        signal: Option<KillSignal>,
    },
    /// Delete process records and their logs.
    Clean {
        /// Remove every record.
        #[arg(long)]
        all: bool,
        /// Remove completed records.
        #[arg(long)]
        completed: bool,
        /// Remove failed records.
        #[arg(long)]
        failed: bool,
        /// Remove records started before this RFC 3339 timestamp.
        #[arg(long)]
        before: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let code = run(args).await?;
            if code != 0 {
                // Negative codes mean the child died to a signal; there is
                // no honest exit code to relay, so fail generically.
                std::process::exit(if code < 0 { 1 } else { code });
            }
            Ok(())
        }
        Commands::Mcp => serve_mcp(),
        Commands::Ps(command) => ps(command),
    }
}

/// Diagnostics go to stderr so stdout stays clean for the MCP stream and
/// for the child command's own output.
fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("DEVRACK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: RunArgs) -> Result<i32> {
    let cwd = std::env::current_dir().context("failed to determine current directory")?;
    let root = project::runner_root(&cwd);
    let config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => config::load_project_config(&root)?,
    };
    let options = resolve_run_options(&args, &config);
    runner::run_command(&args.args, options, &cwd).await
}

// Flags win over config; --no-local-bin exists because local_bin defaults
// on.
fn resolve_run_options(args: &RunArgs, config: &Config) -> RunOptions {
    RunOptions {
        workspace: args.workspace || config.workspace.unwrap_or(false),
        local_bin: if args.no_local_bin {
            false
        } else {
            config.local_bin.unwrap_or(true)
        },
    }
}

fn serve_mcp() -> Result<()> {
    let registry = open_registry()?;
    let server = McpServer::new(registry);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    server.serve(stdin.lock(), stdout.lock())
}

fn ps(command: PsCommand) -> Result<()> {
    let registry = open_registry()?;
    match command {
        PsCommand::List { status, limit } => {
            print_json(&registry.list(ListArgs { status, limit })?)
        }
        PsCommand::Show { process_id } => print_json(&registry.show(ShowArgs { process_id })?),
        PsCommand::Logs {
            process_id,
            stream,
            lines,
        } => print_json(&registry.logs(LogsArgs {
            process_id,
            stream,
            lines,
        })?),
        PsCommand::Kill { process_id, signal } => {
            print_json(&registry.kill(KillArgs { process_id, signal })?)
        }
        PsCommand::Clean {
            all,
            completed,
            failed,
            before,
        } => {
            if !all && !completed && !failed && before.is_none() {
                bail!("nothing selected; pass --all, --completed, --failed, or --before");
            }
            print_json(&registry.clean(CleanArgs {
                all,
                completed,
                failed,
                before,
            })?)
        }
    }
}

/// Finds the enclosing project's record store and applies its config.
fn open_registry() -> Result<Registry> {
    let store = RecordStore::discover()?;
    let config = match store.data_dir().parent() {
        Some(root) => config::load_project_config(root)?,
        None => Config::default(),
    };
    let mut registry = Registry::new(store);
    registry.set_log_defaults(config.tail_lines, config.strip_ansi);
    Ok(registry)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_trailing_args() {
        let cli = Cli::try_parse_from(["devrack", "run", "-w", "cargo", "build", "--release"])
            .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert!(args.workspace);
                assert!(!args.no_local_bin);
                assert_eq!(args.args, vec!["cargo", "build", "--release"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["devrack", "run"]).is_err());
    }

    #[test]
    fn ps_logs_defaults_to_both_streams() {
        let cli = Cli::try_parse_from(["devrack", "ps", "logs", "abc123"]).unwrap();
        match cli.command {
            Commands::Ps(PsCommand::Logs { stream, lines, .. }) => {
                assert_eq!(stream, StreamSelect::Both);
                assert!(lines.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn kill_accepts_signal_names() {
        let cli = Cli::try_parse_from([
            "devrack", "ps", "kill", "abc123", "--signal", "SIGKILL",
        ])
        .unwrap();
        match cli.command {
            Commands::Ps(PsCommand::Kill { signal, .. }) => {
                assert_eq!(signal, Some(KillSignal::Sigkill));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn flags_override_config() {
        let config = Config {
            workspace: Some(false),
            local_bin: Some(true),
            ..Config::default()
        };
        let args = RunArgs {
            workspace: true,
            no_local_bin: true,
            config: None,
            args: vec!["true".to_string()],
        };
        let options = resolve_run_options(&args, &config);
        assert!(options.workspace);
        assert!(!options.local_bin);
    }

    #[test]
    fn config_fills_unset_flags() {
        let config = Config {
            workspace: Some(true),
            local_bin: None,
            ..Config::default()
        };
        let args = RunArgs {
            workspace: false,
            no_local_bin: false,
            config: None,
            args: vec!["true".to_string()],
        };
        let options = resolve_run_options(&args, &config);
        assert!(options.workspace);
        assert!(options.local_bin);
    }
}
