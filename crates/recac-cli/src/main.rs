//! recac — autonomous software-delivery control plane.
//!
//! `recac run` drives a foreground session for one project; `recac session`
//! manages detached background runs. Exit codes distinguish the terminal
//! outcomes so wrappers can react: 2 iteration budget, 3 no-op breaker,
//! 4 stalled breaker, 5 blocker, 130 cancelled.

use clap::{Parser, Subcommand};
use recac_core::config::{ModelProvider, RecacConfig};
use recac_core::{RecacError, RecacResult, SystemClock};
use recac_manager::SessionManager;
use recac_model::{ClaudeClient, ModelClient, OpenRouterClient};
use recac_notify::{NoopNotifier, Notifier, SlackNotifier};
use recac_sandbox::env::filtered_process_env;
use recac_sandbox::{DockerSandbox, LocalSandbox, Sandbox};
use recac_session::{Session, SessionDeps};
use recac_store::SqliteStore;
use recac_vcs::GitVcs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recac", about = "recac — autonomous software-delivery control plane")]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, default_value = "recac.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a foreground session for a project.
    Run {
        /// Project identifier (overrides config).
        #[arg(long)]
        project: Option<String>,
        /// Workspace directory (overrides config).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Number of parallel coding agents (overrides config).
        #[arg(long)]
        max_agents: Option<usize>,
        /// Skip the QA gate.
        #[arg(long)]
        skip_qa: bool,
        /// Run commands on the host instead of a container.
        #[arg(long)]
        local_sandbox: bool,
    },
    /// Manage background sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a detached background session.
    Start {
        /// Session name ([A-Za-z0-9_.-]).
        name: String,
        /// What the session should achieve.
        #[arg(long, default_value = "")]
        goal: String,
        /// Workspace directory.
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// The command to run, after `--`.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// List background sessions.
    List,
    /// Stop a session (SIGTERM; idempotent).
    Stop { name: String },
    /// Pause a running session (SIGSTOP).
    Pause { name: String },
    /// Resume a paused session (SIGCONT).
    Resume { name: String },
    /// Remove a session's files.
    Remove {
        name: String,
        /// Required to remove a live session.
        #[arg(long)]
        force: bool,
    },
    /// Archive a finished session.
    Archive { name: String },
    /// Restore an archived session.
    Unarchive { name: String },
    /// Rename a finished session.
    Rename { old: String, new: String },
    /// Print the path of a session's log file.
    Logs { name: String },
    /// Show the diff stat between a session's start and end commits.
    Diff { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "recac failed");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Map terminal errors to stable exit codes for wrappers.
fn exit_code(err: &RecacError) -> u8 {
    match err {
        RecacError::MaxIterations(_) => 2,
        RecacError::NoOp(_) => 3,
        RecacError::Stalled(_) => 4,
        RecacError::Blocker(_) => 5,
        RecacError::Cancelled => 130,
        _ => 1,
    }
}

async fn dispatch(cli: Cli) -> RecacResult<()> {
    match cli.command {
        Commands::Run {
            project,
            workspace,
            max_agents,
            skip_qa,
            local_sandbox,
        } => {
            let mut config = RecacConfig::load_or_default(&cli.config)?;
            if let Some(project) = project {
                config.project = project;
            }
            if let Some(workspace) = workspace {
                config.workspace = workspace;
            }
            if let Some(max_agents) = max_agents {
                config.max_agents = max_agents;
            }
            if skip_qa {
                config.skip_qa = true;
            }
            if local_sandbox {
                config.sandbox.local = true;
            }
            config.validate()?;
            run_session(config).await
        }
        Commands::Session { action } => session_command(action).await,
    }
}

async fn run_session(config: RecacConfig) -> RecacResult<()> {
    let store = Arc::new(SqliteStore::open(config.workspace.join(".recac.db")).await?);

    let model: Arc<dyn ModelClient> = match config.model.provider {
        ModelProvider::Claude => Arc::new(ClaudeClient::new(config.model.clone())?),
        ModelProvider::OpenRouter => Arc::new(OpenRouterClient::new(config.model.clone())?),
    };

    let env = filtered_process_env(&config.project);
    let sandbox: Arc<dyn Sandbox> = if config.sandbox.local {
        Arc::new(LocalSandbox::new(config.workspace.clone(), env))
    } else {
        Arc::new(DockerSandbox::new(
            config.sandbox.clone(),
            config.workspace.clone(),
            config.project.clone(),
            env,
        )?)
    };

    let notifier: Arc<dyn Notifier> = match &config.slack {
        Some(slack) => Arc::new(SlackNotifier::new(slack.channel.clone())?),
        None => Arc::new(NoopNotifier),
    };

    let deps = SessionDeps {
        store,
        model,
        sandbox,
        vcs: Arc::new(GitVcs::new(config.workspace.clone())),
        notifier,
        clock: Arc::new(SystemClock),
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling session");
            ctrl_c_cancel.cancel();
        }
    });

    let session = Session::new(config, deps).with_cancel(cancel);
    session.run().await
}

async fn session_command(action: SessionAction) -> RecacResult<()> {
    let manager = SessionManager::new()?;
    match action {
        SessionAction::Start {
            name,
            goal,
            workspace,
            command,
        } => {
            let state = manager
                .start_session(&name, &goal, command, &workspace)
                .await?;
            println!("started '{}' (pid {})", state.name, state.pid);
        }
        SessionAction::List => {
            for state in manager.list()? {
                println!(
                    "{:<24} {:<10} pid={:<8} {}",
                    state.name, state.status, state.pid, state.goal
                );
            }
        }
        SessionAction::Stop { name } => {
            let state = manager.stop(&name).await?;
            println!("'{}' is {}", state.name, state.status);
        }
        SessionAction::Pause { name } => {
            let state = manager.pause(&name)?;
            println!("'{}' is {}", state.name, state.status);
        }
        SessionAction::Resume { name } => {
            let state = manager.resume(&name)?;
            println!("'{}' is {}", state.name, state.status);
        }
        SessionAction::Remove { name, force } => {
            manager.remove(&name, force)?;
            println!("removed '{name}'");
        }
        SessionAction::Archive { name } => {
            manager.archive(&name)?;
            println!("archived '{name}'");
        }
        SessionAction::Unarchive { name } => {
            manager.unarchive(&name)?;
            println!("restored '{name}'");
        }
        SessionAction::Rename { old, new } => {
            manager.rename(&old, &new)?;
            println!("renamed '{old}' to '{new}'");
        }
        SessionAction::Logs { name } => {
            println!("{}", manager.logs(&name)?.display());
        }
        SessionAction::Diff { name } => {
            let state = manager.load(&name)?;
            let vcs = GitVcs::new(&state.workspace);
            println!("{}", manager.diff_stat(&name, &vcs).await?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(exit_code(&RecacError::MaxIterations(200)), 2);
        assert_eq!(exit_code(&RecacError::NoOp(3)), 3);
        assert_eq!(exit_code(&RecacError::Stalled(50)), 4);
        assert_eq!(exit_code(&RecacError::Blocker("stuck".into())), 5);
        assert_eq!(exit_code(&RecacError::Cancelled), 130);
        assert_eq!(exit_code(&RecacError::Config("bad".into())), 1);
    }

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::parse_from([
            "recac",
            "run",
            "--project",
            "demo",
            "--max-agents",
            "4",
            "--skip-qa",
        ]);
        match cli.command {
            Commands::Run {
                project,
                max_agents,
                skip_qa,
                ..
            } => {
                assert_eq!(project.as_deref(), Some("demo"));
                assert_eq!(max_agents, Some(4));
                assert!(skip_qa);
            }
            Commands::Session { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parses_session_start_with_command() {
        let cli = Cli::parse_from([
            "recac", "session", "start", "nightly", "--goal", "ship it", "--", "recac", "run",
        ]);
        match cli.command {
            Commands::Session {
                action: SessionAction::Start { name, goal, command, .. },
            } => {
                assert_eq!(name, "nightly");
                assert_eq!(goal, "ship it");
                assert_eq!(command, vec!["recac", "run"]);
            }
            _ => panic!("expected session start"),
        }
    }
}
