//! Command-line front end for stackflow.
//!
//! Deploys a stack-set manifest against a local, file-backed simulation of
//! the provisioning API, export registry, and parameter store.

mod commands;
mod local;

use clap::{Parser, Subcommand};
use commands::{Outcome, Workspace};
use stackflow::errors::{ErrorKind, StackflowError};
use stackflow::observability::{init_tracing, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "stackflow", version, about = "Deploy interdependent infrastructure stacks")]
struct Cli {
    /// Stack-set manifest.
    #[arg(long, global = true, default_value = "stack-set.json")]
    stack_set: PathBuf,

    /// Environment whose region and values apply.
    #[arg(long = "env", global = true)]
    environment: Option<String>,

    /// Directory holding local state.
    #[arg(long, global = true, default_value = ".stackflow")]
    state_dir: PathBuf,

    /// Template source tree.
    #[arg(long, global = true, default_value = "templates")]
    templates: PathBuf,

    /// Orchestrator config file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Maximum stacks applied at once.
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Log output format.
    #[arg(long, global = true, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Publish every template under the template tree.
    Publish,
    /// Create the stack set.
    Create,
    /// Update the stack set in place.
    Update,
    /// Preview changes as change sets.
    Changeset {
        /// Execute the change sets after previewing.
        #[arg(long)]
        execute: bool,
        /// Approve every change set without asking.
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Delete the stack set.
    Delete,
    /// Write a new version of an external parameter.
    PutParameter {
        /// Parameter path.
        name: String,
        /// Parameter value.
        value: String,
    },
}

impl Cli {
    fn workspace(&self) -> Workspace {
        Workspace {
            stack_set: self.stack_set.clone(),
            environment: self.environment.clone(),
            state_dir: self.state_dir.clone(),
            templates: self.templates.clone(),
            config: self.config.clone(),
            max_concurrency: self.concurrency,
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<Outcome> {
    let workspace = cli.workspace();
    match &cli.command {
        Commands::Publish => commands::publish(&workspace).await,
        Commands::Create => commands::create(&workspace).await,
        Commands::Update => commands::update(&workspace).await,
        Commands::Changeset { execute, yes } => commands::changeset(&workspace, *execute, *yes).await,
        Commands::Delete => commands::delete(&workspace).await,
        Commands::PutParameter { name, value } => commands::put_parameter(&workspace, name, value),
    }
}

/// Invalid input exits with 2, failed runs and other errors with 1.
fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<StackflowError>().map(StackflowError::kind) {
        Some(ErrorKind::Graph | ErrorKind::Manifest) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(&cli).await {
        Ok(Outcome::Succeeded) => ExitCode::SUCCESS,
        Ok(Outcome::Failed) => ExitCode::from(1),
        Err(err) => {
            tracing::error!(error = %err, "Command failed");
            eprintln!("error: {err:#}");
            exit_code(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use stackflow::errors::GraphError;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_changeset() {
        let cli = Cli::parse_from(["stackflow", "--env", "prod", "changeset", "--execute", "-y"]);
        assert_eq!(cli.environment.as_deref(), Some("prod"));
        assert!(matches!(cli.command, Commands::Changeset { execute: true, yes: true }));
        assert_eq!(cli.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_validation_errors_exit_2() {
        let err = anyhow::Error::new(StackflowError::from(GraphError::CycleDetected {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        }));
        assert_eq!(exit_code(&err), ExitCode::from(2));
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), ExitCode::from(1));
    }
}
