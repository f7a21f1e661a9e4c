//! Main CLI application structure

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

use super::output::{Output, OutputFormat};
use super::{apply, logging, query};
use crate::domain::StackName;
use crate::storage::{Config, LogFormat, Project};

#[derive(Parser)]
#[command(name = "stackctl")]
#[command(author, version, about = "Dependency-ordered infrastructure stacks")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format (defaults to the global config, then text)
    #[arg(long, short = 'f', global = true)]
    pub format: Option<OutputFormat>,

    /// Enable debug logging on stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Log line format (text or json)
    #[arg(long, global = true, env = "STACKCTL_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Environment to operate on, overriding config.toml
    #[arg(long, short = 'e', global = true, env = "STACKCTL_ENV")]
    pub env: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new stackctl project
    Init {
        /// Path to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: String,

        /// Also write the sample AWS topology
        #[arg(long)]
        sample: bool,
    },

    /// List declared stacks
    Stacks,

    /// Show the dependency graph in execution order
    Graph,

    /// Show what applying a stack would change
    Plan {
        stack: StackName,
    },

    /// Apply stacks in dependency order
    Apply {
        /// Stacks to apply
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        stacks: Vec<StackName>,

        /// Apply every declared stack
        #[arg(long)]
        all: bool,

        /// Skip confirmation prompts
        #[arg(long, short = 'y')]
        yes: bool,

        /// Per-stack timeout in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,

        /// Maximum number of stacks applied concurrently
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Show the published outputs of a stack
    Outputs {
        stack: StackName,
    },

    /// Show applied generation and drift for every stack
    Status,

    /// Show recorded run outcomes
    History {
        /// Only entries for this stack
        #[arg(long)]
        stack: Option<StackName>,

        /// Maximum number of entries
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// Main entry point for the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // Config is best-effort here: only formatting defaults depend on it, and
    // commands that need a project open it themselves and report errors.
    let config = Config::load().ok();
    let global = config.as_ref().map(|c| c.global.clone()).unwrap_or_default();
    let project_logging = config
        .as_ref()
        .filter(|c| c.is_in_project())
        .map(|c| c.project.logging.clone())
        .unwrap_or_default();

    let log_format = cli
        .log_format
        .or(project_logging.format)
        .or(global.log_format)
        .unwrap_or_default();
    logging::init(log_format, cli.verbose, project_logging.filter.as_deref());

    let format = cli.format.unwrap_or_else(|| global.default_format.into());
    let output = Output::new(format);
    let env = cli.env.as_deref();

    debug!(command = command_name(&cli.command), "stackctl starting");

    match cli.command {
        Commands::Init { path, sample } => {
            let project = Project::init(&path, sample)?;
            debug!(dir = %project.stackctl_dir().display(), "initialized");
            let message = if sample {
                format!(
                    "Initialized stackctl project at {} with {} sample stacks",
                    project.root().display(),
                    project.stacks()?.len()
                )
            } else {
                format!("Initialized stackctl project at {}", project.root().display())
            };
            output.success(&message);
        }

        Commands::Stacks => query::stacks(&output, env)?,
        Commands::Graph => query::graph(&output, env)?,
        Commands::Plan { stack } => apply::plan(&output, env, &stack)?,

        Commands::Apply {
            stacks,
            all,
            yes,
            timeout,
            max_parallel,
        } => {
            let args = apply::ApplyArgs {
                stacks,
                all,
                yes,
                timeout,
                max_parallel,
            };
            apply::apply(&output, env, args)?
        }

        Commands::Outputs { stack } => query::outputs(&output, env, &stack)?,
        Commands::Status => query::status(&output, env)?,
        Commands::History { stack, limit } => query::history(&output, env, stack.as_ref(), limit)?,
    }

    debug!("command completed");
    Ok(())
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Init { .. } => "init",
        Commands::Stacks => "stacks",
        Commands::Graph => "graph",
        Commands::Plan { .. } => "plan",
        Commands::Apply { .. } => "apply",
        Commands::Outputs { .. } => "outputs",
        Commands::Status => "status",
        Commands::History { .. } => "history",
    }
}

/// Opens the current project, applying an environment override
pub(super) fn open_project(env: Option<&str>) -> Result<Project> {
    let mut project = Project::open_current()?;
    if let Some(env) = env {
        project.config_mut().project.environment = env.to_string();
        project.config().project.validate()?;
    }
    debug!(root = %project.root().display(), environment = project.environment(), "opened project");
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn apply_requires_stack_or_all() {
        assert!(Cli::try_parse_from(["stackctl", "apply"]).is_err());
        assert!(Cli::try_parse_from(["stackctl", "apply", "vpc", "--all"]).is_err());

        let cli = Cli::try_parse_from(["stackctl", "apply", "--all", "--timeout", "5"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Apply { all: true, timeout: Some(5), .. }
        ));
    }

    #[test]
    fn stack_names_are_validated() {
        assert!(Cli::try_parse_from(["stackctl", "plan", "users-api"]).is_ok());
        assert!(Cli::try_parse_from(["stackctl", "plan", "bad/name"]).is_err());
    }
}
