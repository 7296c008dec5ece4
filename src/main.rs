use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conveyor::config::{ConveyorConfig, DEFAULT_CONFIG_FILE};

mod cmd;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Build orchestrator for interdependent configurations")]
pub struct Cli {
    /// Path to conveyor.toml
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Expand the dependency graph of a configuration and print its build waves
    Plan {
        /// Root configuration id
        root: String,

        /// Plan dependencies even when they already have a successful build
        #[arg(long)]
        rebuild_dependencies: bool,
    },
    /// Build a configuration and everything it depends on
    Build {
        /// Root configuration id
        root: String,

        /// Maximum concurrent builds (overrides scheduler.max_parallel)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Build dependencies even when they already have a successful build
        #[arg(long)]
        rebuild_dependencies: bool,

        /// Artifact store URL (overrides store.base_url)
        #[arg(long)]
        store_url: Option<String>,
    },
    /// List stored build records
    Records {
        /// Configuration id
        configuration: Option<String>,

        /// List every record of a project instead
        #[arg(long, conflicts_with = "configuration")]
        project: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default conveyor.toml
    Init,
}

/// Load the config file, then apply environment overrides. Relative paths are
/// taken from the config file's directory.
fn load_config(path: &std::path::Path) -> Result<ConveyorConfig> {
    let mut config = ConveyorConfig::load_or_default(path)?.with_env_overrides()?;
    if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        config.resolve_paths(base);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config, command.clone());
    }

    let mut config = load_config(&cli.config)?;
    let _logging = conveyor::logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Plan {
            root,
            rebuild_dependencies,
        } => {
            config.scheduler.rebuild_dependencies |= *rebuild_dependencies;
            cmd::cmd_plan(&config, root).await?;
        }
        Commands::Build {
            root,
            max_parallel,
            rebuild_dependencies,
            store_url,
        } => {
            if let Some(max) = max_parallel {
                config.scheduler.max_parallel = *max;
            }
            if let Some(url) = store_url {
                config.store.base_url = url.clone();
            }
            config.scheduler.rebuild_dependencies |= *rebuild_dependencies;
            cmd::cmd_build(&config, root).await?;
        }
        Commands::Records {
            configuration,
            project,
        } => {
            cmd::cmd_records(&config, configuration.as_deref(), project.as_deref()).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
