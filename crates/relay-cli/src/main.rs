mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relay_core::types::TaskStatus;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// relay -- run, watch and recover agent tasks from a terminal.
#[derive(Parser)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Config file (defaults to ~/.relay/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task end-to-end, streaming its progress.
    Run {
        /// Project the task belongs to.
        #[arg(long)]
        project: PathBuf,
        /// Spec id, e.g. `001-add-login`.
        #[arg(long)]
        spec: String,
        /// Task description; used to create the spec when none exists yet.
        #[arg(long)]
        description: Option<String>,
        /// Allow parallel chunk execution.
        #[arg(long)]
        parallel: bool,
    },

    /// Recover a task whose agent process went away.
    Recover {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        spec: String,
        /// Status to recover to instead of the inferred one.
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Start execution again right after recovering.
        #[arg(long)]
        auto_restart: bool,
    },

    /// Show the persisted plan of a task.
    Status {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        spec: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    relay_telemetry::logging::init(
        "relay-cli",
        &config.general.log_level,
        relay_telemetry::logging::LogFormat::from_config(&config.general.log_format),
    );

    match cli.command {
        Commands::Run {
            project,
            spec,
            description,
            parallel,
        } => {
            let mut config = config;
            config.execution.parallel_enabled |= parallel;
            commands::run::run(config, &project, &spec, description.as_deref()).await?;
        }
        Commands::Recover {
            project,
            spec,
            status,
            auto_restart,
        } => {
            commands::recover::run(config, &project, &spec, status, auto_restart).await?;
        }
        Commands::Status { project, spec } => {
            commands::status::run(&config, &project, &spec)?;
        }
    }

    Ok(())
}
