use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "upgrade", about = "Experiment assignment for A/B tests")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, edit and inspect experiments
    Experiment(commands::experiment::ExperimentArgs),
    /// Inspect decision points
    Partition(commands::partition::PartitionArgs),
    /// Inspect experiment conditions
    Condition(commands::condition::ConditionArgs),
    /// Resolve a user at one decision point
    Resolve(commands::resolve::ResolveArgs),
    /// List a user's assignments across a context
    Assignments(commands::assignments::AssignmentsArgs),
    /// Manage explicit per-user assignments
    Override(commands::overrides::OverrideArgs),
    /// Manage preview users
    Preview(commands::preview::PreviewArgs),
    /// Manage configuration
    Config(commands::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Experiment(args) => commands::experiment::run(args).await,
        Commands::Partition(args) => commands::partition::run(args).await,
        Commands::Condition(args) => commands::condition::run(args).await,
        Commands::Resolve(args) => commands::resolve::run(args).await,
        Commands::Assignments(args) => commands::assignments::run(args).await,
        Commands::Override(args) => commands::overrides::run(args).await,
        Commands::Preview(args) => commands::preview::run(args).await,
        Commands::Config(args) => commands::config::run(args),
    }
}
