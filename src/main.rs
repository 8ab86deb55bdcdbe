use clap::{Parser, Subcommand};

use librarium::commands::{cleanup, config_cmd, doctor, groups, init, ls, run, status};

/// librarium: one research query, many providers, one deduplicated record.
#[derive(Parser)]
#[command(
    name = "librarium",
    version,
    about = "Fan a research query out to many search providers in parallel"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a query to the selected providers.
    Run(run::RunArgs),
    /// Show async task handles; optionally wait and retrieve.
    Status(status::StatusArgs),
    /// List registered providers.
    Ls,
    /// List or edit named provider groups.
    Groups {
        #[command(subcommand)]
        cmd: Option<groups::GroupsCmd>,
    },
    /// Write a starter project config.
    Init(init::InitArgs),
    /// Check config files, API keys, and provider connectivity.
    Doctor,
    /// Print the merged or global configuration.
    Config(config_cmd::ConfigArgs),
    /// Delete old run directories.
    Cleanup(cleanup::CleanupArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => run::exec(args).await,
        Commands::Status(args) => status::exec(args).await,
        Commands::Ls => ls::exec().await,
        Commands::Groups { cmd } => groups::exec(cmd).await,
        Commands::Init(args) => init::exec(args).await,
        Commands::Doctor => doctor::exec().await,
        Commands::Config(args) => config_cmd::exec(args).await,
        Commands::Cleanup(args) => cleanup::exec(args).await,
    };
    std::process::exit(code);
}
