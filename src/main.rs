mod cli;
mod core;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "qbar", about = "LLM provider quota retrieval", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Only query one provider (claude, codex, antigravity)
    #[arg(short, long, global = true)]
    provider: Option<String>,

    /// Drop cached quota data before fetching
    #[arg(short, long, global = true)]
    refresh: bool,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    /// Verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch quota for every provider (the default)
    Usage,
    /// List providers and whether they are available
    Providers,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate default config file
    Init,
    /// Validate config file
    Check,
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("qbar=debug")
        } else {
            EnvFilter::new("qbar=warn")
        }
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let output_opts = cli::output::OutputOptions { pretty: cli.pretty };

    match cli.command {
        None | Some(Commands::Usage) => {
            cli::usage_cmd::run(cli.provider, cli.refresh, &output_opts).await?;
        }
        Some(Commands::Providers) => cli::providers_cmd::run(&output_opts).await?,
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init => cli::config_cmd::init()?,
            ConfigAction::Check => cli::config_cmd::check()?,
        },
    }

    Ok(())
}
