//! Ferrule CLI entrypoint.

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "ferrule")]
#[command(author, version, about = "Ferrule pipeline orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so JSON output on stdout stays parseable.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = match CliConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Ignoring unreadable config");
            CliConfig::default()
        }
    };

    match cli.command {
        Commands::Validate { path } => handlers::validate(&config, path)?,
        Commands::Plan {
            path,
            event,
            format,
        } => handlers::plan(&config, path, event, format)?,
        Commands::Run {
            path,
            event,
            secrets_file,
            workspace,
            format,
        } => {
            let succeeded =
                handlers::run(&config, path, event, secrets_file, workspace, format).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
            ConfigCommands::Path => handlers::config_path()?,
        },
    }

    Ok(())
}
