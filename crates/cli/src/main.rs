//! Distillery CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the HTTP API server
//! - `demo`    — Run a scripted scenario and print the distilled memory
//! - `config`  — Print the default configuration file

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "distillery",
    about = "Distillery — long-horizon context distillation engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a scripted demo scenario
    Demo {
        /// Scenario to replay (A or C)
        #[arg(short, long, default_value = "A")]
        scenario: String,

        /// Override the scenario objective
        #[arg(short, long)]
        objective: Option<String>,

        /// Use the configured LLM provider instead of the deterministic agents
        #[arg(long)]
        llm: bool,
    },

    /// Print the default configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { port } => commands::gateway::run(port).await?,
        Commands::Demo {
            scenario,
            objective,
            llm,
        } => commands::demo::run(&scenario, objective, llm).await?,
        Commands::Config => commands::config_cmd::print_default(),
    }

    Ok(())
}
