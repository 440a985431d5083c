//! Pedalera CLI - run and exercise the pedalera engine from the shell.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pedalera")]
#[command(author, version, about = "Pedalera guitar-effects engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine live (on the dummy device unless a backend is wired in)
    Run(commands::run::RunArgs),

    /// Render a WAV file offline through a pedalboard preset
    Render(commands::render::RenderArgs),

    /// List the plugins the engine can host
    Plugins(commands::plugins::PluginsArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Render(args) => commands::render::run(args),
        Commands::Plugins(args) => commands::plugins::run(args),
    }
}
