mod commands;
mod config;
mod docker;
mod ports;
mod registry;
mod services;
mod shell;
mod update;
mod util;

use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;

use crate::commands::{CommandContext, Verb};
use crate::config::Config;
use crate::registry::ContainerRegistry;
use crate::shell::ShellRunner;

#[derive(Debug, Parser)]
#[command(name = "apikit", version, about = "Developer workflow CLI for containerized API apps")]
struct Cli {
    #[command(subcommand)]
    verb: Verb,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    // Project-local .env, if any, before the config is read.
    let _ = dotenvy::dotenv();

    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{}", style(format!("cannot resolve working directory: {e}")).red());
            std::process::exit(1);
        }
    };

    let config = Config::load(&cwd);
    let registry = ContainerRegistry::for_app(&config.app);
    let mut ctx = CommandContext {
        config,
        registry,
        runner: ShellRunner,
        cwd,
    };

    // Operator interrupt exits quietly, no stack trace. A scoped service
    // caught mid-subprocess may be left behind; `apikit stop` picks it up
    // from the registry file.
    let outcome = tokio::select! {
        result = commands::run(&mut ctx, &cli.verb) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    if let Err(e) = outcome {
        eprintln!("{}", style(format!("error: {e:#}")).red());
        std::process::exit(1);
    }
}
