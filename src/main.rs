// src/main.rs

use anyhow::Result;
use clap::Parser;

use jjpatch::RunMode;

mod cli;
mod commands;

use cli::{CacheCommands, Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let exit_code = match cli.command {
        Some(Commands::Decrypt { image, workdir }) => commands::run_pipeline(
            RunMode::Decrypt,
            image,
            workdir,
            None,
            config,
            cli.quiet,
        )?,
        Some(Commands::Modify {
            image,
            workdir,
            output,
        }) => commands::run_pipeline(
            RunMode::Modify,
            image,
            workdir,
            Some(output),
            config,
            cli.quiet,
        )?,
        Some(Commands::Cache { command }) => {
            match command {
                CacheCommands::List => commands::cache_list(config)?,
                CacheCommands::Clear => commands::cache_clear(config)?,
            }
            0
        }
        Some(Commands::Check) => commands::check_prerequisites()?,
        None => {
            println!("jjpatch v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'jjpatch --help' for usage information");
            0
        }
    };

    std::process::exit(exit_code);
}
