mod cli;
mod commands;
mod config;
mod ui;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use config::Config;

/// Global context for the application
pub struct Context {
    pub quiet: bool,
    pub config: Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    if cli.no_color || !config.color {
        colored::control::set_override(false);
    }

    let ctx = Context {
        quiet: cli.quiet,
        config,
    };

    let result = match &cli.command {
        Command::Verify { snapshot } => commands::verify::run(&ctx, snapshot),
        Command::Replay(args) => commands::replay::run(&ctx, args),
        Command::Show(args) => commands::show::run(&ctx, &args.snapshot, args.format),
        Command::Summary { journal } => commands::summary::run(&ctx, journal),
    };

    if let Err(e) = result {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
    Ok(())
}
