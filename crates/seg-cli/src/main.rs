use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use seg_core::CancelToken;
use tracing_subscriber::EnvFilter;

use seg_cli::commands::{report, rules, runs, segment};
use seg_cli::{Cli, Commands, Config};

/// Load and validate configuration.
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    config
        .segmenter
        .validate()
        .context("invalid segmenter configuration")?;
    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

/// Cancel `token` on the first Ctrl-C so the partial timeline is still
/// finalized. A second Ctrl-C exits at once.
fn cancel_on_interrupt(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        tracing::warn!("Interrupted, finishing segmentation");
        token.cancel();
    })
    .context("failed to install interrupt handler")
}

/// Open the database, ensuring the parent directory exists.
fn open_database(config: &Config) -> Result<seg_db::Database> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    seg_db::Database::open(&config.database_path).context("failed to open database")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // stdout carries command output only
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let stdout = std::io::stdout();
    let mut writer = stdout.lock();

    match &cli.command {
        Some(Commands::Segment(args)) => {
            let config = load_config(cli.config.as_deref())?;
            let mut db = if args.store {
                Some(open_database(&config)?)
            } else {
                None
            };
            let cancel = CancelToken::new();
            cancel_on_interrupt(&cancel)?;
            segment::run(&mut writer, &config, args, db.as_mut(), &cancel)?;
        }
        Some(Commands::Runs { json }) => {
            let config = load_config(cli.config.as_deref())?;
            let db = open_database(&config)?;
            runs::run(&mut writer, &db, *json)?;
        }
        Some(Commands::Report { run, entity, json }) => {
            let config = load_config(cli.config.as_deref())?;
            let db = open_database(&config)?;
            report::run(&mut writer, &db, run, entity.as_deref(), *json)?;
        }
        Some(Commands::Rules { json }) => {
            let config = load_config(cli.config.as_deref())?;
            rules::run(&mut writer, &config.segmenter.activity_rules, *json)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
