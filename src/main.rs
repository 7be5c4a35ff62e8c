use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use openafpm_web::config::read_config;
use openafpm_web::engine::StagedEngine;
use openafpm_web::{RunOptions, web};

#[derive(Parser, Debug)]
#[command(version, author, about)]
struct Args {
    /// Listen on this port (instead of the configured default).
    #[arg(short, long)]
    port: Option<u16>,

    /// Read settings from this TOML file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    fern::Dispatch::new()
        .level(LevelFilter::Warn)
        .level_for(
            "openafpm_web",
            if args.debug {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            },
        )
        .chain(std::io::stderr())
        .apply()?;

    let settings = read_config(args.config.as_deref())?;
    let options = RunOptions {
        settings,
        port: args.port,
        debug: args.debug,
    };

    web::run_web(options, Arc::new(StagedEngine::default()))
}
