//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use sd_domain::config::Config;

#[derive(Parser)]
#[command(name = "spritedeck", version, about = "Agent session orchestration gateway")]
pub struct Cli {
    /// Path to config.toml (defaults are used when absent).
    #[arg(long, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway server (the default).
    Serve,
    /// Print the effective configuration and exit.
    ConfigShow,
}

pub fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    let config = Config::load(Some(path.as_path()))?;
    Ok(config)
}
