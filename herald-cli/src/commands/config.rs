use std::path::Path;

use crate::config::{ConfigLoader, RawHeraldConfig};
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration (merged)
    Show,
    /// Show configuration file paths
    Path,
}

pub fn run(args: ConfigArgs, explicit: Option<&Path>, overrides: RawHeraldConfig) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show_config(explicit, overrides),
        ConfigCommands::Path => show_paths(explicit),
    }
}

fn show_config(explicit: Option<&Path>, overrides: RawHeraldConfig) -> Result<()> {
    let config = ConfigLoader::load(explicit, overrides)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{}", toml_str);
    Ok(())
}

fn show_paths(explicit: Option<&Path>) -> Result<()> {
    println!("User config:    {:?}", ConfigLoader::user_config_path());
    match explicit {
        Some(path) => println!("Project config: {:?} (--config)", path),
        None => println!("Project config: {:?}", ConfigLoader::project_config_path()),
    }
    Ok(())
}
